//! Segment refiner: narrows a coarse candidate window to the precise interval
//! of contiguous activity.
//!
//! The window is walked in fixed segments. The first segment meeting
//! `min_segment_density` opens the battle; `fail_run` consecutive quiet
//! segments after that close it at the end of the last active segment. If
//! activity is still high when the walk reaches the search horizon, the
//! horizon grows by `extension_minutes`, up to `max_extensions` times.

use tracing::{debug, warn};

use crate::{
  Result,
  config::DetectionConfig,
  interval::{BattleInterval, CandidateWindow, Interval},
  killmail::{Killmail, LocationId},
  store::{KillmailStore, query},
};

/// A refined interval together with the killmails it covers, so the compiler
/// does not have to query them again.
#[derive(Debug, Clone)]
pub struct RefinedBattle {
  pub interval:  BattleInterval,
  pub killmails: Vec<Killmail>,
}

/// How the segment walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEnd {
  /// `fail_run` quiet segments in a row.
  Quiet,
  /// Reached the search horizon.
  Horizon,
}

pub struct SegmentRefiner<'a, K> {
  store:  &'a K,
  config: &'a DetectionConfig,
}

impl<'a, K: KillmailStore> SegmentRefiner<'a, K> {
  pub fn new(store: &'a K, config: &'a DetectionConfig) -> Self { Self { store, config } }

  pub async fn refine_candidate(&self, candidate: &CandidateWindow) -> Result<Option<RefinedBattle>> {
    self.refine(candidate.location_id, candidate.window).await
  }

  /// Find the battle inside `window` at `location_id`, or `None` when the
  /// activity never qualifies as one.
  pub async fn refine(&self, location_id: LocationId, window: Interval) -> Result<Option<RefinedBattle>> {
    let Some(interval) = self.locate(location_id, window).await? else {
      return Ok(None);
    };

    let killmails = query(
      self.config.query_timeout(),
      self.store.find_in_interval(location_id, interval.start, interval.end),
    )
    .await?;

    if killmails.len() < self.config.min_battle_records {
      debug!(
        location_id,
        start = %interval.start,
        end = %interval.end,
        records = killmails.len(),
        "refined interval below minimum record count"
      );
      return Ok(None);
    }

    Ok(Some(RefinedBattle {
      interval: BattleInterval { location_id, interval },
      killmails,
    }))
  }

  /// The segment walk. Returns the refined interval without fetching its
  /// killmails.
  pub async fn locate(&self, location_id: LocationId, window: Interval) -> Result<Option<Interval>> {
    let step = self.config.segment();
    let timeout = self.config.query_timeout();

    let mut segment = Interval::starting_at(window.start, step);
    let mut horizon = window.end;
    let mut extensions = 0u32;
    let mut battle_start = None;
    let mut quiet_run = 0u32;
    let mut battle_end = None;

    let mut end = WalkEnd::Horizon;
    while segment.end < horizon {
      let count = query(
        timeout,
        self.store.count_at_location(location_id, segment.start, segment.end),
      )
      .await?;
      let active = count >= self.config.min_segment_density;

      if active {
        if battle_start.is_none() {
          battle_start = Some(segment.start);
        }
        quiet_run = 0;
        battle_end = Some(segment.end);
      } else if battle_start.is_some() {
        quiet_run += 1;
      }

      // This is the last segment inside the horizon: keep looking while the
      // fight is still going.
      if active && segment.end + step >= horizon {
        if extensions < self.config.max_extensions {
          horizon += self.config.extension();
          extensions += 1;
          debug!(location_id, horizon = %horizon, extensions, "extended search horizon");
        } else {
          warn!(
            location_id,
            start = ?battle_start,
            extensions,
            "activity still high at the extension cap; closing battle at the horizon"
          );
        }
      }

      if quiet_run >= self.config.fail_run {
        end = WalkEnd::Quiet;
        break;
      }

      segment = segment.shifted(step);
    }

    let Some(start) = battle_start else {
      return Ok(None);
    };
    let end = match end {
      WalkEnd::Quiet => battle_end.unwrap_or(start),
      WalkEnd::Horizon => horizon,
    };

    if end <= start {
      return Ok(None);
    }
    Ok(Some(Interval { start, end }))
  }
}
