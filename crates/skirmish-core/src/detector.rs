//! Job driver: runs scanner, refiner, compiler and merge over a time range.
//!
//! Strides are processed in order. Within a stride, candidate windows are
//! independent and run `workers` at a time; the merge engine serialises the
//! writes that could race.

use std::pin::pin;

use chrono::{DateTime, Utc};
use futures::{StreamExt as _, stream};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
  Result,
  battle::Battle,
  cache::CachedDirectory,
  compiler::compile,
  config::DetectionConfig,
  interval::{CandidateWindow, Interval},
  killmail::Killmail,
  merge::{MergeEngine, MergeOutcome},
  refiner::SegmentRefiner,
  scanner::ActivityScanner,
  store::{BattleStore, KillmailStore, SystemDirectory},
  teams::{assign_teams, choose_seed},
};

/// Counters describing one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
  pub strides:         usize,
  /// Candidate windows reported by the scanner.
  pub candidates:      usize,
  /// Candidates that compiled into a battle.
  pub detected:        usize,
  pub inserted:        usize,
  pub merged:          usize,
  /// Merges where the stored battle already held everything.
  pub unchanged:       usize,
  /// Extra stored battles folded into a merge target because the new
  /// battle bridged them.
  pub conflicts:       usize,
  /// Candidates that turned out not to be battles.
  pub discarded:       usize,
  /// Killmails the compiler rejected as malformed.
  pub malformed:       usize,
  /// Candidates abandoned after a transient store failure.
  pub skipped_windows: usize,
  /// Strides whose density scan failed.
  pub failed_strides:  usize,
}

impl JobSummary {
  fn record(&mut self, outcome: CandidateOutcome) {
    match outcome {
      CandidateOutcome::Discarded => self.discarded += 1,
      CandidateOutcome::Stored { outcome, malformed } => {
        self.detected += 1;
        self.malformed += malformed;
        match outcome {
          MergeOutcome::Inserted { .. } => self.inserted += 1,
          MergeOutcome::Merged { conflicts, .. } => {
            self.merged += 1;
            self.conflicts += conflicts;
          }
          MergeOutcome::Unchanged { .. } => self.unchanged += 1,
        }
      }
    }
  }
}

#[derive(Debug)]
enum CandidateOutcome {
  Discarded,
  Stored { outcome: MergeOutcome, malformed: usize },
}

pub struct Detector<K, B, D> {
  killmails: K,
  battles:   B,
  directory: CachedDirectory<D>,
  config:    DetectionConfig,
  merge:     MergeEngine,
}

impl<K, B, D> Detector<K, B, D>
where
  K: KillmailStore,
  B: BattleStore,
  D: SystemDirectory,
{
  pub fn new(killmails: K, battles: B, directory: D, config: DetectionConfig) -> Self {
    let directory = CachedDirectory::new(
      directory,
      config.reference_cache_capacity,
      config.reference_cache_ttl(),
    );
    let merge = MergeEngine::new(config.top_n, config.query_timeout());
    Self { killmails, battles, directory, config, merge }
  }

  pub fn killmails(&self) -> &K { &self.killmails }

  pub fn battles(&self) -> &B { &self.battles }

  pub fn config(&self) -> &DetectionConfig { &self.config }

  /// Backfill: detect every battle starting in `[start, end)`.
  pub async fn run_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<JobSummary> {
    let range = Interval::new(start, end)?;
    info!(start = %range.start, end = %range.end, "starting detection job");

    let scanner = ActivityScanner::new(&self.killmails, &self.config);
    let mut scans = pin!(scanner.scan(range));
    let mut summary = JobSummary::default();

    while let Some(scan) = scans.next().await {
      summary.strides += 1;
      let candidates = match scan.result {
        Ok(candidates) => candidates,
        Err(e) if self.config.abort_on_window_error => return Err(e),
        Err(e) => {
          warn!(start = %scan.window.start, end = %scan.window.end, error = %e, "skipping stride");
          summary.failed_strides += 1;
          continue;
        }
      };
      summary.candidates += candidates.len();

      let results: Vec<_> = stream::iter(candidates)
        .map(|candidate| async move {
          let result = self.process(&candidate).await;
          (candidate, result)
        })
        .buffer_unordered(self.config.workers.max(1))
        .collect()
        .await;

      for (candidate, result) in results {
        match result {
          Ok(outcome) => summary.record(outcome),
          Err(e) if e.is_transient() && !self.config.abort_on_window_error => {
            warn!(
              location_id = candidate.location_id,
              start = %candidate.window.start,
              error = %e,
              "skipping candidate window"
            );
            summary.skipped_windows += 1;
          }
          Err(e) => return Err(e),
        }
      }

      info!(
        start = %scan.window.start,
        end = %scan.window.end,
        detected = summary.detected,
        "stride done"
      );
    }

    info!(
      strides = summary.strides,
      candidates = summary.candidates,
      detected = summary.detected,
      inserted = summary.inserted,
      merged = summary.merged,
      unchanged = summary.unchanged,
      conflicts = summary.conflicts,
      discarded = summary.discarded,
      malformed = summary.malformed,
      skipped_windows = summary.skipped_windows,
      failed_strides = summary.failed_strides,
      "detection job finished"
    );
    Ok(summary)
  }

  /// The recurring job: the trailing window ending `trailing_lag` ago.
  pub async fn run_trailing(&self) -> Result<JobSummary> { self.run_trailing_at(Utc::now()).await }

  pub async fn run_trailing_at(&self, now: DateTime<Utc>) -> Result<JobSummary> {
    let range = self.trailing_range(now)?;
    self.run_range(range.start, range.end).await
  }

  /// `[now - trailing_days, now - trailing_lag)`.
  pub fn trailing_range(&self, now: DateTime<Utc>) -> Result<Interval> {
    let end = now - chrono::Duration::minutes(self.config.trailing_lag_minutes);
    let start = now - chrono::Duration::days(self.config.trailing_days);
    Interval::new(start, end)
  }

  /// Refine, compile and store one candidate window.
  async fn process(&self, candidate: &CandidateWindow) -> Result<CandidateOutcome> {
    let refiner = SegmentRefiner::new(&self.killmails, &self.config);
    let Some(mut refined) = refiner.refine_candidate(candidate).await? else {
      return Ok(CandidateOutcome::Discarded);
    };
    self.name_ships(&mut refined.killmails).await?;

    let Some(seed) = choose_seed(&refined.killmails, None) else {
      return Ok(CandidateOutcome::Discarded);
    };
    let teams = assign_teams(&refined.killmails, seed);
    let system = self.directory.system(candidate.location_id).await?;
    let compiled = compile(
      &refined.interval,
      &refined.killmails,
      &teams,
      system,
      self.config.top_n,
    );

    if !is_storable(&compiled.battle) {
      debug!(battle_id = %compiled.battle.battle_id, "discarding empty battle");
      return Ok(CandidateOutcome::Discarded);
    }

    let outcome = self.merge.upsert(&self.battles, compiled.battle).await?;
    Ok(CandidateOutcome::Stored { outcome, malformed: compiled.skipped })
  }

  /// Fill in hull names the records left out.
  async fn name_ships(&self, killmails: &mut [Killmail]) -> Result<()> {
    for killmail in killmails {
      let pilots = killmail
        .victim
        .iter_mut()
        .map(|v| &mut v.pilot)
        .chain(killmail.attackers.iter_mut().map(|a| &mut a.pilot));
      for pilot in pilots {
        if pilot.ship_type_name.is_some() {
          continue;
        }
        if let Some(type_id) = pilot.ship_type_id {
          pilot.ship_type_name = self.directory.type_name(type_id).await?;
        }
      }
    }
    Ok(())
  }
}

/// Zero-length or empty battles are never persisted.
fn is_storable(battle: &Battle) -> bool {
  !battle.killmail_ids.is_empty() && battle.duration_secs > 0
}
