//! Activity scanner: coarse hourly sweep for locations with dense activity.

use futures::{Stream, StreamExt as _, stream};
use tracing::debug;

use crate::{
  Result,
  config::DetectionConfig,
  interval::{CandidateWindow, Interval},
  store::{KillmailStore, query},
};

/// Outcome of scanning one stride. A failed stride does not end the sweep;
/// the caller decides whether to skip it or abort.
#[derive(Debug)]
pub struct StrideScan {
  /// The query window, i.e. the stride widened by the look-around.
  pub window: Interval,
  pub result: Result<Vec<CandidateWindow>>,
}

pub struct ActivityScanner<'a, K> {
  store:  &'a K,
  config: &'a DetectionConfig,
}

impl<'a, K: KillmailStore> ActivityScanner<'a, K> {
  pub fn new(store: &'a K, config: &'a DetectionConfig) -> Self { Self { store, config } }

  /// Query windows for every stride in `range`, in chronological order.
  pub fn windows(&self, range: Interval) -> impl Iterator<Item = Interval> + use<K> {
    let stride = self.config.stride();
    let look_around = self.config.look_around();
    std::iter::successors(Some(range.start), move |s| Some(*s + stride))
      .take_while(move |s| *s < range.end)
      .map(move |s| Interval { start: s - look_around, end: s + look_around })
  }

  /// Locations in `window` meeting `min_density`, densest first, ties by id.
  pub async fn scan_window(&self, window: Interval) -> Result<Vec<CandidateWindow>> {
    let counts = query(
      self.config.query_timeout(),
      self.store.count_by_location(window.start, window.end),
    )
    .await?;

    let mut candidates: Vec<CandidateWindow> = counts
      .into_iter()
      .filter(|(_, count)| *count >= self.config.min_density)
      .map(|(location_id, record_count)| CandidateWindow { location_id, window, record_count })
      .collect();
    candidates.sort_by(|a, b| {
      b.record_count
        .cmp(&a.record_count)
        .then_with(|| a.location_id.cmp(&b.location_id))
    });

    debug!(
      start = %window.start,
      end = %window.end,
      candidates = candidates.len(),
      "scanned stride"
    );
    Ok(candidates)
  }

  /// Lazily scan every stride of `range`.
  pub fn scan(&self, range: Interval) -> impl Stream<Item = StrideScan> + '_ {
    stream::iter(self.windows(range)).then(move |window| async move {
      StrideScan { window, result: self.scan_window(window).await }
    })
  }
}
