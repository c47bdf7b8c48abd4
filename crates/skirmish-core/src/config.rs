//! Detection policy.
//!
//! Every threshold the pipeline uses lives here so operators can tune it from
//! the binary's config file. The defaults reproduce the behaviour the battle
//! reports have always shown.

use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
  // ── Activity scanner ────────────────────────────────────────────────────
  /// Distance between consecutive coarse windows.
  pub stride_minutes:           i64,
  /// Look-around applied on both sides of each stride.
  pub look_around_minutes:      i64,
  /// Minimum killmails per location in a coarse window.
  pub min_density:              u64,

  // ── Segment refiner ─────────────────────────────────────────────────────
  pub segment_minutes:          i64,
  /// Minimum killmails in one segment for it to count as active.
  pub min_segment_density:      u64,
  /// Consecutive quiet segments that close a battle.
  pub fail_run:                 u32,
  /// How far the search horizon grows when activity reaches it.
  pub extension_minutes:        i64,
  /// Upper bound on horizon extensions for one candidate window.
  pub max_extensions:           u32,
  /// Minimum killmails in a refined interval for it to become a battle.
  pub min_battle_records:       usize,

  // ── Compiler ────────────────────────────────────────────────────────────
  /// Length of the `top_*` rankings.
  pub top_n:                    usize,

  // ── Job driver ──────────────────────────────────────────────────────────
  pub query_timeout_secs:       u64,
  /// Candidate windows refined concurrently within one stride.
  pub workers:                  usize,
  /// Abort the whole job on the first failed window instead of skipping it.
  pub abort_on_window_error:    bool,
  pub trailing_days:            i64,
  /// The trailing job stops this far before "now".
  pub trailing_lag_minutes:     i64,

  // ── Reference data ──────────────────────────────────────────────────────
  pub reference_cache_capacity: usize,
  pub reference_cache_ttl_secs: u64,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self {
      stride_minutes:           60,
      look_around_minutes:      60,
      min_density:              10,
      segment_minutes:          5,
      min_segment_density:      5,
      fail_run:                 6,
      extension_minutes:        30,
      max_extensions:           96,
      min_battle_records:       5,
      top_n:                    10,
      query_timeout_secs:       30,
      workers:                  1,
      abort_on_window_error:    false,
      trailing_days:            7,
      trailing_lag_minutes:     60,
      reference_cache_capacity: 10_000,
      reference_cache_ttl_secs: 3600,
    }
  }
}

impl DetectionConfig {
  pub fn stride(&self) -> Duration { Duration::minutes(self.stride_minutes) }

  pub fn look_around(&self) -> Duration { Duration::minutes(self.look_around_minutes) }

  pub fn segment(&self) -> Duration { Duration::minutes(self.segment_minutes) }

  pub fn extension(&self) -> Duration { Duration::minutes(self.extension_minutes) }

  /// Quiet time that ends a battle: `fail_run` segments.
  pub fn quiet_period(&self) -> Duration { self.segment() * self.fail_run as i32 }

  pub fn query_timeout(&self) -> StdDuration { StdDuration::from_secs(self.query_timeout_secs) }

  pub fn reference_cache_ttl(&self) -> StdDuration {
    StdDuration::from_secs(self.reference_cache_ttl_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_config_keeps_defaults() {
    let cfg: DetectionConfig =
      serde_json::from_str(r#"{ "min_density": 25, "workers": 4 }"#).unwrap();
    assert_eq!(cfg.min_density, 25);
    assert_eq!(cfg.workers, 4);
    assert_eq!(cfg.min_segment_density, 5);
    assert_eq!(cfg.quiet_period(), Duration::minutes(30));
  }
}
