//! Half-open time intervals and the transient window types that flow between
//! the scanner and the refiner.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, killmail::LocationId};

/// A half-open `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
  pub start: DateTime<Utc>,
  pub end:   DateTime<Utc>,
}

impl Interval {
  /// Build an interval, rejecting empty and inverted ranges.
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
    if start >= end {
      return Err(Error::InvalidRange { start, end });
    }
    Ok(Self { start, end })
  }

  /// An interval of `length` starting at `start`.
  pub fn starting_at(start: DateTime<Utc>, length: Duration) -> Self {
    Self { start, end: start + length }
  }

  pub fn duration(&self) -> Duration { self.end - self.start }

  pub fn contains(&self, at: DateTime<Utc>) -> bool {
    self.start <= at && at < self.end
  }

  /// True when the two ranges share at least one instant.
  pub fn overlaps(&self, other: &Interval) -> bool {
    self.start < other.end && other.start < self.end
  }

  /// The smallest interval covering both.
  pub fn union(&self, other: &Interval) -> Interval {
    Interval {
      start: self.start.min(other.start),
      end:   self.end.max(other.end),
    }
  }

  /// Move the whole range forward by `by`.
  pub fn shifted(&self, by: Duration) -> Interval {
    Interval { start: self.start + by, end: self.end + by }
  }
}

/// A coarse window at one location whose activity met the density threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateWindow {
  pub location_id:  LocationId,
  pub window:       Interval,
  pub record_count: u64,
}

/// The refined activity interval for one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleInterval {
  pub location_id: LocationId,
  pub interval:    Interval,
}
