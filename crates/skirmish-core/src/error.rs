//! Error types for `skirmish-core`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::killmail::KillmailId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  /// A read against the killmail or battle store failed.
  #[error("store query failed: {0}")]
  Query(#[source] BoxError),

  #[error("store query timed out after {0:?}")]
  Timeout(Duration),

  /// An insert or in-place update of a battle failed. Never swallowed.
  #[error("battle store write failed: {0}")]
  Write(#[source] BoxError),

  #[error("malformed killmail {killmail_id}: {reason}")]
  MalformedRecord {
    killmail_id: KillmailId,
    reason:      &'static str,
  },

  #[error("invalid time range: {start} is not before {end}")]
  InvalidRange {
    start: DateTime<Utc>,
    end:   DateTime<Utc>,
  },
}

impl Error {
  pub fn query<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Query(Box::new(err))
  }

  pub fn write<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Write(Box::new(err))
  }

  /// Failures worth retrying at the job level.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Query(_) | Self::Timeout(_))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
