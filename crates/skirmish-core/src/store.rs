//! Store traits consumed by the detection pipeline.
//!
//! Backends (e.g. `skirmish-store-sqlite`) implement these; the pipeline only
//! ever talks to the traits. All futures are `Send` so a job can fan out over
//! a multi-threaded runtime.

use std::{collections::BTreeMap, future::Future, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
  Error,
  battle::{Battle, SystemInfo},
  killmail::{EntityId, Killmail, LocationId},
};

// ─── Killmails ───────────────────────────────────────────────────────────────

/// Read-only, time-indexed queries over the killmail feed.
///
/// Implementations should be indexed by time and by `(location, time)`;
/// every method is called many times per job.
pub trait KillmailStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Number of killmails per location with `start <= time < end`.
  fn count_by_location(
    &self,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> impl Future<Output = Result<BTreeMap<LocationId, u64>, Self::Error>> + Send + '_;

  /// Number of killmails at one location with `start <= time < end`.
  fn count_at_location(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// All killmails at one location with `start <= time < end`, ordered by
  /// time then id.
  fn find_in_interval(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Killmail>, Self::Error>> + Send + '_;
}

// ─── Battles ─────────────────────────────────────────────────────────────────

/// Document store for compiled battles.
pub trait BattleStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Every stored battle that includes `location_id` and whose
  /// `[start_time, end_time)` overlaps `[start, end)`, earliest start first.
  fn find_overlapping(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Battle>, Self::Error>> + Send + '_;

  /// Persist a new battle. Fails if the id is already taken.
  fn insert<'a>(
    &'a self,
    battle: &'a Battle,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Replace the stored document for `existing_id` with `merged`.
  fn update_in_place<'a>(
    &'a self,
    existing_id: &'a str,
    merged: &'a Battle,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Replace the document for `target_id` with `merged` and remove the
  /// `absorbed` battles, whose ledgers `merged` already holds, in one write.
  fn absorb<'a>(
    &'a self,
    target_id: &'a str,
    merged: &'a Battle,
    absorbed: &'a [String],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn exists_by_id<'a>(
    &'a self,
    battle_id: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  fn get<'a>(
    &'a self,
    battle_id: &'a str,
  ) -> impl Future<Output = Result<Option<Battle>, Self::Error>> + Send + 'a;
}

// ─── Reference data ──────────────────────────────────────────────────────────

/// Immutable universe data used to label battles.
pub trait SystemDirectory: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn system_info(
    &self,
    location_id: LocationId,
  ) -> impl Future<Output = Result<Option<SystemInfo>, Self::Error>> + Send + '_;

  fn type_name(
    &self,
    type_id: EntityId,
  ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_;
}

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Run a read against a store, failing with [`Error::Timeout`] rather than
/// hanging when the store stalls.
pub(crate) async fn query<T, E, F>(timeout: Duration, fut: F) -> crate::Result<T>
where
  F: Future<Output = Result<T, E>>,
  E: std::error::Error + Send + Sync + 'static,
{
  match tokio::time::timeout(timeout, fut).await {
    Ok(result) => result.map_err(Error::query),
    Err(_) => Err(Error::Timeout(timeout)),
  }
}
