//! Error type for `skirmish-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  /// A battle with this id is already stored.
  #[error("battle already exists: {0}")]
  DuplicateBattle(String),

  #[error("battle not found: {0}")]
  BattleNotFound(String),

  /// Writing the battle would overlap another stored battle in one of its
  /// systems, typically one written by a concurrent job.
  #[error("battle {battle_id} would overlap stored battle {existing}")]
  OverlappingBattle { battle_id: String, existing: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
