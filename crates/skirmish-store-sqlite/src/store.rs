//! [`SqliteStore`]: the SQLite implementation of the skirmish store traits.

use std::{collections::BTreeMap, path::Path};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tracing::debug;

use skirmish_core::{
  battle::{Battle, SystemInfo},
  killmail::{EntityId, Killmail, LocationId},
  store::{BattleStore, KillmailStore, SystemDirectory},
};

use crate::{
  Error, Result,
  encode::{BattleRow, KillmailRow, RawSystem, decode_battle, decode_killmail, encode_dt},
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// Killmails, battles and reference data in a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Ingestion ─────────────────────────────────────────────────────────────

  /// Store killmails, ignoring ids already present. Returns how many were
  /// new.
  pub async fn insert_killmails(&self, killmails: &[Killmail]) -> Result<usize> {
    let rows = killmails
      .iter()
      .map(KillmailRow::encode)
      .collect::<Result<Vec<_>>>()?;

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
          let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO killmails (
               killmail_id, killmail_time, location_id, total_value,
               is_npc, is_solo, body
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          )?;
          for row in &rows {
            inserted += stmt.execute(rusqlite::params![
              row.killmail_id,
              row.killmail_time,
              row.location_id,
              row.total_value,
              row.is_npc,
              row.is_solo,
              row.body,
            ])?;
          }
        }
        tx.commit()?;
        Ok(inserted)
      })
      .await?;

    debug!(inserted, offered = killmails.len(), "stored killmails");
    Ok(inserted)
  }

  /// Insert or replace solar system metadata.
  pub async fn upsert_systems(&self, systems: &[SystemInfo]) -> Result<()> {
    let systems = systems.to_vec();
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO systems (location_id, name, security, region_id, region)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (location_id) DO UPDATE SET
               name = excluded.name,
               security = excluded.security,
               region_id = excluded.region_id,
               region = excluded.region",
          )?;
          for s in &systems {
            stmt.execute(rusqlite::params![s.location_id, s.name, s.security, s.region_id, s.region])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Insert or replace item type names.
  pub async fn upsert_item_types(&self, types: &[(EntityId, String)]) -> Result<()> {
    let types = types.to_vec();
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO item_types (type_id, name) VALUES (?1, ?2)
             ON CONFLICT (type_id) DO UPDATE SET name = excluded.name",
          )?;
          for (type_id, name) in &types {
            stmt.execute(rusqlite::params![type_id, name])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Every stored battle, earliest first.
  pub async fn list_battles(&self) -> Result<Vec<Battle>> {
    let documents: Vec<String> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare("SELECT document FROM battles ORDER BY start_time, battle_id")?;
        let rows = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;

    documents.iter().map(|d| decode_battle(d)).collect()
  }
}

// ─── KillmailStore impl ──────────────────────────────────────────────────────

impl KillmailStore for SqliteStore {
  type Error = Error;

  async fn count_by_location(
    &self,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<BTreeMap<LocationId, u64>> {
    let start_str = encode_dt(start);
    let end_str = encode_dt(end);

    let counts = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT location_id, COUNT(*) FROM killmails
           WHERE killmail_time >= ?1 AND killmail_time < ?2
           GROUP BY location_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![start_str, end_str], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(
      counts
        .into_iter()
        .map(|(location_id, count)| (location_id, count.max(0) as u64))
        .collect(),
    )
  }

  async fn count_at_location(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<u64> {
    let start_str = encode_dt(start);
    let end_str = encode_dt(end);

    let count: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM killmails
           WHERE location_id = ?1 AND killmail_time >= ?2 AND killmail_time < ?3",
          rusqlite::params![location_id, start_str, end_str],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(count.max(0) as u64)
  }

  async fn find_in_interval(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Vec<Killmail>> {
    let start_str = encode_dt(start);
    let end_str = encode_dt(end);

    let bodies: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT body FROM killmails
           WHERE location_id = ?1 AND killmail_time >= ?2 AND killmail_time < ?3
           ORDER BY killmail_time, killmail_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![location_id, start_str, end_str], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;

    bodies.iter().map(|b| decode_killmail(b)).collect()
  }
}

// ─── BattleStore impl ────────────────────────────────────────────────────────

impl BattleStore for SqliteStore {
  type Error = Error;

  async fn find_overlapping(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Vec<Battle>> {
    let start_str = encode_dt(start);
    let end_str = encode_dt(end);

    let documents: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT b.document
           FROM battles b
           JOIN battle_systems s ON s.battle_id = b.battle_id
           WHERE s.location_id = ?1
             AND b.start_time < ?3
             AND b.end_time > ?2
           ORDER BY b.start_time, b.battle_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![location_id, start_str, end_str], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;

    documents.iter().map(|d| decode_battle(d)).collect()
  }

  async fn insert(&self, battle: &Battle) -> Result<()> {
    let row = BattleRow::encode(&battle.battle_id, battle)?;
    let battle_id = row.battle_id.clone();

    let refusal = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = overlapping_ids(&tx, &row, &[])?.pop() {
          return Ok(Some(Refusal::Overlaps(existing)));
        }
        let inserted = tx.execute(
          "INSERT OR IGNORE INTO battles (battle_id, start_time, end_time, custom, document)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![row.battle_id, row.start_time, row.end_time, row.custom, row.document],
        )?;
        if inserted == 0 {
          return Ok(Some(Refusal::Duplicate));
        }
        insert_locations(&tx, &row)?;
        tx.commit()?;
        Ok(None)
      })
      .await?;

    refusal.map_or(Ok(()), |r| Err(r.into_error(battle_id)))
  }

  async fn update_in_place(&self, existing_id: &str, merged: &Battle) -> Result<()> {
    self.rewrite(existing_id, merged, Vec::new()).await
  }

  async fn absorb(&self, target_id: &str, merged: &Battle, absorbed: &[String]) -> Result<()> {
    self.rewrite(target_id, merged, absorbed.to_vec()).await
  }

  async fn exists_by_id(&self, battle_id: &str) -> Result<bool> {
    let id = battle_id.to_owned();
    let exists = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM battles WHERE battle_id = ?1",
              rusqlite::params![id],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;
    Ok(exists)
  }

  async fn get(&self, battle_id: &str) -> Result<Option<Battle>> {
    let id = battle_id.to_owned();
    let document: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT document FROM battles WHERE battle_id = ?1",
              rusqlite::params![id],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    document.as_deref().map(decode_battle).transpose()
  }
}

impl SqliteStore {
  /// Replace the document for `battle_id` and delete `absorbed`, refusing
  /// the write if the new interval would overlap any other stored battle.
  async fn rewrite(&self, battle_id: &str, merged: &Battle, absorbed: Vec<String>) -> Result<()> {
    let row = BattleRow::encode(battle_id, merged)?;
    let battle_id = row.battle_id.clone();

    let refusal = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for id in &absorbed {
          tx.execute("DELETE FROM battle_systems WHERE battle_id = ?1", rusqlite::params![id])?;
          if tx.execute("DELETE FROM battles WHERE battle_id = ?1", rusqlite::params![id])? == 0 {
            return Ok(Some(Refusal::Missing));
          }
        }
        let updated = tx.execute(
          "UPDATE battles
           SET start_time = ?2, end_time = ?3, custom = ?4, document = ?5
           WHERE battle_id = ?1",
          rusqlite::params![row.battle_id, row.start_time, row.end_time, row.custom, row.document],
        )?;
        if updated == 0 {
          return Ok(Some(Refusal::Missing));
        }
        if let Some(existing) = overlapping_ids(&tx, &row, &absorbed)?.pop() {
          return Ok(Some(Refusal::Overlaps(existing)));
        }
        tx.execute(
          "DELETE FROM battle_systems WHERE battle_id = ?1",
          rusqlite::params![row.battle_id],
        )?;
        insert_locations(&tx, &row)?;
        tx.commit()?;
        Ok(None)
      })
      .await?;

    refusal.map_or(Ok(()), |r| Err(r.into_error(battle_id)))
  }
}

/// Why a battle write was rolled back.
enum Refusal {
  Duplicate,
  Missing,
  Overlaps(String),
}

impl Refusal {
  fn into_error(self, battle_id: String) -> Error {
    match self {
      Self::Duplicate => Error::DuplicateBattle(battle_id),
      Self::Missing => Error::BattleNotFound(battle_id),
      Self::Overlaps(existing) => Error::OverlappingBattle { battle_id, existing },
    }
  }
}

/// Ids of stored battles, other than `row` itself and `excluded`, that share
/// a system with `row` and overlap its interval.
fn overlapping_ids(
  tx: &rusqlite::Transaction<'_>,
  row: &BattleRow,
  excluded: &[String],
) -> rusqlite::Result<Vec<String>> {
  let mut stmt = tx.prepare(
    "SELECT b.battle_id
     FROM battles b
     JOIN battle_systems s ON s.battle_id = b.battle_id
     WHERE s.location_id = ?1
       AND b.start_time < ?3
       AND b.end_time > ?2",
  )?;
  let mut ids = Vec::new();
  for location_id in &row.location_ids {
    let found = stmt
      .query_map(rusqlite::params![location_id, row.start_time, row.end_time], |r| r.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    for id in found {
      if id != row.battle_id && !excluded.contains(&id) && !ids.contains(&id) {
        ids.push(id);
      }
    }
  }
  Ok(ids)
}

fn insert_locations(tx: &rusqlite::Transaction<'_>, row: &BattleRow) -> rusqlite::Result<()> {
  let mut stmt =
    tx.prepare("INSERT OR IGNORE INTO battle_systems (battle_id, location_id) VALUES (?1, ?2)")?;
  for location_id in &row.location_ids {
    stmt.execute(rusqlite::params![row.battle_id, location_id])?;
  }
  Ok(())
}

// ─── SystemDirectory impl ────────────────────────────────────────────────────

impl SystemDirectory for SqliteStore {
  type Error = Error;

  async fn system_info(&self, location_id: LocationId) -> Result<Option<SystemInfo>> {
    let raw: Option<RawSystem> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT location_id, name, security, region_id, region
               FROM systems WHERE location_id = ?1",
              rusqlite::params![location_id],
              |row| {
                Ok(RawSystem {
                  location_id: row.get(0)?,
                  name:        row.get(1)?,
                  security:    row.get(2)?,
                  region_id:   row.get(3)?,
                  region:      row.get(4)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;

    Ok(raw.map(RawSystem::into_system))
  }

  async fn type_name(&self, type_id: EntityId) -> Result<Option<String>> {
    let name: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT name FROM item_types WHERE type_id = ?1",
              rusqlite::params![type_id],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(name)
  }
}
