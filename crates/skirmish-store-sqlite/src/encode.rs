//! Conversions between domain types and the values stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings with millisecond precision and a
//! `Z` suffix. Killmails and battles are stored whole as JSON, with the
//! columns the queries filter on copied alongside.

use chrono::{DateTime, SecondsFormat, Utc};
use skirmish_core::{
  battle::{Battle, SystemInfo},
  killmail::Killmail,
};

use crate::Result;

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Millis, true) }

// ─── Killmails ───────────────────────────────────────────────────────────────

/// Column values for one `killmails` row.
pub struct KillmailRow {
  pub killmail_id:   i64,
  pub killmail_time: String,
  pub location_id:   i64,
  pub total_value:   f64,
  pub is_npc:        bool,
  pub is_solo:       bool,
  pub body:          String,
}

impl KillmailRow {
  pub fn encode(killmail: &Killmail) -> Result<Self> {
    Ok(Self {
      killmail_id:   killmail.killmail_id,
      killmail_time: encode_dt(killmail.time),
      location_id:   killmail.location_id,
      total_value:   killmail.total_value,
      is_npc:        killmail.is_npc,
      is_solo:       killmail.is_solo,
      body:          serde_json::to_string(killmail)?,
    })
  }
}

pub fn decode_killmail(body: &str) -> Result<Killmail> { Ok(serde_json::from_str(body)?) }

// ─── Battles ─────────────────────────────────────────────────────────────────

/// Column values for one `battles` row plus its `battle_systems` rows.
pub struct BattleRow {
  pub battle_id:    String,
  pub start_time:   String,
  pub end_time:     String,
  pub custom:       bool,
  pub document:     String,
  pub location_ids: Vec<i64>,
}

impl BattleRow {
  /// Encode `battle` to be stored under `battle_id`.
  pub fn encode(battle_id: &str, battle: &Battle) -> Result<Self> {
    let mut location_ids: Vec<i64> = battle.location_ids().collect();
    location_ids.sort_unstable();
    location_ids.dedup();
    Ok(Self {
      battle_id: battle_id.to_owned(),
      start_time: encode_dt(battle.start_time),
      end_time: encode_dt(battle.end_time),
      custom: battle.custom,
      document: serde_json::to_string(battle)?,
      location_ids,
    })
  }
}

pub fn decode_battle(document: &str) -> Result<Battle> { Ok(serde_json::from_str(document)?) }

// ─── Systems ─────────────────────────────────────────────────────────────────

/// Raw values read from a `systems` row.
pub struct RawSystem {
  pub location_id: i64,
  pub name:        Option<String>,
  pub security:    Option<f64>,
  pub region_id:   Option<i64>,
  pub region:      Option<String>,
}

impl RawSystem {
  pub fn into_system(self) -> SystemInfo {
    SystemInfo {
      location_id: self.location_id,
      name:        self.name,
      security:    self.security,
      region_id:   self.region_id,
      region:      self.region,
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn encoded_times_sort_chronologically() {
    let early = Utc.with_ymd_and_hms(2024, 3, 1, 9, 59, 59).unwrap();
    let late = early + chrono::Duration::milliseconds(1500);
    assert!(encode_dt(early) < encode_dt(late));
    assert_eq!(encode_dt(early), "2024-03-01T09:59:59.000Z");
    assert_eq!(DateTime::parse_from_rfc3339(&encode_dt(late)).unwrap(), late);
  }
}
