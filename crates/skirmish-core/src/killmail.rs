//! Killmails: the immutable combat records the detector consumes.
//!
//! A killmail names exactly one victim and one or more attackers at a single
//! location. Records are produced upstream and never modified here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Solar system identifier.
pub type LocationId = i64;

/// Unique killmail identifier.
pub type KillmailId = i64;

/// EVE entity identifier (character, corporation, alliance, faction, type).
pub type EntityId = i64;

// ─── Participants ────────────────────────────────────────────────────────────

/// Affiliation and hull of one participant. Every field is optional: NPCs and
/// structures routinely lack a character, and unaffiliated pilots lack an
/// alliance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pilot {
  pub character_id:     Option<EntityId>,
  pub character_name:   Option<String>,
  pub corporation_id:   Option<EntityId>,
  pub corporation_name: Option<String>,
  pub alliance_id:      Option<EntityId>,
  pub alliance_name:    Option<String>,
  pub faction_id:       Option<EntityId>,
  pub faction_name:     Option<String>,
  pub ship_type_id:     Option<EntityId>,
  pub ship_type_name:   Option<String>,
}

/// The participant whose ship was destroyed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Victim {
  #[serde(flatten)]
  pub pilot:        Pilot,
  #[serde(default)]
  pub damage_taken: f64,
}

/// One participant on the attacking side of a killmail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attacker {
  #[serde(flatten)]
  pub pilot:          Pilot,
  #[serde(default)]
  pub damage_done:    f64,
  #[serde(default)]
  pub final_blow:     bool,
  pub weapon_type_id: Option<EntityId>,
}

/// A destroyed or dropped item, possibly a container with nested contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
  pub type_id:            EntityId,
  pub type_name:          Option<String>,
  #[serde(default)]
  pub flag:               i32,
  #[serde(default)]
  pub quantity_destroyed: u64,
  #[serde(default)]
  pub quantity_dropped:   u64,
  #[serde(default)]
  pub value:              f64,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub items:              Vec<Item>,
}

// ─── Killmail ────────────────────────────────────────────────────────────────

/// One timestamped combat event.
///
/// `victim` is optional only so that malformed upstream records can be
/// represented and skipped; a well-formed killmail always has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Killmail {
  pub killmail_id: KillmailId,
  pub time:        DateTime<Utc>,
  pub location_id: LocationId,
  #[serde(default)]
  pub total_value: f64,
  pub victim:      Option<Victim>,
  #[serde(default)]
  pub attackers:   Vec<Attacker>,
  #[serde(default)]
  pub items:       Vec<Item>,
  #[serde(default)]
  pub is_npc:      bool,
  #[serde(default)]
  pub is_solo:     bool,
}

impl Killmail {
  /// The attacker credited with the final blow, if the record names one.
  pub fn final_blow(&self) -> Option<&Attacker> {
    self.attackers.iter().find(|a| a.final_blow)
  }

  /// Every pilot on the record, victim first.
  pub fn pilots(&self) -> impl Iterator<Item = &Pilot> {
    self
      .victim
      .iter()
      .map(|v| &v.pilot)
      .chain(self.attackers.iter().map(|a| &a.pilot))
  }
}
