//! Battles: the canonical, persisted summary of one engagement.
//!
//! The per-record participation ledger (`Side::ships` plus
//! `Battle::unassigned`) is the source of truth. Every aggregate on a side or
//! on the battle is derived from it by [`Battle::refresh`], so merging two
//! battles is a keyed union of ledgers followed by a refresh.

use std::{
  cmp::Ordering,
  collections::{BTreeMap, BTreeSet, HashMap},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
  interval::Interval,
  killmail::{EntityId, KillmailId, LocationId, Pilot},
};

/// Key into [`Battle::sides`].
pub type SideId = String;

pub const SIDE_A: &str = "A";
pub const SIDE_B: &str = "B";

// ─── Reference data ──────────────────────────────────────────────────────────

/// Static description of a solar system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
  pub location_id: LocationId,
  pub name:        Option<String>,
  pub security:    Option<f64>,
  pub region_id:   Option<EntityId>,
  pub region:      Option<String>,
}

impl SystemInfo {
  /// Placeholder for a system the directory does not know.
  pub fn unknown(location_id: LocationId) -> Self {
    Self { location_id, name: None, security: None, region_id: None, region: None }
  }
}

// ─── Ledger ──────────────────────────────────────────────────────────────────

/// One participant's presence on one killmail: a ship manifest row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participation {
  pub killmail_id:    KillmailId,
  /// Position on the killmail: 0 for the victim, `1 + index` for attackers.
  pub slot:           u32,
  pub time:           DateTime<Utc>,
  #[serde(flatten)]
  pub pilot:          Pilot,
  /// Damage taken when `was_lost`, damage done otherwise.
  pub damage:         f64,
  pub final_blow:     bool,
  pub was_lost:       bool,
  /// `total_value` of the killmail this row belongs to.
  pub killmail_value: f64,
}

/// Identity of a ledger row: one entry of one killmail.
///
/// Identical attackers (NPC wrecks of one hull and corp, say) keep separate
/// rows because each holds its own slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipationKey {
  killmail_id: KillmailId,
  slot:        u32,
}

impl Participation {
  pub fn key(&self) -> ParticipationKey {
    ParticipationKey { killmail_id: self.killmail_id, slot: self.slot }
  }
}

// ─── Aggregates ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
  pub isk_lost:         f64,
  pub ships_lost:       u64,
  pub damage_inflicted: f64,
}

/// A ranked per-alliance, per-corporation or per-character row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStats {
  pub id:              EntityId,
  pub name:            Option<String>,
  pub kills:           u64,
  pub losses:          u64,
  pub value_inflicted: f64,
  pub value_suffered:  f64,
}

/// An entry in a battle-wide `top_*` ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntity {
  pub id:    EntityId,
  pub name:  Option<String>,
  pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedCounts {
  pub alliances:    usize,
  pub corporations: usize,
  pub characters:   usize,
}

// ─── Side ────────────────────────────────────────────────────────────────────

/// One of the opposing groups in a battle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Side {
  pub id:                  SideId,
  pub name:                String,
  pub member_alliances:    BTreeSet<EntityId>,
  pub member_corporations: BTreeSet<EntityId>,
  /// Killmails on which this side lost the ship.
  pub kill_ids:            BTreeSet<KillmailId>,
  pub stats:               SideStats,
  pub alliances:           Vec<EntityStats>,
  pub corporations:        Vec<EntityStats>,
  pub characters:          Vec<EntityStats>,
  /// Ship manifest; the ledger every other field of the side is derived from.
  pub ships:               Vec<Participation>,
}

impl Side {
  pub fn new(id: impl Into<SideId>) -> Self {
    let id = id.into();
    Self {
      name: format!("Side {id}"),
      id,
      member_alliances: BTreeSet::new(),
      member_corporations: BTreeSet::new(),
      kill_ids: BTreeSet::new(),
      stats: SideStats::default(),
      alliances: Vec::new(),
      corporations: Vec::new(),
      characters: Vec::new(),
      ships: Vec::new(),
    }
  }

  /// True when the pilot's alliance or corporation is a member of this side.
  pub fn is_member(&self, pilot: &Pilot) -> bool {
    pilot.alliance_id.is_some_and(|id| self.member_alliances.contains(&id))
      || pilot
        .corporation_id
        .is_some_and(|id| self.member_corporations.contains(&id))
  }

  /// Membership overlap with another side, counted over alliances and
  /// corporations.
  pub fn overlap(&self, other: &Side) -> usize {
    self.member_alliances.intersection(&other.member_alliances).count()
      + self
        .member_corporations
        .intersection(&other.member_corporations)
        .count()
  }

  /// Re-derive kill ids, stats, ranked rows and the display name from the
  /// ship manifest.
  pub fn recompute(&mut self) {
    self.ships.sort_by(|a, b| a.key().cmp(&b.key()));

    self.kill_ids = self
      .ships
      .iter()
      .filter(|p| p.was_lost)
      .map(|p| p.killmail_id)
      .collect();

    let mut stats = SideStats::default();
    for p in &self.ships {
      if p.was_lost {
        stats.isk_lost += p.killmail_value;
        stats.ships_lost += 1;
      } else {
        stats.damage_inflicted += p.damage;
      }
    }
    self.stats = stats;

    self.alliances = rank_entities(&self.ships, |p| {
      p.pilot.alliance_id.map(|id| (id, p.pilot.alliance_name.as_deref()))
    });
    self.corporations = rank_entities(&self.ships, |p| {
      p.pilot
        .corporation_id
        .map(|id| (id, p.pilot.corporation_name.as_deref()))
    });
    self.characters = rank_entities(&self.ships, |p| {
      p.pilot
        .character_id
        .map(|id| (id, p.pilot.character_name.as_deref()))
    });

    self.name = self
      .display_name()
      .unwrap_or_else(|| format!("Side {}", self.id));
  }

  /// Name of the most represented alliance, else corporation.
  fn display_name(&self) -> Option<String> {
    let by_alliance = most_represented(&self.ships, |p| {
      p.pilot.alliance_id.map(|id| (id, p.pilot.alliance_name.as_deref()))
    });
    let by_corporation = || {
      most_represented(&self.ships, |p| {
        p.pilot
          .corporation_id
          .map(|id| (id, p.pilot.corporation_name.as_deref()))
      })
    };
    by_alliance.or_else(by_corporation)
  }
}

/// Fold the manifest into one [`EntityStats`] per entity, ranked by kills,
/// then value inflicted, then id.
fn rank_entities<'a, F>(ships: &'a [Participation], key: F) -> Vec<EntityStats>
where
  F: Fn(&'a Participation) -> Option<(EntityId, Option<&'a str>)>,
{
  let mut rows: BTreeMap<EntityId, EntityStats> = BTreeMap::new();
  for p in ships {
    let Some((id, name)) = key(p) else { continue };
    let row = rows.entry(id).or_insert_with(|| EntityStats {
      id,
      name: None,
      kills: 0,
      losses: 0,
      value_inflicted: 0.0,
      value_suffered: 0.0,
    });
    if row.name.is_none() {
      row.name = name.map(str::to_owned);
    }
    if p.was_lost {
      row.losses += 1;
      row.value_suffered += p.killmail_value;
    } else if p.final_blow {
      row.kills += 1;
      row.value_inflicted += p.killmail_value;
    }
  }

  let mut ranked: Vec<EntityStats> = rows.into_values().collect();
  ranked.sort_by(|a, b| {
    b.kills
      .cmp(&a.kills)
      .then_with(|| b.value_inflicted.total_cmp(&a.value_inflicted))
      .then_with(|| a.id.cmp(&b.id))
  });
  ranked
}

fn most_represented<'a, F>(ships: &'a [Participation], key: F) -> Option<String>
where
  F: Fn(&'a Participation) -> Option<(EntityId, Option<&'a str>)>,
{
  let mut counts: BTreeMap<EntityId, (u64, Option<&str>)> = BTreeMap::new();
  for p in ships {
    if let Some((id, name)) = key(p) {
      let entry = counts.entry(id).or_insert((0, None));
      entry.0 += 1;
      entry.1 = entry.1.or(name);
    }
  }
  // Ties go to the lowest id: `max_by` keeps the last maximum, so iterate in
  // reverse id order.
  counts
    .into_iter()
    .rev()
    .max_by(|a, b| a.1.0.cmp(&b.1.0))
    .and_then(|(_, (_, name))| name.map(str::to_owned))
}

// ─── Battle ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battle {
  pub battle_id:             String,
  pub start_time:            DateTime<Utc>,
  pub end_time:              DateTime<Utc>,
  pub duration_secs:         i64,
  pub systems:               Vec<SystemInfo>,
  pub killmail_ids:          BTreeSet<KillmailId>,
  pub isk_destroyed:         f64,
  pub involved_alliances:    BTreeSet<EntityId>,
  pub involved_corporations: BTreeSet<EntityId>,
  pub involved_characters:   BTreeSet<EntityId>,
  pub involved:              InvolvedCounts,
  pub top_alliances:         Vec<RankedEntity>,
  pub top_corporations:      Vec<RankedEntity>,
  pub top_ship_types:        Vec<RankedEntity>,
  pub sides:                 BTreeMap<SideId, Side>,
  /// Rows for participants that matched no side.
  #[serde(default)]
  pub unassigned:            Vec<Participation>,
  /// Manually curated rather than detected.
  #[serde(default)]
  pub custom:                bool,
}

impl Battle {
  /// Deterministic id for a battle first detected at `location_id` starting
  /// at `start`. The start is truncated to whole seconds.
  pub fn id_for(location_id: LocationId, start: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(location_id.to_le_bytes());
    hasher.update(start.timestamp().to_le_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..12])
  }

  /// An empty battle over `interval`; aggregates are filled by [`refresh`].
  ///
  /// [`refresh`]: Battle::refresh
  pub fn empty(battle_id: String, interval: Interval, systems: Vec<SystemInfo>) -> Self {
    Self {
      battle_id,
      start_time: interval.start,
      end_time: interval.end,
      duration_secs: interval.duration().num_seconds(),
      systems,
      killmail_ids: BTreeSet::new(),
      isk_destroyed: 0.0,
      involved_alliances: BTreeSet::new(),
      involved_corporations: BTreeSet::new(),
      involved_characters: BTreeSet::new(),
      involved: InvolvedCounts::default(),
      top_alliances: Vec::new(),
      top_corporations: Vec::new(),
      top_ship_types: Vec::new(),
      sides: BTreeMap::new(),
      unassigned: Vec::new(),
      custom: false,
    }
  }

  pub fn interval(&self) -> Interval {
    Interval { start: self.start_time, end: self.end_time }
  }

  pub fn includes_location(&self, location_id: LocationId) -> bool {
    self.systems.iter().any(|s| s.location_id == location_id)
  }

  pub fn location_ids(&self) -> impl Iterator<Item = LocationId> + '_ {
    self.systems.iter().map(|s| s.location_id)
  }

  /// Every ledger row, assigned or not.
  pub fn participations(&self) -> impl Iterator<Item = &Participation> {
    self
      .sides
      .values()
      .flat_map(|s| s.ships.iter())
      .chain(self.unassigned.iter())
  }

  /// Which side lost the ship on `killmail_id`, if any.
  pub fn side_of_loss(&self, killmail_id: KillmailId) -> Option<&SideId> {
    self
      .sides
      .values()
      .find(|s| s.kill_ids.contains(&killmail_id))
      .map(|s| &s.id)
  }

  /// Re-derive every aggregate from the ledgers.
  pub fn refresh(&mut self, top_n: usize) {
    for side in self.sides.values_mut() {
      side.recompute();
    }
    self.unassigned.sort_by(|a, b| a.key().cmp(&b.key()));

    self.duration_secs = (self.end_time - self.start_time).num_seconds();

    let mut values: BTreeMap<KillmailId, f64> = BTreeMap::new();
    let mut alliances = BTreeSet::new();
    let mut corporations = BTreeSet::new();
    let mut characters = BTreeSet::new();
    let mut top_alliances = Tally::default();
    let mut top_corporations = Tally::default();
    let mut top_ships = Tally::default();

    for p in self.participations() {
      values.entry(p.killmail_id).or_insert(p.killmail_value);
      alliances.extend(p.pilot.alliance_id);
      corporations.extend(p.pilot.corporation_id);
      characters.extend(p.pilot.character_id);

      if !p.was_lost {
        top_alliances.add(p.pilot.alliance_id, p.pilot.alliance_name.as_deref());
        top_corporations.add(p.pilot.corporation_id, p.pilot.corporation_name.as_deref());
        top_ships.add(p.pilot.ship_type_id, p.pilot.ship_type_name.as_deref());
      }
    }

    self.isk_destroyed = values.values().sum();
    self.killmail_ids = values.into_keys().collect();
    self.involved = InvolvedCounts {
      alliances:    alliances.len(),
      corporations: corporations.len(),
      characters:   characters.len(),
    };
    self.involved_alliances = alliances;
    self.involved_corporations = corporations;
    self.involved_characters = characters;
    self.top_alliances = top_alliances.top(top_n);
    self.top_corporations = top_corporations.top(top_n);
    self.top_ship_types = top_ships.top(top_n);
  }
}

/// Occurrence counter behind the `top_*` rankings.
#[derive(Default)]
struct Tally {
  counts: HashMap<EntityId, (u64, Option<String>)>,
}

impl Tally {
  fn add(&mut self, id: Option<EntityId>, name: Option<&str>) {
    let Some(id) = id else { return };
    let entry = self.counts.entry(id).or_insert((0, None));
    entry.0 += 1;
    if entry.1.is_none() {
      entry.1 = name.map(str::to_owned);
    }
  }

  fn top(self, n: usize) -> Vec<RankedEntity> {
    let mut ranked: Vec<RankedEntity> = self
      .counts
      .into_iter()
      .map(|(id, (count, name))| RankedEntity { id, name, count })
      .collect();
    ranked.sort_by(|a, b| match b.count.cmp(&a.count) {
      Ordering::Equal => a.id.cmp(&b.id),
      other => other,
    });
    ranked.truncate(n);
    ranked
  }
}
