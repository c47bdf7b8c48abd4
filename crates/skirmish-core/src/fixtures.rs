//! In-memory stores and record builders shared by the unit tests.

use std::{
  collections::{BTreeMap, HashMap, HashSet},
  sync::{
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
};

use chrono::{DateTime, Duration, Utc};

use crate::{
  battle::{Battle, SystemInfo},
  killmail::{Attacker, EntityId, Killmail, KillmailId, LocationId, Pilot, Victim},
  store::{BattleStore, KillmailStore, SystemDirectory},
};

/// Location used by records built with [`killmail_between`].
pub const LOCATION: LocationId = 30002187;

/// Hull every fixture pilot flies.
pub const RIFTER: EntityId = 587;

#[derive(Debug, thiserror::Error)]
#[error("fixture store: {0}")]
pub struct FixtureError(&'static str);

// ─── Builders ────────────────────────────────────────────────────────────────

pub fn pilot(character: EntityId, corporation: EntityId, alliance: Option<EntityId>) -> Pilot {
  Pilot {
    character_id: Some(character),
    corporation_id: Some(corporation),
    alliance_id: alliance,
    ship_type_id: Some(RIFTER),
    ..Pilot::default()
  }
}

pub fn attacker(
  character: EntityId,
  corporation: EntityId,
  alliance: Option<EntityId>,
  final_blow: bool,
) -> Attacker {
  Attacker {
    pilot: pilot(character, corporation, alliance),
    damage_done: 100.0,
    final_blow,
    weapon_type_id: None,
  }
}

pub fn killmail_between(
  id: KillmailId,
  time: DateTime<Utc>,
  victim: Pilot,
  attackers: Vec<Attacker>,
) -> Killmail {
  Killmail {
    killmail_id: id,
    time,
    location_id: LOCATION,
    total_value: 0.0,
    victim: Some(Victim { pilot: victim, damage_taken: 100.0 * attackers.len() as f64 }),
    attackers,
    items: Vec::new(),
    is_npc: false,
    is_solo: false,
  }
}

/// Alliance 1001 and alliance 2001 trading ships: even ids are 1001 losses,
/// odd ids 2001 losses.
pub fn killmail(id: KillmailId, location_id: LocationId, time: DateTime<Utc>) -> Killmail {
  let (victim, killer) = if id % 2 == 0 { (1001, 2001) } else { (2001, 1001) };
  let mut k = killmail_between(
    id,
    time,
    pilot(victim * 100 + id % 50, victim / 10, Some(victim)),
    vec![attacker(killer * 100, killer / 10, Some(killer), true)],
  );
  k.location_id = location_id;
  k.total_value = 1_000_000.0;
  k
}

/// `count` consecutive records starting at `start`, `spacing` apart.
pub fn burst(
  first_id: KillmailId,
  count: i64,
  location_id: LocationId,
  start: DateTime<Utc>,
  spacing: Duration,
) -> Vec<Killmail> {
  (0..count)
    .map(|i| killmail(first_id + i, location_id, start + spacing * i as i32))
    .collect()
}

// ─── Killmails ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryKillmails {
  records:     Vec<Killmail>,
  fail_counts: Mutex<HashSet<DateTime<Utc>>>,
}

impl MemoryKillmails {
  pub fn new(mut records: Vec<Killmail>) -> Self {
    records.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.killmail_id.cmp(&b.killmail_id)));
    Self { records, fail_counts: Mutex::default() }
  }

  /// Make `count_by_location` fail for windows starting at `start`.
  pub fn fail_counts_starting_at(&self, start: DateTime<Utc>) {
    self.fail_counts.lock().unwrap().insert(start);
  }

  fn within(
    &self,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> impl Iterator<Item = &Killmail> {
    self.records.iter().filter(move |k| start <= k.time && k.time < end)
  }
}

impl KillmailStore for MemoryKillmails {
  type Error = FixtureError;

  async fn count_by_location(
    &self,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<BTreeMap<LocationId, u64>, FixtureError> {
    if self.fail_counts.lock().unwrap().contains(&start) {
      return Err(FixtureError("count failed"));
    }
    let mut counts = BTreeMap::new();
    for k in self.within(start, end) {
      *counts.entry(k.location_id).or_default() += 1;
    }
    Ok(counts)
  }

  async fn count_at_location(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<u64, FixtureError> {
    Ok(self.within(start, end).filter(|k| k.location_id == location_id).count() as u64)
  }

  async fn find_in_interval(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Vec<Killmail>, FixtureError> {
    Ok(
      self
        .within(start, end)
        .filter(|k| k.location_id == location_id)
        .cloned()
        .collect(),
    )
  }
}

// ─── Battles ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBattles {
  battles:     Mutex<BTreeMap<String, Battle>>,
  fail_writes: AtomicBool,
}

impl MemoryBattles {
  pub fn fail_writes(&self) { self.fail_writes.store(true, Ordering::SeqCst); }

  /// Every stored battle, earliest first.
  pub fn all(&self) -> Vec<Battle> {
    let mut all: Vec<Battle> = self.battles.lock().unwrap().values().cloned().collect();
    all.sort_by(|a, b| a.start_time.cmp(&b.start_time));
    all
  }

  fn check_writable(&self) -> Result<(), FixtureError> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(FixtureError("write failed"));
    }
    Ok(())
  }
}

impl BattleStore for MemoryBattles {
  type Error = FixtureError;

  async fn find_overlapping(
    &self,
    location_id: LocationId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Vec<Battle>, FixtureError> {
    Ok(
      self
        .all()
        .into_iter()
        .filter(|b| b.includes_location(location_id) && b.start_time < end && start < b.end_time)
        .collect(),
    )
  }

  async fn insert(&self, battle: &Battle) -> Result<(), FixtureError> {
    self.check_writable()?;
    let mut battles = self.battles.lock().unwrap();
    if battles.contains_key(&battle.battle_id) {
      return Err(FixtureError("duplicate battle id"));
    }
    battles.insert(battle.battle_id.clone(), battle.clone());
    Ok(())
  }

  async fn update_in_place(&self, existing_id: &str, merged: &Battle) -> Result<(), FixtureError> {
    self.check_writable()?;
    let mut battles = self.battles.lock().unwrap();
    let Some(slot) = battles.get_mut(existing_id) else {
      return Err(FixtureError("no such battle"));
    };
    *slot = merged.clone();
    Ok(())
  }

  async fn absorb(&self, target_id: &str, merged: &Battle, absorbed: &[String]) -> Result<(), FixtureError> {
    self.check_writable()?;
    let mut battles = self.battles.lock().unwrap();
    if !battles.contains_key(target_id) || absorbed.iter().any(|id| !battles.contains_key(id)) {
      return Err(FixtureError("no such battle"));
    }
    for id in absorbed {
      battles.remove(id);
    }
    battles.insert(target_id.to_owned(), merged.clone());
    Ok(())
  }

  async fn exists_by_id(&self, battle_id: &str) -> Result<bool, FixtureError> {
    Ok(self.battles.lock().unwrap().contains_key(battle_id))
  }

  async fn get(&self, battle_id: &str) -> Result<Option<Battle>, FixtureError> {
    Ok(self.battles.lock().unwrap().get(battle_id).cloned())
  }
}

// ─── Directory ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryDirectory {
  systems:        HashMap<LocationId, SystemInfo>,
  types:          HashMap<EntityId, String>,
  system_lookups: AtomicUsize,
  type_lookups:   AtomicUsize,
}

impl MemoryDirectory {
  pub fn with_system(location_id: LocationId, name: &str) -> Self {
    Self::default().and_system(location_id, name)
  }

  pub fn and_system(mut self, location_id: LocationId, name: &str) -> Self {
    self.systems.insert(location_id, SystemInfo {
      name: Some(name.to_owned()),
      ..SystemInfo::unknown(location_id)
    });
    self
  }

  pub fn and_type(mut self, type_id: EntityId, name: &str) -> Self {
    self.types.insert(type_id, name.to_owned());
    self
  }

  pub fn system_lookups(&self) -> usize { self.system_lookups.load(Ordering::SeqCst) }

  pub fn type_lookups(&self) -> usize { self.type_lookups.load(Ordering::SeqCst) }
}

impl SystemDirectory for MemoryDirectory {
  type Error = FixtureError;

  async fn system_info(&self, location_id: LocationId) -> Result<Option<SystemInfo>, FixtureError> {
    self.system_lookups.fetch_add(1, Ordering::SeqCst);
    Ok(self.systems.get(&location_id).cloned())
  }

  async fn type_name(&self, type_id: EntityId) -> Result<Option<String>, FixtureError> {
    self.type_lookups.fetch_add(1, Ordering::SeqCst);
    Ok(self.types.get(&type_id).cloned())
  }
}
