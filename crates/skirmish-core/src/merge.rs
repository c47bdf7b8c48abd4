//! Merge/upsert: keeps one stored battle per engagement.
//!
//! A freshly compiled battle is either inserted, or merged into the earliest
//! stored battle at the same location whose interval overlaps it. When it
//! overlaps several, it bridges them: the later ones are folded into the
//! earliest and removed, so stored battles at a location never overlap.
//! Merging is a keyed union of participation ledgers followed by a refresh of
//! every aggregate, so applying the same battle twice changes nothing.

use std::{
  collections::{BTreeSet, HashMap, HashSet},
  sync::{Arc, Mutex},
  time::Duration,
};

use tracing::{info, warn};

use crate::{
  Error, Result,
  battle::{Battle, Side, SideId},
  killmail::LocationId,
  store::{BattleStore, query},
};

/// What [`MergeEngine::upsert`] did with a battle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
  Inserted { battle_id: String },
  Merged {
    battle_id: String,
    /// Other stored battles that also overlapped; they were folded into
    /// `battle_id` and removed.
    conflicts: usize,
  },
  /// The stored battle already contained everything.
  Unchanged { battle_id: String },
}

impl MergeOutcome {
  pub fn battle_id(&self) -> &str {
    match self {
      Self::Inserted { battle_id }
      | Self::Merged { battle_id, .. }
      | Self::Unchanged { battle_id } => battle_id,
    }
  }
}

// ─── Pure merge ──────────────────────────────────────────────────────────────

/// Merge `incoming` into `existing`, keeping the existing id and curation flag.
///
/// Killmails the existing battle already holds keep their stored side; only
/// rows for new killmails are taken from `incoming`.
pub fn merge_battles(existing: &Battle, incoming: &Battle, top_n: usize) -> Battle {
  let mut merged = existing.clone();

  for system in &incoming.systems {
    if !merged.includes_location(system.location_id) {
      merged.systems.push(system.clone());
    }
  }

  let span = existing.interval().union(&incoming.interval());
  merged.start_time = span.start;
  merged.end_time = span.end;

  let known = &existing.killmail_ids;
  let mut ledger: HashSet<_> = merged.participations().map(|p| p.key()).collect();
  let labels = align_sides(existing, incoming);

  for (incoming_id, side) in &incoming.sides {
    let label = labels.get(incoming_id).cloned().unwrap_or_else(|| incoming_id.clone());
    let claimed = claimed_by_others(&merged, &label);

    let target = merged
      .sides
      .entry(label.clone())
      .or_insert_with(|| Side::new(label.clone()));
    target.member_alliances.extend(
      side
        .member_alliances
        .iter()
        .filter(|id| !claimed.0.contains(id)),
    );
    target.member_corporations.extend(
      side
        .member_corporations
        .iter()
        .filter(|id| !claimed.1.contains(id)),
    );

    for row in &side.ships {
      if !known.contains(&row.killmail_id) && ledger.insert(row.key()) {
        target.ships.push(row.clone());
      }
    }
  }

  for row in &incoming.unassigned {
    if !known.contains(&row.killmail_id) && ledger.insert(row.key()) {
      merged.unassigned.push(row.clone());
    }
  }

  merged.refresh(top_n);
  merged
}

/// Alliance and corporation ids held by every side other than `label`.
fn claimed_by_others(battle: &Battle, label: &str) -> (BTreeSet<i64>, BTreeSet<i64>) {
  let others = battle.sides.values().filter(|s| s.id != label);
  let mut alliances = BTreeSet::new();
  let mut corporations = BTreeSet::new();
  for side in others {
    alliances.extend(side.member_alliances.iter().copied());
    corporations.extend(side.member_corporations.iter().copied());
  }
  (alliances, corporations)
}

/// Map each incoming side id onto the existing side it shares the most
/// members with. Sides with no overlap keep their own id when it is free.
///
/// Two detections seeded from different killmails can label the same
/// coalition "A" in one and "B" in the other; this undoes that.
pub fn align_sides(existing: &Battle, incoming: &Battle) -> HashMap<SideId, SideId> {
  let mut pairs: Vec<(usize, bool, &SideId, &SideId)> = Vec::new();
  for (in_id, in_side) in &incoming.sides {
    for (ex_id, ex_side) in &existing.sides {
      let overlap = in_side.overlap(ex_side);
      if overlap > 0 {
        pairs.push((overlap, in_id == ex_id, in_id, ex_id));
      }
    }
  }
  // Highest overlap first; prefer keeping the label on ties; then by ids.
  pairs.sort_by(|a, b| {
    b.0.cmp(&a.0)
      .then_with(|| b.1.cmp(&a.1))
      .then_with(|| a.2.cmp(b.2))
      .then_with(|| a.3.cmp(b.3))
  });

  let mut labels = HashMap::new();
  let mut taken = HashSet::new();
  for (_, _, in_id, ex_id) in pairs {
    if labels.contains_key(in_id) || taken.contains(ex_id) {
      continue;
    }
    labels.insert(in_id.clone(), ex_id.clone());
    taken.insert(ex_id.clone());
  }

  // Unmatched sides keep their id if free, else take the first free label.
  for in_id in incoming.sides.keys() {
    if labels.contains_key(in_id) {
      continue;
    }
    let label = if taken.contains(in_id) {
      free_label(&taken, existing, incoming)
    } else {
      in_id.clone()
    };
    taken.insert(label.clone());
    labels.insert(in_id.clone(), label);
  }
  labels
}

fn free_label(taken: &HashSet<SideId>, existing: &Battle, incoming: &Battle) -> SideId {
  existing
    .sides
    .keys()
    .chain(incoming.sides.keys())
    .find(|id| !taken.contains(*id))
    .cloned()
    .unwrap_or_else(|| {
      (b'A'..=b'Z')
        .map(|c| (c as char).to_string())
        .find(|id| !taken.contains(id))
        .unwrap_or_else(|| format!("S{}", taken.len()))
    })
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Serialises insert-or-merge per location so concurrent workers never both
/// insert a battle for the same engagement.
///
/// The locks are in-process only. Separate jobs writing to one store rely on
/// the store refusing overlapping writes (the SQLite store checks inside an
/// immediate transaction); the losing job then fails with [`Error::Write`]
/// and a later run merges its battle.
pub struct MergeEngine {
  locks:   Mutex<HashMap<LocationId, Arc<tokio::sync::Mutex<()>>>>,
  top_n:   usize,
  timeout: Duration,
}

impl MergeEngine {
  pub fn new(top_n: usize, timeout: Duration) -> Self {
    Self { locks: Mutex::new(HashMap::new()), top_n, timeout }
  }

  fn lock_for(&self, location_id: LocationId) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(location_id).or_default().clone()
  }

  /// Insert `battle`, or merge it into the stored battle it overlaps.
  ///
  /// Write failures are always returned; a lost merge is never tolerated.
  /// Only the locations of `battle` are locked, so a bridged battle's other
  /// systems are not.
  pub async fn upsert<B: BattleStore>(&self, store: &B, battle: Battle) -> Result<MergeOutcome> {
    if battle.start_time >= battle.end_time {
      return Err(Error::InvalidRange { start: battle.start_time, end: battle.end_time });
    }

    let mut locations: Vec<LocationId> = battle.location_ids().collect();
    locations.sort_unstable();
    locations.dedup();
    let locks: Vec<_> = locations.iter().map(|id| self.lock_for(*id)).collect();
    let mut guards = Vec::with_capacity(locks.len());
    for lock in &locks {
      guards.push(lock.lock().await);
    }

    let mut overlapping: Vec<Battle> = Vec::new();
    for location_id in &locations {
      let found = query(
        self.timeout,
        store.find_overlapping(*location_id, battle.start_time, battle.end_time),
      )
      .await?;
      for candidate in found {
        if !overlapping.iter().any(|b| b.battle_id == candidate.battle_id) {
          overlapping.push(candidate);
        }
      }
    }
    overlapping.sort_by(|a, b| {
      a.start_time
        .cmp(&b.start_time)
        .then_with(|| a.battle_id.cmp(&b.battle_id))
    });

    let mut overlapping = overlapping.into_iter();
    let target = match overlapping.next() {
      Some(earliest) => Some(earliest),
      None => {
        // No overlap, but the derived id may already be taken.
        let exists = query(self.timeout, store.exists_by_id(&battle.battle_id)).await?;
        if exists {
          query(self.timeout, store.get(&battle.battle_id)).await?
        } else {
          None
        }
      }
    };
    let bridged: Vec<Battle> = overlapping.collect();

    let Some(existing) = target else {
      store.insert(&battle).await.map_err(Error::write)?;
      info!(battle_id = %battle.battle_id, killmails = battle.killmail_ids.len(), "inserted battle");
      return Ok(MergeOutcome::Inserted { battle_id: battle.battle_id });
    };

    // Fold bridged battles in before the new one so their killmails keep the
    // sides they were stored with.
    let mut merged = existing.clone();
    for other in &bridged {
      merged = merge_battles(&merged, other, self.top_n);
      merged.custom |= other.custom;
    }
    let merged = merge_battles(&merged, &battle, self.top_n);

    if bridged.is_empty() {
      if merged == existing {
        return Ok(MergeOutcome::Unchanged { battle_id: existing.battle_id });
      }
      store
        .update_in_place(&existing.battle_id, &merged)
        .await
        .map_err(Error::write)?;
    } else {
      let absorbed: Vec<String> = bridged.iter().map(|b| b.battle_id.clone()).collect();
      warn!(
        battle_id = %existing.battle_id,
        absorbed = ?absorbed,
        "battle bridges several stored battles; folding them into the earliest"
      );
      store
        .absorb(&existing.battle_id, &merged, &absorbed)
        .await
        .map_err(Error::write)?;
    }

    info!(
      battle_id = %existing.battle_id,
      incoming = %battle.battle_id,
      killmails = merged.killmail_ids.len(),
      "merged battle"
    );
    drop(guards);
    Ok(MergeOutcome::Merged { battle_id: existing.battle_id, conflicts: bridged.len() })
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

  use super::*;
  use crate::{
    battle::{SIDE_A, SIDE_B, SystemInfo},
    compiler::compile,
    fixtures::{LOCATION, MemoryBattles, attacker, killmail_between, pilot},
    interval::{BattleInterval, Interval},
    killmail::Killmail,
    teams::assign_teams,
  };

  fn at(m: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + ChronoDuration::minutes(m)
  }

  /// Blue (1001) kills red (2001) on even ids, red kills blue on odd ids.
  fn exchange(ids: std::ops::Range<i64>) -> Vec<Killmail> {
    ids
      .map(|id| {
        let (victim, killer) = if id % 2 == 0 { (2001, 1001) } else { (1001, 2001) };
        let mut k = killmail_between(
          id,
          at(id),
          pilot(victim * 10 + id, victim / 10, Some(victim)),
          vec![attacker(killer * 10, killer / 10, Some(killer), true)],
        );
        k.total_value = 10.0;
        k
      })
      .collect()
  }

  fn battle_over(records: &[Killmail], from: i64, to: i64, seed: usize) -> Battle {
    let interval = BattleInterval { location_id: LOCATION, interval: Interval::new(at(from), at(to)).unwrap() };
    let teams = assign_teams(records, &records[seed]);
    compile(&interval, records, &teams, SystemInfo::unknown(LOCATION), 10).battle
  }

  fn engine() -> MergeEngine { MergeEngine::new(10, std::time::Duration::from_secs(5)) }

  #[test]
  fn merge_unions_killmails_and_keeps_the_existing_id() {
    let all = exchange(0..45);
    let first = battle_over(&all[0..30], 0, 30, 0);
    let second = battle_over(&all[15..45], 15, 45, 0);

    let merged = merge_battles(&first, &second, 10);
    assert_eq!(merged.battle_id, first.battle_id);
    assert_eq!(merged.start_time, at(0));
    assert_eq!(merged.end_time, at(45));
    let expected: BTreeSet<i64> = (0..45).collect();
    assert_eq!(merged.killmail_ids, expected);
    assert_eq!(merged.isk_destroyed, 450.0);
  }

  #[test]
  fn merge_is_idempotent() {
    let all = exchange(0..45);
    let first = battle_over(&all[0..30], 0, 30, 0);
    let second = battle_over(&all[15..45], 15, 45, 0);

    let once = merge_battles(&first, &second, 10);
    let twice = merge_battles(&once, &second, 10);
    assert_eq!(once, twice);
  }

  #[test]
  fn sides_seeded_from_opposite_victims_are_realigned() {
    let all = exchange(0..45);
    // Record 0 loses a red ship: red is side A. Record 15 loses a blue ship:
    // blue is side A in the second detection.
    let first = battle_over(&all[0..30], 0, 30, 0);
    let second = battle_over(&all[15..45], 15, 45, 0);
    assert!(first.sides[SIDE_A].member_alliances.contains(&2001));
    assert!(second.sides[SIDE_A].member_alliances.contains(&1001));

    let labels = align_sides(&first, &second);
    assert_eq!(labels[SIDE_A], SIDE_B);
    assert_eq!(labels[SIDE_B], SIDE_A);

    let merged = merge_battles(&first, &second, 10);
    let red = &merged.sides[SIDE_A];
    assert!(!red.member_alliances.contains(&1001));
    // Red lost every even record.
    assert!(red.kill_ids.iter().all(|id| id % 2 == 0));
    assert_eq!(red.kill_ids.len() + merged.sides[SIDE_B].kill_ids.len(), 45);
  }

  #[tokio::test]
  async fn upsert_inserts_then_merges_then_settles() {
    let store = MemoryBattles::default();
    let engine = engine();
    let all = exchange(0..45);
    let first = battle_over(&all[0..30], 0, 30, 0);
    let second = battle_over(&all[15..45], 15, 45, 0);

    let inserted = engine.upsert(&store, first.clone()).await.unwrap();
    assert_eq!(inserted, MergeOutcome::Inserted { battle_id: first.battle_id.clone() });

    let merged = engine.upsert(&store, second.clone()).await.unwrap();
    assert_eq!(merged, MergeOutcome::Merged { battle_id: first.battle_id.clone(), conflicts: 0 });

    let again = engine.upsert(&store, second).await.unwrap();
    assert_eq!(again, MergeOutcome::Unchanged { battle_id: first.battle_id.clone() });

    let stored = store.all();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].killmail_ids.len(), 45);
  }

  #[tokio::test]
  async fn non_overlapping_battles_stay_separate() {
    let store = MemoryBattles::default();
    let engine = engine();
    let all = exchange(0..45);

    engine.upsert(&store, battle_over(&all[0..10], 0, 10, 0)).await.unwrap();
    engine.upsert(&store, battle_over(&all[20..30], 20, 30, 0)).await.unwrap();
    assert_eq!(store.all().len(), 2);
  }

  #[tokio::test]
  async fn bridging_battle_folds_later_overlaps_into_the_earliest() {
    let store = MemoryBattles::default();
    let engine = engine();
    let all = exchange(0..45);
    let early = battle_over(&all[0..10], 0, 10, 0);
    let late = battle_over(&all[20..30], 20, 30, 0);
    engine.upsert(&store, early.clone()).await.unwrap();
    engine.upsert(&store, late).await.unwrap();

    let bridge = battle_over(&all[5..25], 5, 25, 0);
    let outcome = engine.upsert(&store, bridge.clone()).await.unwrap();
    assert_eq!(outcome, MergeOutcome::Merged { battle_id: early.battle_id.clone(), conflicts: 1 });

    let stored = store.all();
    assert_eq!(stored.len(), 1);
    let merged = &stored[0];
    assert_eq!((merged.start_time, merged.end_time), (at(0), at(30)));
    assert_eq!(merged.killmail_ids, (0..30).collect::<BTreeSet<_>>());
    let per_side: usize = merged.sides.values().map(|s| s.kill_ids.len()).sum();
    assert_eq!(per_side, 30);

    let again = engine.upsert(&store, bridge).await.unwrap();
    assert_eq!(again, MergeOutcome::Unchanged { battle_id: early.battle_id });
  }

  #[tokio::test]
  async fn stored_battles_never_overlap_or_share_killmails() {
    let store = MemoryBattles::default();
    let engine = engine();
    let all = exchange(0..45);
    for (from, to) in [(0, 8), (12, 18), (22, 28), (34, 40), (6, 24), (26, 36)] {
      let battle = battle_over(&all[from as usize..to as usize], from, to, 0);
      engine.upsert(&store, battle).await.unwrap();
    }

    let stored = store.all();
    for (i, a) in stored.iter().enumerate() {
      for b in &stored[i + 1..] {
        assert!(!a.interval().overlaps(&b.interval()), "{} overlaps {}", a.battle_id, b.battle_id);
        assert!(a.killmail_ids.is_disjoint(&b.killmail_ids));
      }
    }
    let total: usize = stored.iter().map(|b| b.killmail_ids.len()).sum();
    assert_eq!(total, 40);
  }

  #[tokio::test]
  async fn write_failures_propagate() {
    let store = MemoryBattles::default();
    store.fail_writes();
    let all = exchange(0..10);

    let err = engine().upsert(&store, battle_over(&all, 0, 10, 0)).await.unwrap_err();
    assert!(matches!(err, Error::Write(_)));
  }

  #[tokio::test]
  async fn empty_intervals_are_rejected() {
    let store = MemoryBattles::default();
    let all = exchange(0..10);
    let mut battle = battle_over(&all, 0, 10, 0);
    battle.end_time = battle.start_time;

    let err = engine().upsert(&store, battle).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRange { .. }));
    assert!(store.all().is_empty());
  }
}
