//! Two-sided team assignment.
//!
//! The seed killmail's victim defines side A (its alliance and corporation);
//! every attacker on the seed not affiliated with side A defines side B. All
//! other participants are then classified by membership in those seed sets.
//! Participants matching neither are left unassigned rather than guessed
//! into a third side.
//!
//! Sides are keyed by id so a classifier producing more than two sides can
//! replace this one without changing the battle document.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
  battle::{SIDE_A, SIDE_B, Side, SideId},
  killmail::{EntityId, Killmail, KillmailId, Pilot},
};

/// Alliance and corporation ids that put a pilot on a side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
  pub alliances:    BTreeSet<EntityId>,
  pub corporations: BTreeSet<EntityId>,
}

impl Membership {
  pub fn matches(&self, pilot: &Pilot) -> bool {
    pilot.alliance_id.is_some_and(|id| self.alliances.contains(&id))
      || pilot.corporation_id.is_some_and(|id| self.corporations.contains(&id))
  }

  pub fn is_empty(&self) -> bool { self.alliances.is_empty() && self.corporations.is_empty() }

  fn add(&mut self, pilot: &Pilot) {
    self.alliances.extend(pilot.alliance_id);
    self.corporations.extend(pilot.corporation_id);
  }
}

/// The result of team assignment: seed memberships, the (still empty)
/// sides with their member sets filled in, and names seen for each entity.
#[derive(Debug, Clone)]
pub struct Teams {
  pub seed_killmail_id: KillmailId,
  seeds:                Vec<(SideId, Membership)>,
  pub sides:            BTreeMap<SideId, Side>,
  names:                HashMap<EntityId, String>,
}

impl Teams {
  /// The side a pilot fights for, judged against the seed memberships.
  pub fn side_of(&self, pilot: &Pilot) -> Option<&SideId> {
    self
      .seeds
      .iter()
      .find(|(_, membership)| membership.matches(pilot))
      .map(|(id, _)| id)
  }

  pub fn seed_membership(&self, side: &str) -> Option<&Membership> {
    self.seeds.iter().find(|(id, _)| id == side).map(|(_, m)| m)
  }

  /// Fill missing alliance and corporation names from any other record that
  /// carried them.
  pub fn backfill_names(&self, pilot: &mut Pilot) {
    fill(&mut pilot.alliance_name, pilot.alliance_id, &self.names);
    fill(&mut pilot.corporation_name, pilot.corporation_id, &self.names);
    fill(&mut pilot.character_name, pilot.character_id, &self.names);
  }
}

fn fill(name: &mut Option<String>, id: Option<EntityId>, names: &HashMap<EntityId, String>) {
  if name.is_none() {
    *name = id.and_then(|id| names.get(&id).cloned());
  }
}

/// The killmail to seed from: `trigger` when it is part of the set, else the
/// chronologically first record.
pub fn choose_seed(killmails: &[Killmail], trigger: Option<KillmailId>) -> Option<&Killmail> {
  trigger
    .and_then(|id| killmails.iter().find(|k| k.killmail_id == id))
    .or_else(|| {
      killmails
        .iter()
        .min_by(|a, b| a.time.cmp(&b.time).then_with(|| a.killmail_id.cmp(&b.killmail_id)))
    })
}

/// Split the participants of `killmails` into sides A and B around `seed`.
///
/// A seed whose victim has neither alliance nor corporation leaves side A
/// empty, and every classified participant lands on side B.
pub fn assign_teams(killmails: &[Killmail], seed: &Killmail) -> Teams {
  let mut seed_a = Membership::default();
  if let Some(victim) = &seed.victim {
    seed_a.add(&victim.pilot);
  }

  let mut seed_b = Membership::default();
  for attacker in &seed.attackers {
    let pilot = &attacker.pilot;
    let in_a_alliance = pilot.alliance_id.is_some_and(|id| seed_a.alliances.contains(&id));
    let in_a_corporation = pilot
      .corporation_id
      .is_some_and(|id| seed_a.corporations.contains(&id));
    if !in_a_alliance && !in_a_corporation {
      seed_b.add(pilot);
    }
  }

  let seeds = vec![(SIDE_A.to_owned(), seed_a), (SIDE_B.to_owned(), seed_b)];
  let mut sides: BTreeMap<SideId, Side> = seeds
    .iter()
    .map(|(id, membership)| {
      let mut side = Side::new(id.clone());
      side.member_alliances = membership.alliances.clone();
      side.member_corporations = membership.corporations.clone();
      (id.clone(), side)
    })
    .collect();

  let mut names = HashMap::new();
  for killmail in killmails {
    for pilot in killmail.pilots() {
      remember(&mut names, pilot.alliance_id, &pilot.alliance_name);
      remember(&mut names, pilot.corporation_id, &pilot.corporation_name);
      remember(&mut names, pilot.character_id, &pilot.character_name);

      let Some((side_id, _)) = seeds.iter().find(|(_, m)| m.matches(pilot)) else {
        continue;
      };
      // Grow the member sets with the pilot's other affiliation, unless a
      // different side already claimed it.
      let claimed_elsewhere = |alliance: bool, id: EntityId| {
        sides.iter().any(|(other, side)| {
          other != side_id
            && if alliance {
              side.member_alliances.contains(&id)
            } else {
              side.member_corporations.contains(&id)
            }
        })
      };
      let new_alliance = pilot.alliance_id.filter(|id| !claimed_elsewhere(true, *id));
      let new_corporation = pilot.corporation_id.filter(|id| !claimed_elsewhere(false, *id));

      if let Some(side) = sides.get_mut(side_id) {
        side.member_alliances.extend(new_alliance);
        side.member_corporations.extend(new_corporation);
      }
    }
  }

  Teams { seed_killmail_id: seed.killmail_id, seeds, sides, names }
}

fn remember(names: &mut HashMap<EntityId, String>, id: Option<EntityId>, name: &Option<String>) {
  if let (Some(id), Some(name)) = (id, name) {
    names.entry(id).or_insert_with(|| name.clone());
  }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::fixtures::{attacker, killmail_between, pilot};

  #[test]
  fn seed_victim_defines_side_a_and_its_attackers_side_b() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let seed = killmail_between(
      1,
      t,
      pilot(11, 101, Some(1001)),
      vec![attacker(21, 201, Some(2001), true), attacker(22, 202, None, false)],
    );
    let teams = assign_teams(std::slice::from_ref(&seed), &seed);

    let a = teams.seed_membership(SIDE_A).unwrap();
    assert_eq!(a.alliances, BTreeSet::from([1001]));
    assert_eq!(a.corporations, BTreeSet::from([101]));

    let b = teams.seed_membership(SIDE_B).unwrap();
    assert_eq!(b.alliances, BTreeSet::from([2001]));
    assert_eq!(b.corporations, BTreeSet::from([201, 202]));
  }

  #[test]
  fn attackers_sharing_the_victims_affiliation_stay_off_side_b() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let seed = killmail_between(
      1,
      t,
      pilot(11, 101, Some(1001)),
      vec![attacker(12, 102, Some(1001), false), attacker(21, 201, Some(2001), true)],
    );
    let teams = assign_teams(std::slice::from_ref(&seed), &seed);

    let b = teams.seed_membership(SIDE_B).unwrap();
    assert!(!b.corporations.contains(&102));
    assert_eq!(teams.side_of(&pilot(12, 102, Some(1001))).map(String::as_str), Some(SIDE_A));
  }

  #[test]
  fn every_affiliated_participant_lands_in_exactly_one_side() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let seed = killmail_between(1, t, pilot(11, 101, Some(1001)), vec![attacker(21, 201, Some(2001), true)]);
    let later = killmail_between(
      2,
      t + chrono::Duration::minutes(1),
      // Same alliance as side B, new corporation.
      pilot(23, 203, Some(2001)),
      vec![attacker(13, 103, Some(1001), true)],
    );
    let records = vec![seed.clone(), later];
    let teams = assign_teams(&records, &seed);

    for record in &records {
      for p in record.pilots() {
        let holders = teams
          .sides
          .values()
          .filter(|s| {
            p.corporation_id.is_some_and(|c| s.member_corporations.contains(&c))
              || p.alliance_id.is_some_and(|a| s.member_alliances.contains(&a))
          })
          .count();
        assert_eq!(holders, 1, "pilot {:?}", p.character_id);
      }
    }
    assert!(teams.sides[SIDE_B].member_corporations.contains(&203));
    assert!(teams.sides[SIDE_A].member_corporations.contains(&103));
  }

  #[test]
  fn strangers_are_left_unassigned() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let seed = killmail_between(1, t, pilot(11, 101, Some(1001)), vec![attacker(21, 201, Some(2001), true)]);
    let teams = assign_teams(std::slice::from_ref(&seed), &seed);

    assert!(teams.side_of(&pilot(31, 301, Some(3001))).is_none());
  }

  #[test]
  fn unaffiliated_seed_victim_puts_everyone_on_side_b() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let mut victim = pilot(11, 0, None);
    victim.corporation_id = None;
    let seed = killmail_between(1, t, victim, vec![attacker(21, 201, Some(2001), true)]);
    let teams = assign_teams(std::slice::from_ref(&seed), &seed);

    assert!(teams.seed_membership(SIDE_A).unwrap().is_empty());
    assert_eq!(teams.side_of(&pilot(21, 201, Some(2001))).map(String::as_str), Some(SIDE_B));
  }

  #[test]
  fn names_are_backfilled_from_other_records() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let mut named = pilot(21, 201, Some(2001));
    named.alliance_name = Some("Goonswarm".into());
    let seed = killmail_between(1, t, pilot(11, 101, Some(1001)), vec![attacker(21, 201, Some(2001), true)]);
    let other = killmail_between(2, t, named, vec![]);
    let records = vec![seed.clone(), other];
    let teams = assign_teams(&records, &seed);

    let mut anonymous = pilot(22, 201, Some(2001));
    teams.backfill_names(&mut anonymous);
    assert_eq!(anonymous.alliance_name.as_deref(), Some("Goonswarm"));
  }

  #[test]
  fn trigger_overrides_the_chronological_seed() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let first = killmail_between(5, t, pilot(11, 101, None), vec![]);
    let second = killmail_between(3, t + chrono::Duration::minutes(1), pilot(12, 102, None), vec![]);
    let records = vec![second, first];

    assert_eq!(choose_seed(&records, None).map(|k| k.killmail_id), Some(5));
    assert_eq!(choose_seed(&records, Some(3)).map(|k| k.killmail_id), Some(3));
    assert_eq!(choose_seed(&records, Some(99)).map(|k| k.killmail_id), Some(5));
  }
}
