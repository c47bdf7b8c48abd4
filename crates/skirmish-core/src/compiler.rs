//! Battle compiler: folds the killmails of one refined interval into a
//! [`Battle`].

use std::collections::HashSet;

use tracing::warn;

use crate::{
  Error, Result,
  battle::{Battle, Participation, SystemInfo},
  interval::BattleInterval,
  killmail::{Killmail, Pilot, Victim},
  teams::Teams,
};

/// A compiled battle plus the number of killmails rejected as malformed.
#[derive(Debug, Clone)]
pub struct Compiled {
  pub battle:  Battle,
  pub skipped: usize,
}

/// Build the battle for `interval` from `killmails`, routing each participant
/// to the side `teams` assigns.
///
/// A malformed killmail is logged and left out; it never fails the battle.
pub fn compile(
  interval: &BattleInterval,
  killmails: &[Killmail],
  teams: &Teams,
  system: SystemInfo,
  top_n: usize,
) -> Compiled {
  let mut battle = Battle::empty(
    Battle::id_for(interval.location_id, interval.interval.start),
    interval.interval,
    vec![system],
  );
  battle.sides = teams.sides.clone();

  let mut ordered: Vec<&Killmail> = killmails.iter().collect();
  ordered.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.killmail_id.cmp(&b.killmail_id)));

  let mut seen = HashSet::new();
  let mut skipped = 0;
  for killmail in ordered {
    let victim = match validate(killmail, interval) {
      Ok(victim) => victim,
      Err(e) => {
        warn!(error = %e, "skipping killmail");
        skipped += 1;
        continue;
      }
    };

    let rows = std::iter::once(participation(killmail, 0, &victim.pilot, victim.damage_taken, false))
      .chain(killmail.attackers.iter().zip(1..).map(|(a, slot)| {
        participation(killmail, slot, &a.pilot, a.damage_done, a.final_blow)
      }));

    for mut row in rows {
      if !seen.insert(row.key()) {
        continue;
      }
      teams.backfill_names(&mut row.pilot);
      match teams.side_of(&row.pilot).and_then(|id| battle.sides.get_mut(id)) {
        Some(side) => side.ships.push(row),
        None => battle.unassigned.push(row),
      }
    }
  }

  battle.refresh(top_n);
  Compiled { battle, skipped }
}

fn validate<'k>(killmail: &'k Killmail, interval: &BattleInterval) -> Result<&'k Victim> {
  let malformed = |reason| Error::MalformedRecord { killmail_id: killmail.killmail_id, reason };

  let victim = killmail.victim.as_ref().ok_or_else(|| malformed("no victim"))?;
  if !interval.interval.contains(killmail.time) {
    return Err(malformed("time outside the battle interval"));
  }
  if killmail.location_id != interval.location_id {
    return Err(malformed("location differs from the battle location"));
  }
  Ok(victim)
}

/// Ledger row for the entry at `slot`; slot 0 is the victim.
fn participation(
  killmail: &Killmail,
  slot: u32,
  pilot: &Pilot,
  damage: f64,
  final_blow: bool,
) -> Participation {
  Participation {
    killmail_id: killmail.killmail_id,
    slot,
    time: killmail.time,
    pilot: pilot.clone(),
    damage,
    final_blow,
    was_lost: slot == 0,
    killmail_value: killmail.total_value,
  }
}
