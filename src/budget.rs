//! Budget tracker.
//!
//! Remaining budget counts committed sales only. Live reservations and the
//! roster floor narrow what a team may bid on top of that:
//!
//! ```text
//! spendable = (total − spent) − Σ live holds on other players − roster floor
//! roster floor = min_player_value × max(0, min_players − roster − 1)
//! ```

use std::sync::Arc;

use serde_json::json;

use crate::clock::Clock;
use crate::error::{AuctionError, AuctionResult};
use crate::ledger::{Changeset, LedgerRead, LedgerStore, Prepared};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{
    Amount, HoldId, HoldState, PlayerId, Reservation, TeamId, Team, Timestamp, Tournament,
};

/// Amount a team must keep back to complete its minimum squad after winning
/// the player currently under bid.
pub fn roster_floor(team: &Team, tournament: &Tournament) -> Amount {
    let still_needed = tournament
        .min_players_per_team
        .saturating_sub(team.roster.len() as u32)
        .saturating_sub(1);
    tournament.min_player_value.saturating_mul(still_needed as Amount)
}

/// Sum of live holds, ignoring those on `exclude_player`.
pub fn held_amount(reservations: &[Reservation], exclude_player: Option<&PlayerId>, now: Timestamp) -> Amount {
    reservations
        .iter()
        .filter(|r| r.is_live(now))
        .filter(|r| exclude_player != Some(&r.player_id))
        .map(|r| r.amount)
        .sum()
}

pub fn spendable(
    team: &Team,
    tournament: &Tournament,
    reservations: &[Reservation],
    exclude_player: Option<&PlayerId>,
    now: Timestamp,
) -> Amount {
    team.remaining_budget()
        .saturating_sub(held_amount(reservations, exclude_player, now))
        .saturating_sub(roster_floor(team, tournament))
}

pub fn released(hold: &Reservation) -> Reservation {
    let mut next = hold.clone();
    next.state = HoldState::Released;
    next
}

pub fn committed_hold(hold: &Reservation) -> Reservation {
    let mut next = hold.clone();
    next.state = HoldState::Committed;
    next
}

pub struct BudgetTracker {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    reservation_ttl_ms: u64,
}

impl BudgetTracker {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, reservation_ttl_ms: u64) -> Self {
        Self { ledger, clock, reservation_ttl_ms }
    }

    pub fn remaining_budget(&self, team: &TeamId) -> AuctionResult<Amount> {
        Ok(self.ledger.team(team)?.remaining_budget())
    }

    pub fn spendable(&self, team: &TeamId, exclude_player: Option<&PlayerId>) -> AuctionResult<Amount> {
        let team = self.ledger.team(team)?;
        let tournament = self.ledger.tournament(&team.tournament_id)?;
        let holds = self.ledger.reservations_for_team(&team.id)?;
        Ok(spendable(&team, &tournament, &holds, exclude_player, self.clock.now_ms()))
    }

    pub fn can_afford(&self, team: &TeamId, amount: Amount) -> AuctionResult<bool> {
        Ok(amount <= self.spendable(team, None)?)
    }

    /// New HELD reservation expiring after the configured TTL.
    pub fn hold(&self, team: &TeamId, player: &PlayerId, amount: Amount, hold_id: HoldId) -> Reservation {
        Reservation {
            id: hold_id,
            team_id: team.clone(),
            player_id: player.clone(),
            amount,
            expires_at: self.clock.now_ms().saturating_add(self.reservation_ttl_ms),
            state: HoldState::Held,
            version: 0,
        }
    }

    /// Standalone hold. The team record is rewritten so concurrent holds
    /// for one team serialize on its version.
    pub fn prepare_reserve(
        &self,
        team_id: &TeamId,
        player: &PlayerId,
        amount: Amount,
        hold_id: HoldId,
    ) -> AuctionResult<Prepared<Reservation>> {
        let team = self.ledger.team(team_id)?;
        let tournament = self.ledger.tournament(&team.tournament_id)?;
        let holds = self.ledger.reservations_for_team(team_id)?;
        let now = self.clock.now_ms();
        let available = spendable(&team, &tournament, &holds, None, now);
        if amount > available {
            return Err(AuctionError::InsufficientBudget {
                team: team_id.to_string(),
                amount,
                spendable: available,
            });
        }
        let hold = self.hold(team_id, player, amount, hold_id);
        let mut cs = Changeset::new(now);
        cs.update(team).insert(hold.clone());
        let mut outcome = hold;
        outcome.version = 1;
        Ok(Prepared { changeset: cs, outcome })
    }

    pub fn reserve(
        &self,
        team_id: &TeamId,
        player: &PlayerId,
        amount: Amount,
        hold_id: HoldId,
    ) -> AuctionResult<Reservation> {
        let prepared = self.prepare_reserve(team_id, player, amount, hold_id)?;
        self.ledger.commit(prepared.changeset)?;
        log(
            Level::Debug,
            Domain::Budget,
            "reserve",
            obj(&[
                ("team_id", v_str(team_id.as_str())),
                ("player_id", v_str(player.as_str())),
                ("amount", json!(amount)),
                ("hold_id", v_str(prepared.outcome.id.as_str())),
            ]),
        );
        Ok(prepared.outcome)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::{seed_registration, MemoryLedger};
    use crate::model::Player;

    fn hold(player: &str, amount: Amount, expires_at: Timestamp, state: HoldState) -> Reservation {
        Reservation {
            id: HoldId::generate(),
            team_id: TeamId::new("a"),
            player_id: PlayerId::new(player),
            amount,
            expires_at,
            state,
            version: 1,
        }
    }

    #[test]
    fn test_roster_floor() {
        let t = Tournament::new("t", "T", 1000).with_roster_limits(3, 10, 50);
        let mut team = Team::new("a", &t, "A");
        // Needs 3; winning this one leaves 2 more at 50 each.
        assert_eq!(roster_floor(&team, &t), 100);
        team.roster = vec!["x".into(), "y".into()];
        assert_eq!(roster_floor(&team, &t), 0);
        team.roster.push("z".into());
        assert_eq!(roster_floor(&team, &t), 0);
    }

    #[test]
    fn test_spendable_excludes_expired_and_same_player() {
        let t = Tournament::new("t", "T", 1000);
        let team = Team::new("a", &t, "A");
        let holds = vec![
            hold("p-1", 300, 10_000, HoldState::Held),
            hold("p-2", 200, 10_000, HoldState::Held),
            hold("p-3", 100, 500, HoldState::Held),      // expired at now=1000
            hold("p-4", 400, 10_000, HoldState::Released),
        ];
        assert_eq!(spendable(&team, &t, &holds, None, 1_000), 500);
        assert_eq!(spendable(&team, &t, &holds, Some(&PlayerId::new("p-1")), 1_000), 800);
    }

    #[test]
    fn test_spent_reduces_remaining() {
        let t = Tournament::new("t", "T", 1000);
        let mut team = Team::new("a", &t, "A");
        team.spent = 1200;
        assert_eq!(team.remaining_budget(), 0);
        assert_eq!(spendable(&team, &t, &[], None, 0), 0);
    }

    #[test]
    fn test_reserve_commits_and_counts() {
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let t = Tournament::new("t", "T", 1000);
        let team = Team::new("a", &t, "A");
        let p = Player::new("p-1", &t, "P", 10);
        seed_registration(ledger.as_ref(), t, vec![team], vec![p], 0).unwrap();

        let tracker = BudgetTracker::new(ledger.clone(), clock.clone(), 60_000);
        tracker.reserve(&"a".into(), &"p-1".into(), 700, HoldId::new("h-1")).unwrap();
        assert!(tracker.can_afford(&"a".into(), 300).unwrap());
        assert!(!tracker.can_afford(&"a".into(), 301).unwrap());
        assert_eq!(tracker.remaining_budget(&"a".into()).unwrap(), 1000);

        let err = tracker.reserve(&"a".into(), &"p-1".into(), 400, HoldId::new("h-2")).unwrap_err();
        assert!(matches!(err, AuctionError::InsufficientBudget { spendable: 300, .. }));

        // Time-boxed: once expired the hold stops counting.
        clock.advance(60_000);
        assert!(tracker.can_afford(&"a".into(), 1000).unwrap());
    }
}
