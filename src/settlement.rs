//! Settlement: sell, unsold disposition and reselection.
//!
//! Each operation builds one changeset covering the player, the winning team,
//! the round slot, every affected bid and every affected hold. Either all of
//! it lands or none of it does.

use std::sync::Arc;

use crate::budget::{committed_hold, released};
use crate::clock::Clock;
use crate::error::{AuctionError, AuctionResult};
use crate::events::DomainEvent;
use crate::ledger::{Changeset, LedgerRead, LedgerStore, Prepared};
use crate::logging::{log_sale, log_unsold};
use crate::model::{
    Bid, BidId, BidStatus, HoldState, Player, PlayerId, PlayerStatus, Record, Round, SaleRecord,
    Timestamp, Tournament, TournamentId, UnsoldRecord,
};
use crate::round::{apply_round_event, transition_player, RoundEvent};

/// Supersedes every ACTIVE bid in `bids` and releases their live holds.
/// Returns the ids superseded.
pub(crate) fn supersede_all<S: LedgerStore + ?Sized>(
    ledger: &S,
    cs: &mut Changeset,
    bids: &[Bid],
) -> AuctionResult<Vec<BidId>> {
    let mut superseded = Vec::new();
    for bid in bids.iter().filter(|b| b.is_active()) {
        let mut next = bid.clone();
        next.status = BidStatus::Superseded;
        cs.update(next);
        if let Some(hold) = ledger.reservation(&bid.hold_id)? {
            if hold.state == HoldState::Held {
                cs.update(released(&hold));
            }
        }
        superseded.push(bid.id.clone());
    }
    Ok(superseded)
}

/// Releases every HELD reservation on `player`, whichever team placed it,
/// unless `cs` already writes that hold. Covers standalone holds that no bid
/// points at.
pub(crate) fn release_stray_holds<S: LedgerStore + ?Sized>(
    ledger: &S,
    cs: &mut Changeset,
    tournament: &TournamentId,
    player: &PlayerId,
) -> AuctionResult<usize> {
    let mut count = 0;
    for team in ledger.teams_in(tournament)? {
        for hold in ledger.reservations_for_team(&team.id)? {
            if &hold.player_id != player || hold.state != HoldState::Held || cs.writes_to(&hold.key()) {
                continue;
            }
            cs.update(released(&hold));
            count += 1;
        }
    }
    Ok(count)
}

/// Marks `player` UNSOLD inside `cs`: bids superseded, holds released, sale
/// fields cleared. The caller owns the round write.
pub(crate) fn dispose_unsold<S: LedgerStore + ?Sized>(
    ledger: &S,
    cs: &mut Changeset,
    mut player: Player,
    round: &Round,
    overridden: bool,
    now: Timestamp,
) -> AuctionResult<UnsoldRecord> {
    let bids = ledger.bids_for(&player.id)?;
    let superseded = supersede_all(ledger, cs, &bids)?;
    release_stray_holds(ledger, cs, &player.tournament_id, &player.id)?;
    transition_player(&mut player, PlayerStatus::Unsold)?;
    player.leading = None;
    player.sold_price = None;
    player.sold_to = None;

    cs.emit(DomainEvent::PlayerUnsold {
        round_id: round.id.clone(),
        player_id: player.id.clone(),
        overridden,
    });
    let record = UnsoldRecord {
        player_id: player.id.clone(),
        round_id: round.id.clone(),
        overridden,
        superseded_bids: superseded,
        recorded_at: now,
    };
    cs.update(player);
    Ok(record)
}

pub struct SettlementEngine {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl SettlementEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// The player, its tournament and the active round, provided the player
    /// is the one currently open.
    fn open_slot(&self, player_id: &PlayerId) -> AuctionResult<(Player, Tournament, Round)> {
        let player = self.ledger.player(player_id)?;
        if player.status != PlayerStatus::InAuction {
            return Err(AuctionError::invalid(format!(
                "player {} is {}, not IN_AUCTION",
                player.id, player.status
            )));
        }
        let tournament = self.ledger.tournament(&player.tournament_id)?;
        let Some(round_id) = tournament.active_round.clone() else {
            return Err(AuctionError::invalid(format!("tournament {} has no active round", tournament.id)));
        };
        let round = self.ledger.round(&round_id)?;
        if round.current_player.as_ref() != Some(&player.id) {
            return Err(AuctionError::invalid(format!(
                "player {} is not open in round {}",
                player.id, round.id
            )));
        }
        Ok((player, tournament, round))
    }

    pub fn prepare_sell(&self, player_id: &PlayerId) -> AuctionResult<Prepared<SaleRecord>> {
        let (mut player, tournament, mut round) = self.open_slot(player_id)?;
        let bids = self.ledger.bids_for(player_id)?;
        let Some(winner) = bids.iter().filter(|b| b.is_active()).max_by_key(|b| b.amount).cloned() else {
            return Err(AuctionError::NoBidsPresent { player: player_id.to_string() });
        };

        let mut team = self.ledger.team(&winner.team_id)?;
        if team.roster.len() as u32 >= tournament.max_players_per_team {
            return Err(AuctionError::RosterFull {
                team: team.id.to_string(),
                max: tournament.max_players_per_team,
            });
        }
        if winner.amount > team.remaining_budget() {
            return Err(AuctionError::InsufficientBudget {
                team: team.id.to_string(),
                amount: winner.amount,
                spendable: team.remaining_budget(),
            });
        }

        let now = self.clock.now_ms();
        let mut cs = Changeset::new(now);

        // Winner's hold becomes permanent; every other hold on the player goes.
        if let Some(hold) = self.ledger.reservation(&winner.hold_id)? {
            if hold.state == HoldState::Held {
                cs.update(committed_hold(&hold));
            }
        }
        let losers: Vec<Bid> = bids.iter().filter(|b| b.is_active() && b.id != winner.id).cloned().collect();
        supersede_all(self.ledger.as_ref(), &mut cs, &losers)?;
        release_stray_holds(self.ledger.as_ref(), &mut cs, &tournament.id, &player.id)?;

        team.spent = team.spent.saturating_add(winner.amount);
        team.roster.push(player.id.clone());
        transition_player(&mut player, PlayerStatus::Sold)?;
        player.sold_price = Some(winner.amount);
        player.sold_to = Some(team.id.clone());
        apply_round_event(&mut round, RoundEvent::ClosePlayer, now)?;

        let record = SaleRecord {
            player_id: player.id.clone(),
            team_id: team.id.clone(),
            round_id: round.id.clone(),
            bid_id: winner.id.clone(),
            sold_price: winner.amount,
            team_remaining: team.remaining_budget(),
            sold_at: now,
        };
        cs.emit(DomainEvent::PlayerSold {
            round_id: round.id.clone(),
            player_id: player.id.clone(),
            team_id: team.id.clone(),
            price: winner.amount,
        });
        cs.update(team).update(player).update(round).guard(&winner);
        Ok(Prepared { changeset: cs, outcome: record })
    }

    pub fn prepare_mark_unsold(&self, player_id: &PlayerId, overridden: bool) -> AuctionResult<Prepared<UnsoldRecord>> {
        let (player, _tournament, mut round) = self.open_slot(player_id)?;
        let active = self.ledger.bids_for(player_id)?.into_iter().filter(|b| b.is_active()).count();
        if active > 0 && !overridden {
            return Err(AuctionError::NotEligible {
                player: player_id.to_string(),
                status: player.status,
                reason: format!("{} active bids; administrative override required", active),
            });
        }
        let now = self.clock.now_ms();
        let mut cs = Changeset::new(now);
        let record = dispose_unsold(self.ledger.as_ref(), &mut cs, player, &round, overridden, now)?;
        apply_round_event(&mut round, RoundEvent::ClosePlayer, now)?;
        cs.update(round);
        Ok(Prepared { changeset: cs, outcome: record })
    }

    pub fn prepare_reselect(&self, player_id: &PlayerId) -> AuctionResult<Prepared<Player>> {
        let mut player = self.ledger.player(player_id)?;
        if player.status != PlayerStatus::Unsold {
            return Err(AuctionError::NotEligible {
                player: player_id.to_string(),
                status: player.status,
                reason: "only UNSOLD players can be reselected".to_string(),
            });
        }
        let now = self.clock.now_ms();
        let mut cs = Changeset::new(now);
        let bids = self.ledger.bids_for(player_id)?;
        supersede_all(self.ledger.as_ref(), &mut cs, &bids)?;
        release_stray_holds(self.ledger.as_ref(), &mut cs, &player.tournament_id, &player.id)?;

        transition_player(&mut player, PlayerStatus::Available)?;
        player.sold_price = None;
        player.sold_to = None;
        player.leading = None;

        let outcome = player.committed();
        cs.emit(DomainEvent::PlayerReselected { player_id: player.id.clone() });
        cs.update(player);
        Ok(Prepared { changeset: cs, outcome })
    }

    pub fn sell(&self, player_id: &PlayerId) -> AuctionResult<SaleRecord> {
        let prepared = self.prepare_sell(player_id)?;
        self.ledger.commit(prepared.changeset)?;
        let sale = prepared.outcome;
        log_sale(sale.player_id.as_str(), sale.team_id.as_str(), sale.sold_price, sale.team_remaining);
        Ok(sale)
    }

    pub fn mark_unsold(&self, player_id: &PlayerId, overridden: bool) -> AuctionResult<UnsoldRecord> {
        let prepared = self.prepare_mark_unsold(player_id, overridden)?;
        self.ledger.commit(prepared.changeset)?;
        let record = prepared.outcome;
        log_unsold(record.player_id.as_str(), record.overridden, record.superseded_bids.len());
        Ok(record)
    }

    pub fn reselect(&self, player_id: &PlayerId) -> AuctionResult<Player> {
        let prepared = self.prepare_reselect(player_id)?;
        self.ledger.commit(prepared.changeset)?;
        Ok(prepared.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::BidArbiter;
    use crate::clock::ManualClock;
    use crate::ledger::{seed_registration, MemoryLedger};
    use crate::model::{RoundId, Team, TeamId};
    use crate::round::RoundMachine;

    struct Fixture {
        ledger: Arc<dyn LedgerStore>,
        rounds: RoundMachine,
        arbiter: BidArbiter,
        settlement: SettlementEngine,
    }

    fn commit<T>(ledger: &Arc<dyn LedgerStore>, prepared: Prepared<T>) -> T {
        ledger.commit(prepared.changeset).unwrap();
        prepared.outcome
    }

    fn fixture() -> Fixture {
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let t = Tournament::new("t-1", "League", 1000);
        let teams = vec![Team::new("a", &t, "Alpha"), Team::new("b", &t, "Bravo")];
        let players = vec![Player::new("p-1", &t, "Opener", 100)];
        seed_registration(ledger.as_ref(), t, teams, players, 0).unwrap();

        let rounds = RoundMachine::new(ledger.clone(), clock.clone());
        let r = commit(&ledger, rounds.prepare_create(&"t-1".into(), RoundId::new("r-1"), "R1", vec!["p-1".into()]).unwrap());
        commit(&ledger, rounds.prepare_open_round(&r.id).unwrap());
        commit(&ledger, rounds.prepare_open_player(&r.id, &"p-1".into()).unwrap());

        Fixture {
            arbiter: BidArbiter::new(ledger.clone(), clock.clone(), 60_000),
            settlement: SettlementEngine::new(ledger.clone(), clock),
            rounds,
            ledger,
        }
    }

    #[test]
    fn test_sell_without_bids_fails() {
        let f = fixture();
        let err = f.settlement.sell(&"p-1".into()).unwrap_err();
        assert!(matches!(err, AuctionError::NoBidsPresent { .. }));
    }

    #[test]
    fn test_sell_debits_winner_and_closes_slot() {
        let f = fixture();
        f.arbiter.place_bid(&TeamId::new("a"), &"p-1".into(), 150).unwrap();
        f.arbiter.place_bid(&TeamId::new("b"), &"p-1".into(), 200).unwrap();
        let sale = f.settlement.sell(&"p-1".into()).unwrap();
        assert_eq!(sale.team_id, TeamId::new("b"));
        assert_eq!(sale.team_remaining, 800);

        let b = f.ledger.team(&"b".into()).unwrap();
        assert_eq!(b.spent, 200);
        assert_eq!(b.roster, vec![PlayerId::new("p-1")]);
        assert_eq!(f.ledger.team(&"a".into()).unwrap().spent, 0);

        let round = f.ledger.round(&"r-1".into()).unwrap();
        assert!(round.current_player.is_none());

        let holds = f.ledger.reservations_for_team(&"b".into()).unwrap();
        assert_eq!(holds[0].state, HoldState::Committed);
        let holds = f.ledger.reservations_for_team(&"a".into()).unwrap();
        assert_eq!(holds[0].state, HoldState::Released);

        // Slot is closed: a second sale is a state machine error.
        assert!(matches!(f.settlement.sell(&"p-1".into()), Err(AuctionError::InvalidTransition(_))));
    }

    #[test]
    fn test_mark_unsold_needs_override_with_bids() {
        let f = fixture();
        f.arbiter.place_bid(&TeamId::new("a"), &"p-1".into(), 150).unwrap();
        let err = f.settlement.mark_unsold(&"p-1".into(), false).unwrap_err();
        assert!(matches!(err, AuctionError::NotEligible { .. }));

        let rec = f.settlement.mark_unsold(&"p-1".into(), true).unwrap();
        assert_eq!(rec.superseded_bids.len(), 1);
        let p = f.ledger.player(&"p-1".into()).unwrap();
        assert_eq!(p.status, PlayerStatus::Unsold);
        assert!(p.leading.is_none());
        let holds = f.ledger.reservations_for_team(&"a".into()).unwrap();
        assert_eq!(holds[0].state, HoldState::Released);
    }

    #[test]
    fn test_reselect_only_from_unsold() {
        let f = fixture();
        let err = f.settlement.reselect(&"p-1".into()).unwrap_err();
        assert!(matches!(err, AuctionError::NotEligible { status: PlayerStatus::InAuction, .. }));

        f.settlement.mark_unsold(&"p-1".into(), false).unwrap();
        let p = f.settlement.reselect(&"p-1".into()).unwrap();
        assert_eq!(p.status, PlayerStatus::Available);
        assert_eq!(p.sold_price, None);

        // Reselected player can go under the hammer again in the same round.
        let r = f.ledger.round(&"r-1".into()).unwrap();
        f.ledger.commit(f.rounds.prepare_open_player(&r.id, &"p-1".into()).unwrap().changeset).unwrap();
        assert_eq!(f.ledger.player(&"p-1".into()).unwrap().status, PlayerStatus::InAuction);
    }
}
