//! Round lifecycle and the current-player pointer.
//!
//! ```text
//! Round:   PENDING ──open──► ACTIVE ──complete / force_close──► COMPLETED
//! Player:  AVAILABLE ──open──► IN_AUCTION ──► SOLD
//!                                   └────────► UNSOLD ──reselect──► AVAILABLE
//! ```
//!
//! Transitions here are pure; [`RoundMachine`] turns them into changesets
//! guarded by the versions that were read.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{AuctionError, AuctionResult};
use crate::events::DomainEvent;
use crate::ledger::{Changeset, LedgerRead, LedgerStore, Prepared};
use crate::logging::log_round_transition;
use crate::model::{
    ForceCloseRecord, Player, PlayerId, PlayerStatus, Record, Round, RoundId, RoundStatus,
    Timestamp, Tournament, TournamentId,
};
use crate::settlement;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    Start,
    OpenPlayer(PlayerId),
    ClosePlayer,
    Complete,
    ForceClose,
}

pub fn player_transition_allowed(from: PlayerStatus, to: PlayerStatus) -> bool {
    matches!(
        (from, to),
        (PlayerStatus::Available, PlayerStatus::InAuction)
            | (PlayerStatus::InAuction, PlayerStatus::Sold)
            | (PlayerStatus::InAuction, PlayerStatus::Unsold)
            | (PlayerStatus::Unsold, PlayerStatus::Available)
    )
}

pub fn transition_player(player: &mut Player, to: PlayerStatus) -> AuctionResult<()> {
    if !player_transition_allowed(player.status, to) {
        return Err(AuctionError::invalid(format!(
            "player {} cannot move {} -> {}",
            player.id, player.status, to
        )));
    }
    player.status = to;
    Ok(())
}

pub fn apply_round_event(round: &mut Round, event: RoundEvent, now: Timestamp) -> AuctionResult<()> {
    match (round.status, event) {
        (RoundStatus::Pending, RoundEvent::Start) => {
            round.status = RoundStatus::Active;
            round.started_at = Some(now);
            Ok(())
        }
        (RoundStatus::Active, RoundEvent::OpenPlayer(player)) => {
            if let Some(current) = &round.current_player {
                return Err(AuctionError::invalid(format!(
                    "round {} already has player {} open",
                    round.id, current
                )));
            }
            if !round.is_assigned(&player) {
                return Err(AuctionError::invalid(format!(
                    "player {} is not assigned to round {}",
                    player, round.id
                )));
            }
            round.current_player = Some(player);
            Ok(())
        }
        (RoundStatus::Active, RoundEvent::ClosePlayer) => {
            let Some(player) = round.current_player.take() else {
                return Err(AuctionError::invalid(format!("round {} has no open player", round.id)));
            };
            if !round.closed.contains(&player) {
                round.closed.push(player);
            }
            Ok(())
        }
        (RoundStatus::Active, RoundEvent::Complete) => {
            if round.current_player.is_some() {
                return Err(AuctionError::invalid(format!("round {} still has a player open", round.id)));
            }
            let pending = round.pending_players();
            if !pending.is_empty() {
                return Err(AuctionError::invalid(format!(
                    "round {} has {} players not yet auctioned",
                    round.id,
                    pending.len()
                )));
            }
            round.status = RoundStatus::Completed;
            round.completed_at = Some(now);
            Ok(())
        }
        (RoundStatus::Active, RoundEvent::ForceClose) => {
            if let Some(player) = round.current_player.take() {
                if !round.closed.contains(&player) {
                    round.closed.push(player);
                }
            }
            round.status = RoundStatus::Completed;
            round.completed_at = Some(now);
            round.forced = true;
            Ok(())
        }
        (status, event) => Err(AuctionError::invalid(format!(
            "round {} cannot apply {:?} while {}",
            round.id, event, status
        ))),
    }
}

pub struct RoundMachine {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl RoundMachine {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    fn check_players(&self, tournament: &TournamentId, players: &[PlayerId]) -> AuctionResult<()> {
        for id in players {
            let player = self.ledger.player(id)?;
            if &player.tournament_id != tournament {
                return Err(AuctionError::invalid(format!(
                    "player {} belongs to tournament {}",
                    id, player.tournament_id
                )));
            }
        }
        Ok(())
    }

    pub fn prepare_create(
        &self,
        tournament_id: &TournamentId,
        round_id: RoundId,
        name: &str,
        players: Vec<PlayerId>,
    ) -> AuctionResult<Prepared<Round>> {
        self.ledger.tournament(tournament_id)?;
        self.check_players(tournament_id, &players)?;
        let now = self.clock.now_ms();
        let mut assigned: Vec<PlayerId> = Vec::with_capacity(players.len());
        for p in players {
            if !assigned.contains(&p) {
                assigned.push(p);
            }
        }
        let round = Round {
            id: round_id,
            tournament_id: tournament_id.clone(),
            name: name.to_string(),
            status: RoundStatus::Pending,
            players: assigned,
            closed: Vec::new(),
            current_player: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            forced: false,
            version: 0,
        };
        let mut cs = Changeset::new(now);
        cs.insert(round.clone());
        let mut outcome = round;
        outcome.version = 1;
        Ok(Prepared { changeset: cs, outcome })
    }

    pub fn prepare_add_players(&self, round_id: &RoundId, players: Vec<PlayerId>) -> AuctionResult<Prepared<Round>> {
        let mut round = self.ledger.round(round_id)?;
        if round.status == RoundStatus::Completed {
            return Err(AuctionError::invalid(format!("round {} is completed", round.id)));
        }
        self.check_players(&round.tournament_id, &players)?;
        for p in players {
            if !round.players.contains(&p) {
                round.players.push(p);
            }
        }
        let outcome = round.committed();
        let mut cs = Changeset::new(self.clock.now_ms());
        cs.update(round);
        Ok(Prepared { changeset: cs, outcome })
    }

    /// PENDING -> ACTIVE. The tournament write makes concurrent opens in one
    /// tournament collide, so at most one round is ever ACTIVE.
    pub fn prepare_open_round(&self, round_id: &RoundId) -> AuctionResult<Prepared<Round>> {
        let mut round = self.ledger.round(round_id)?;
        let mut tournament = self.ledger.tournament(&round.tournament_id)?;
        if let Some(active) = &tournament.active_round {
            return Err(AuctionError::invalid(format!(
                "tournament {} already has active round {}",
                tournament.id, active
            )));
        }
        let now = self.clock.now_ms();
        apply_round_event(&mut round, RoundEvent::Start, now)?;
        tournament.active_round = Some(round.id.clone());

        let outcome = round.committed();
        let mut cs = Changeset::new(now);
        cs.emit(DomainEvent::RoundStarted {
            tournament_id: tournament.id.clone(),
            round_id: round.id.clone(),
        });
        cs.update(round).update(tournament);
        Ok(Prepared { changeset: cs, outcome })
    }

    pub fn prepare_open_player(&self, round_id: &RoundId, player_id: &PlayerId) -> AuctionResult<Prepared<Player>> {
        let mut round = self.ledger.round(round_id)?;
        let tournament = self.ledger.tournament(&round.tournament_id)?;
        if tournament.paused {
            return Err(AuctionError::AuctionPaused { tournament: tournament.id.to_string() });
        }
        let mut player = self.ledger.player(player_id)?;
        if player.tournament_id != round.tournament_id {
            return Err(AuctionError::invalid(format!("player {} is not in this tournament", player.id)));
        }
        let now = self.clock.now_ms();
        apply_round_event(&mut round, RoundEvent::OpenPlayer(player.id.clone()), now)?;
        transition_player(&mut player, PlayerStatus::InAuction)?;

        let outcome = player.committed();
        let mut cs = Changeset::new(now);
        cs.emit(DomainEvent::PlayerOpened { round_id: round.id.clone(), player_id: player.id.clone() });
        cs.update(round).update(player).guard(&tournament);
        Ok(Prepared { changeset: cs, outcome })
    }

    pub fn prepare_complete(&self, round_id: &RoundId) -> AuctionResult<Prepared<Round>> {
        let mut round = self.ledger.round(round_id)?;
        let mut tournament = self.ledger.tournament(&round.tournament_id)?;
        let now = self.clock.now_ms();
        apply_round_event(&mut round, RoundEvent::Complete, now)?;
        release_active_round(&mut tournament, &round.id);

        let outcome = round.committed();
        let mut cs = Changeset::new(now);
        release_round_holds(self.ledger.as_ref(), &mut cs, &round)?;
        cs.emit(DomainEvent::RoundCompleted {
            tournament_id: tournament.id.clone(),
            round_id: round.id.clone(),
            forced: false,
        });
        cs.update(round).update(tournament);
        Ok(Prepared { changeset: cs, outcome })
    }

    /// Administrative close. A player still under bid is marked UNSOLD with
    /// its bids superseded and holds released, in the same commit.
    pub fn prepare_force_close(&self, round_id: &RoundId) -> AuctionResult<Prepared<ForceCloseRecord>> {
        let mut round = self.ledger.round(round_id)?;
        let mut tournament = self.ledger.tournament(&round.tournament_id)?;
        let now = self.clock.now_ms();
        let mut cs = Changeset::new(now);

        let unsold = match round.current_player.clone() {
            Some(player_id) => {
                let player = self.ledger.player(&player_id)?;
                Some(settlement::dispose_unsold(self.ledger.as_ref(), &mut cs, player, &round, true, now)?)
            }
            None => None,
        };
        apply_round_event(&mut round, RoundEvent::ForceClose, now)?;
        release_active_round(&mut tournament, &round.id);
        release_round_holds(self.ledger.as_ref(), &mut cs, &round)?;

        let outcome = ForceCloseRecord { round: round.committed(), unsold };
        cs.emit(DomainEvent::RoundCompleted {
            tournament_id: tournament.id.clone(),
            round_id: round.id.clone(),
            forced: true,
        });
        cs.update(round).update(tournament);
        Ok(Prepared { changeset: cs, outcome })
    }

    pub fn log_transition(round: &Round, from: RoundStatus) {
        log_round_transition(round.id.as_str(), round.tournament_id.as_str(), from.as_str(), round.status.as_str());
    }
}

/// Releases held reservations on every player assigned to `round`.
fn release_round_holds<S: LedgerStore + ?Sized>(ledger: &S, cs: &mut Changeset, round: &Round) -> AuctionResult<()> {
    for player in &round.players {
        settlement::release_stray_holds(ledger, cs, &round.tournament_id, player)?;
    }
    Ok(())
}

fn release_active_round(tournament: &mut Tournament, round: &RoundId) {
    if tournament.active_round.as_ref() == Some(round) {
        tournament.active_round = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_with(players: &[&str]) -> Round {
        Round {
            id: RoundId::new("r-1"),
            tournament_id: TournamentId::new("t-1"),
            name: "Marquee".into(),
            status: RoundStatus::Pending,
            players: players.iter().map(|p| PlayerId::new(*p)).collect(),
            closed: vec![],
            current_player: None,
            created_at: 0,
            started_at: None,
            completed_at: None,
            forced: false,
            version: 1,
        }
    }

    #[test]
    fn test_player_transition_table() {
        use PlayerStatus::*;
        let all = [Available, InAuction, Sold, Unsold];
        let allowed = [(Available, InAuction), (InAuction, Sold), (InAuction, Unsold), (Unsold, Available)];
        for from in all {
            for to in all {
                assert_eq!(
                    player_transition_allowed(from, to),
                    allowed.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_round_lifecycle() {
        let mut r = round_with(&["p-1"]);
        apply_round_event(&mut r, RoundEvent::Start, 10).unwrap();
        assert_eq!(r.status, RoundStatus::Active);
        apply_round_event(&mut r, RoundEvent::OpenPlayer("p-1".into()), 11).unwrap();
        assert!(apply_round_event(&mut r, RoundEvent::Complete, 12).is_err());
        apply_round_event(&mut r, RoundEvent::ClosePlayer, 12).unwrap();
        apply_round_event(&mut r, RoundEvent::Complete, 13).unwrap();
        assert_eq!(r.status, RoundStatus::Completed);
        assert_eq!(r.completed_at, Some(13));
        assert!(apply_round_event(&mut r, RoundEvent::Start, 14).is_err());
    }

    #[test]
    fn test_open_player_requires_empty_slot_and_assignment() {
        let mut r = round_with(&["p-1", "p-2"]);
        apply_round_event(&mut r, RoundEvent::Start, 0).unwrap();
        assert!(apply_round_event(&mut r, RoundEvent::OpenPlayer("p-9".into()), 1).is_err());
        apply_round_event(&mut r, RoundEvent::OpenPlayer("p-1".into()), 1).unwrap();
        let err = apply_round_event(&mut r, RoundEvent::OpenPlayer("p-2".into()), 2).unwrap_err();
        assert!(matches!(err, AuctionError::InvalidTransition(_)));
    }

    #[test]
    fn test_close_without_open_player_fails() {
        let mut r = round_with(&["p-1"]);
        apply_round_event(&mut r, RoundEvent::Start, 0).unwrap();
        assert!(apply_round_event(&mut r, RoundEvent::ClosePlayer, 1).is_err());
    }

    #[test]
    fn test_complete_requires_every_player_closed() {
        let mut r = round_with(&["p-1", "p-2"]);
        apply_round_event(&mut r, RoundEvent::Start, 0).unwrap();
        apply_round_event(&mut r, RoundEvent::OpenPlayer("p-1".into()), 1).unwrap();
        apply_round_event(&mut r, RoundEvent::ClosePlayer, 2).unwrap();
        assert!(apply_round_event(&mut r, RoundEvent::Complete, 3).is_err());
    }

    #[test]
    fn test_force_close_clears_slot() {
        let mut r = round_with(&["p-1", "p-2"]);
        apply_round_event(&mut r, RoundEvent::Start, 0).unwrap();
        apply_round_event(&mut r, RoundEvent::OpenPlayer("p-1".into()), 1).unwrap();
        apply_round_event(&mut r, RoundEvent::ForceClose, 2).unwrap();
        assert_eq!(r.status, RoundStatus::Completed);
        assert!(r.forced);
        assert!(r.current_player.is_none());
        assert!(r.closed.contains(&PlayerId::new("p-1")));
    }

    #[test]
    fn test_pending_round_cannot_force_close() {
        let mut r = round_with(&[]);
        assert!(apply_round_event(&mut r, RoundEvent::ForceClose, 0).is_err());
    }
}
