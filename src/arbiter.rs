//! Bid admission.
//!
//! A bid is admitted against the versions it was validated on: the player
//! record (bumped on every admitted bid, so two bids on one player always
//! collide), the round slot and the bidding team. Prior ACTIVE bids are
//! superseded and their holds released in the same commit.

use std::sync::Arc;

use crate::budget::{self, BudgetTracker};
use crate::clock::Clock;
use crate::error::{AuctionError, AuctionResult};
use crate::events::DomainEvent;
use crate::ledger::{Changeset, LedgerRead, LedgerStore, Prepared};
use crate::logging::{log_bid_accepted, log_bid_rejected};
use crate::model::{Amount, Bid, BidId, BidStatus, HoldId, LeadingBid, PlayerId, PlayerStatus, TeamId};
use crate::settlement::supersede_all;

pub struct BidArbiter {
    ledger: Arc<dyn LedgerStore>,
    budget: BudgetTracker,
}

impl BidArbiter {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, reservation_ttl_ms: u64) -> Self {
        Self { budget: BudgetTracker::new(ledger.clone(), clock, reservation_ttl_ms), ledger }
    }

    pub fn prepare_place_bid(&self, team_id: &TeamId, player_id: &PlayerId, amount: Amount) -> AuctionResult<Prepared<Bid>> {
        let mut player = self.ledger.player(player_id)?;
        let tournament = self.ledger.tournament(&player.tournament_id)?;
        if tournament.paused {
            return Err(AuctionError::AuctionPaused { tournament: tournament.id.to_string() });
        }
        let team = self.ledger.team(team_id)?;
        if team.tournament_id != tournament.id {
            return Err(AuctionError::invalid(format!(
                "team {} is not registered in tournament {}",
                team.id, tournament.id
            )));
        }

        // 1. Player must be the one open in the active round.
        let not_open = || AuctionError::NotOpenForBidding { player: player_id.to_string() };
        let round_id = tournament.active_round.clone().ok_or_else(not_open)?;
        let round = self.ledger.round(&round_id)?;
        if round.current_player.as_ref() != Some(player_id) || player.status != PlayerStatus::InAuction {
            return Err(not_open());
        }

        // 2. Strictly above base price and the current high bid.
        let bids = self.ledger.bids_for(player_id)?;
        let highest = bids.iter().filter(|b| b.is_active()).map(|b| b.amount).max();
        let floor = highest.unwrap_or(0).max(player.base_price);
        if amount <= floor {
            return Err(AuctionError::BidTooLow { player: player_id.to_string(), amount, floor });
        }

        // 3. Roster room and budget, net of holds on other players.
        if team.roster.len() as u32 >= tournament.max_players_per_team {
            return Err(AuctionError::RosterFull {
                team: team.id.to_string(),
                max: tournament.max_players_per_team,
            });
        }
        let now = self.budget.now();
        let holds = self.ledger.reservations_for_team(team_id)?;
        let available = budget::spendable(&team, &tournament, &holds, Some(player_id), now);
        if amount > available {
            return Err(AuctionError::InsufficientBudget {
                team: team.id.to_string(),
                amount,
                spendable: available,
            });
        }

        let mut cs = Changeset::new(now);
        let superseded = supersede_all(self.ledger.as_ref(), &mut cs, &bids)?;

        let bid_id = BidId::generate();
        let hold_id = HoldId::new(format!("hold-{}", bid_id));
        let bid = Bid {
            id: bid_id.clone(),
            tournament_id: tournament.id.clone(),
            round_id: round.id.clone(),
            team_id: team.id.clone(),
            player_id: player.id.clone(),
            amount,
            placed_at: now,
            status: BidStatus::Active,
            hold_id: hold_id.clone(),
            version: 0,
        };
        player.leading = Some(LeadingBid { bid_id: bid_id.clone(), team_id: team.id.clone(), amount });

        cs.emit(DomainEvent::BidAccepted {
            player_id: player.id.clone(),
            team_id: team.id.clone(),
            bid_id,
            amount,
            superseded,
        });
        cs.insert(bid.clone())
            .insert(self.budget.hold(team_id, player_id, amount, hold_id))
            .update(player)
            .guard(&round)
            .guard(&team)
            .guard(&tournament);

        let mut outcome = bid;
        outcome.version = 1;
        Ok(Prepared { changeset: cs, outcome })
    }

    pub fn place_bid(&self, team_id: &TeamId, player_id: &PlayerId, amount: Amount) -> AuctionResult<Bid> {
        let prepared = match self.prepare_place_bid(team_id, player_id, amount) {
            Ok(p) => p,
            Err(err) => {
                if !err.is_retryable() {
                    log_bid_rejected(player_id.as_str(), team_id.as_str(), amount, err.code(), &err.to_string());
                }
                return Err(err);
            }
        };
        let superseded = prepared.changeset.events.iter().map(|e| match e {
            DomainEvent::BidAccepted { superseded, .. } => superseded.len(),
            _ => 0,
        });
        let superseded: usize = superseded.sum();
        self.ledger.commit(prepared.changeset)?;
        log_bid_accepted(player_id.as_str(), team_id.as_str(), amount, superseded);
        Ok(prepared.outcome)
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }
}
