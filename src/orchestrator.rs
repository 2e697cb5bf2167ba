//! Auction orchestrator: the façade admin and team-owner callers talk to.
//!
//! ```text
//!   request(key) ─► idempotency lookup ─┬─ hit: same op + params ─► stored outcome
//!                                       ├─ hit: different request ─► IdempotencyKeyReused
//!                                       └─ miss ─► prepare ─► attach record ─► commit
//!                                                     ▲                          │
//!                                                     └──── Conflict (backoff) ◄─┘
//! ```
//!
//! Each attempt re-reads everything it depends on. Events are pushed to the
//! registered sinks once, after the commit that wrote them.

use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::arbiter::BidArbiter;
use crate::budget::BudgetTracker;
use crate::clock::{Clock, SystemClock};
use crate::config::AuctionConfig;
use crate::error::{AuctionError, AuctionResult, ErrorClass};
use crate::events::{DomainEvent, EventEnvelope, EventSink};
use crate::ledger::{Changeset, CommitReceipt, IdempotencyRecord, LedgerRead, LedgerStore, Prepared};
use crate::logging::{
    log, log_bid_accepted, log_bid_rejected, log_sale, log_unsold, obj, v_str, Domain, Level,
    ProfileScope,
};
use crate::model::{
    Amount, Bid, ForceCloseRecord, Player, PlayerId, Record, RequestId, Round, RoundId, RoundStatus,
    SaleRecord, TeamId, Tournament, TournamentId, UnsoldRecord,
};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::round::RoundMachine;
use crate::settlement::SettlementEngine;

pub struct Orchestrator {
    ledger: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    rounds: RoundMachine,
    arbiter: BidArbiter,
    settlement: SettlementEngine,
    retry: RetryConfig,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

/// Hex sha-256 of the operation name and its canonical parameters.
pub fn fingerprint(operation: &str, params: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(b"\0");
    hasher.update(params.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl Orchestrator {
    pub fn new(ledger: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, cfg: &AuctionConfig) -> Self {
        Self {
            rounds: RoundMachine::new(ledger.clone(), clock.clone()),
            arbiter: BidArbiter::new(ledger.clone(), clock.clone(), cfg.reservation_ttl_ms),
            settlement: SettlementEngine::new(ledger.clone(), clock.clone()),
            retry: cfg.retry_config(),
            sinks: RwLock::new(Vec::new()),
            ledger,
            clock,
        }
    }

    /// Opens the configured ledger with the wall clock.
    pub fn from_config(cfg: &AuctionConfig) -> AuctionResult<Self> {
        Ok(Self::new(cfg.open_ledger()?, Arc::new(SystemClock), cfg))
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn budget(&self) -> &BudgetTracker {
        self.arbiter.budget()
    }

    // =========================================================================
    // Idempotent execution
    // =========================================================================

    async fn execute<T, F>(
        &self,
        request: &RequestId,
        operation: &'static str,
        params: Value,
        prepare: F,
    ) -> AuctionResult<Executed<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> AuctionResult<Prepared<T>>,
    {
        let _scope = ProfileScope::with_context(
            "orchestrator.execute",
            &[("operation", v_str(operation)), ("request_id", v_str(request.as_str()))],
        );
        let fingerprint = fingerprint(operation, &params);
        let executed = retry_on_conflict(&self.retry, operation, || {
            if let Some(rec) = self.ledger.idempotency(request)? {
                return replay(&rec, operation, &fingerprint);
            }
            let Prepared { mut changeset, outcome } = prepare()?;
            changeset.idempotency = Some(IdempotencyRecord {
                key: request.clone(),
                operation: operation.to_string(),
                fingerprint: fingerprint.clone(),
                outcome: serde_json::to_string(&outcome)?,
                recorded_at: changeset.recorded_at,
            });
            let receipt = self.ledger.commit(changeset)?;
            Ok(Executed { outcome, receipt: Some(receipt) })
        })
        .await;

        match &executed {
            Ok(Executed { receipt: Some(receipt), .. }) => {
                log(
                    Level::Info,
                    Domain::Orchestrator,
                    "request_committed",
                    obj(&[
                        ("request_id", v_str(request.as_str())),
                        ("operation", v_str(operation)),
                        ("events", json!(receipt.events.len())),
                    ]),
                );
                self.publish(&receipt.events);
            }
            Ok(Executed { receipt: None, .. }) => log(
                Level::Info,
                Domain::Orchestrator,
                "request_replayed",
                obj(&[("request_id", v_str(request.as_str())), ("operation", v_str(operation))]),
            ),
            Err(err) => {
                let level = if err.class() == ErrorClass::Infrastructure { Level::Error } else { Level::Info };
                log(
                    level,
                    Domain::Orchestrator,
                    "request_failed",
                    obj(&[
                        ("request_id", v_str(request.as_str())),
                        ("operation", v_str(operation)),
                        ("code", v_str(err.code())),
                        ("msg", v_str(&err.to_string())),
                    ]),
                );
            }
        }
        executed
    }

    fn publish(&self, events: &[EventEnvelope]) {
        let Ok(sinks) = self.sinks.read() else { return };
        for envelope in events {
            for sink in sinks.iter() {
                sink.publish(envelope);
            }
        }
    }

    // =========================================================================
    // Rounds
    // =========================================================================

    pub async fn create_round(
        &self,
        request: &RequestId,
        tournament_id: &TournamentId,
        name: &str,
        players: Vec<PlayerId>,
    ) -> AuctionResult<Round> {
        let params = json!({ "tournament_id": tournament_id, "name": name, "players": players });
        let done = self
            .execute(request, "create_round", params, || {
                self.rounds.prepare_create(tournament_id, RoundId::generate(), name, players.clone())
            })
            .await?;
        Ok(done.outcome)
    }

    pub async fn add_players(
        &self,
        request: &RequestId,
        round_id: &RoundId,
        players: Vec<PlayerId>,
    ) -> AuctionResult<Round> {
        let params = json!({ "round_id": round_id, "players": players });
        let done = self
            .execute(request, "add_players", params, || self.rounds.prepare_add_players(round_id, players.clone()))
            .await?;
        Ok(done.outcome)
    }

    pub async fn open_round(&self, request: &RequestId, round_id: &RoundId) -> AuctionResult<Round> {
        let done = self
            .execute(request, "open_round", json!({ "round_id": round_id }), || {
                self.rounds.prepare_open_round(round_id)
            })
            .await?;
        if done.receipt.is_some() {
            RoundMachine::log_transition(&done.outcome, RoundStatus::Pending);
        }
        Ok(done.outcome)
    }

    pub async fn open_player(
        &self,
        request: &RequestId,
        round_id: &RoundId,
        player_id: &PlayerId,
    ) -> AuctionResult<Player> {
        let params = json!({ "round_id": round_id, "player_id": player_id });
        let done = self
            .execute(request, "open_player", params, || self.rounds.prepare_open_player(round_id, player_id))
            .await?;
        Ok(done.outcome)
    }

    pub async fn complete_round(&self, request: &RequestId, round_id: &RoundId) -> AuctionResult<Round> {
        let done = self
            .execute(request, "complete_round", json!({ "round_id": round_id }), || {
                self.rounds.prepare_complete(round_id)
            })
            .await?;
        if done.receipt.is_some() {
            RoundMachine::log_transition(&done.outcome, RoundStatus::Active);
        }
        Ok(done.outcome)
    }

    pub async fn force_close_round(&self, request: &RequestId, round_id: &RoundId) -> AuctionResult<ForceCloseRecord> {
        let done = self
            .execute(request, "force_close_round", json!({ "round_id": round_id }), || {
                self.rounds.prepare_force_close(round_id)
            })
            .await?;
        if done.receipt.is_some() {
            RoundMachine::log_transition(&done.outcome.round, RoundStatus::Active);
            if let Some(unsold) = &done.outcome.unsold {
                log_unsold(unsold.player_id.as_str(), true, unsold.superseded_bids.len());
            }
        }
        Ok(done.outcome)
    }

    // =========================================================================
    // Bidding and settlement
    // =========================================================================

    pub async fn place_bid(
        &self,
        request: &RequestId,
        team_id: &TeamId,
        player_id: &PlayerId,
        amount: Amount,
    ) -> AuctionResult<Bid> {
        let params = json!({ "team_id": team_id, "player_id": player_id, "amount": amount });
        let done = self
            .execute(request, "place_bid", params, || self.arbiter.prepare_place_bid(team_id, player_id, amount))
            .await;
        match done {
            Ok(done) => {
                if let Some(receipt) = &done.receipt {
                    let superseded = receipt
                        .events
                        .iter()
                        .map(|e| match &e.event {
                            DomainEvent::BidAccepted { superseded, .. } => superseded.len(),
                            _ => 0,
                        })
                        .sum();
                    log_bid_accepted(player_id.as_str(), team_id.as_str(), amount, superseded);
                }
                Ok(done.outcome)
            }
            Err(err) => {
                if err.class() == ErrorClass::BusinessRule {
                    log_bid_rejected(player_id.as_str(), team_id.as_str(), amount, err.code(), &err.to_string());
                }
                Err(err)
            }
        }
    }

    pub async fn sell(&self, request: &RequestId, player_id: &PlayerId) -> AuctionResult<SaleRecord> {
        let done = self
            .execute(request, "sell", json!({ "player_id": player_id }), || self.settlement.prepare_sell(player_id))
            .await?;
        if done.receipt.is_some() {
            let sale = &done.outcome;
            log_sale(sale.player_id.as_str(), sale.team_id.as_str(), sale.sold_price, sale.team_remaining);
        }
        Ok(done.outcome)
    }

    pub async fn mark_unsold(
        &self,
        request: &RequestId,
        player_id: &PlayerId,
        override_bids: bool,
    ) -> AuctionResult<UnsoldRecord> {
        let params = json!({ "player_id": player_id, "override": override_bids });
        let done = self
            .execute(request, "mark_unsold", params, || {
                self.settlement.prepare_mark_unsold(player_id, override_bids)
            })
            .await?;
        if done.receipt.is_some() {
            log_unsold(player_id.as_str(), override_bids, done.outcome.superseded_bids.len());
        }
        Ok(done.outcome)
    }

    pub async fn reselect(&self, request: &RequestId, player_id: &PlayerId) -> AuctionResult<Player> {
        let done = self
            .execute(request, "reselect", json!({ "player_id": player_id }), || {
                self.settlement.prepare_reselect(player_id)
            })
            .await?;
        Ok(done.outcome)
    }

    // =========================================================================
    // Administrative pause
    // =========================================================================

    pub async fn pause(&self, request: &RequestId, tournament_id: &TournamentId) -> AuctionResult<Tournament> {
        let done = self
            .execute(request, "pause", json!({ "tournament_id": tournament_id }), || {
                self.prepare_set_paused(tournament_id, true)
            })
            .await?;
        Ok(done.outcome)
    }

    pub async fn resume(&self, request: &RequestId, tournament_id: &TournamentId) -> AuctionResult<Tournament> {
        let done = self
            .execute(request, "resume", json!({ "tournament_id": tournament_id }), || {
                self.prepare_set_paused(tournament_id, false)
            })
            .await?;
        Ok(done.outcome)
    }

    fn prepare_set_paused(&self, tournament_id: &TournamentId, paused: bool) -> AuctionResult<Prepared<Tournament>> {
        let mut tournament = self.ledger.tournament(tournament_id)?;
        if tournament.paused == paused {
            let state = if paused { "paused" } else { "running" };
            return Err(AuctionError::invalid(format!("tournament {} is already {}", tournament.id, state)));
        }
        tournament.paused = paused;
        let mut cs = Changeset::new(self.clock.now_ms());
        cs.emit(if paused {
            DomainEvent::AuctionPaused { tournament_id: tournament.id.clone() }
        } else {
            DomainEvent::AuctionResumed { tournament_id: tournament.id.clone() }
        });
        let outcome = tournament.committed();
        cs.update(tournament);
        Ok(Prepared { changeset: cs, outcome })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn remaining_budget(&self, team_id: &TeamId) -> AuctionResult<Amount> {
        self.budget().remaining_budget(team_id)
    }

    pub fn can_afford(&self, team_id: &TeamId, amount: Amount) -> AuctionResult<bool> {
        self.budget().can_afford(team_id, amount)
    }

    /// The player open in the tournament's active round, if any.
    pub fn current_player(&self, tournament_id: &TournamentId) -> AuctionResult<Option<Player>> {
        let tournament = self.ledger.tournament(tournament_id)?;
        let Some(round_id) = tournament.active_round else { return Ok(None) };
        match self.ledger.round(&round_id)?.current_player {
            Some(player_id) => Ok(Some(self.ledger.player(&player_id)?)),
            None => Ok(None),
        }
    }

    pub fn bids_for(&self, player_id: &PlayerId) -> AuctionResult<Vec<Bid>> {
        self.ledger.bids_for(player_id)
    }

    pub fn events_since(&self, after: u64, limit: usize) -> AuctionResult<Vec<EventEnvelope>> {
        self.ledger.events_since(after, limit)
    }
}

struct Executed<T> {
    outcome: T,
    /// `None` when the outcome was replayed from an earlier commit.
    receipt: Option<CommitReceipt>,
}

fn replay<T: DeserializeOwned>(rec: &IdempotencyRecord, operation: &str, fingerprint: &str) -> AuctionResult<Executed<T>> {
    if rec.operation != operation || rec.fingerprint != fingerprint {
        return Err(AuctionError::IdempotencyKeyReused { key: rec.key.to_string() });
    }
    Ok(Executed { outcome: serde_json::from_str(&rec.outcome)?, receipt: None })
}
