//! Domain events.
//!
//! Events are written to the ledger outbox in the same commit as the state
//! change that produced them, then pushed to any registered [`EventSink`].
//! Delivery beyond that point belongs to the subscriber.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{Amount, BidId, PlayerId, RoundId, TeamId, Timestamp, TournamentId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    RoundStarted {
        tournament_id: TournamentId,
        round_id: RoundId,
    },
    PlayerOpened {
        round_id: RoundId,
        player_id: PlayerId,
    },
    BidAccepted {
        player_id: PlayerId,
        team_id: TeamId,
        bid_id: BidId,
        amount: Amount,
        superseded: Vec<BidId>,
    },
    PlayerSold {
        round_id: RoundId,
        player_id: PlayerId,
        team_id: TeamId,
        price: Amount,
    },
    PlayerUnsold {
        round_id: RoundId,
        player_id: PlayerId,
        overridden: bool,
    },
    PlayerReselected {
        player_id: PlayerId,
    },
    RoundCompleted {
        tournament_id: TournamentId,
        round_id: RoundId,
        forced: bool,
    },
    AuctionPaused {
        tournament_id: TournamentId,
    },
    AuctionResumed {
        tournament_id: TournamentId,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::RoundStarted { .. } => "round_started",
            DomainEvent::PlayerOpened { .. } => "player_opened",
            DomainEvent::BidAccepted { .. } => "bid_accepted",
            DomainEvent::PlayerSold { .. } => "player_sold",
            DomainEvent::PlayerUnsold { .. } => "player_unsold",
            DomainEvent::PlayerReselected { .. } => "player_reselected",
            DomainEvent::RoundCompleted { .. } => "round_completed",
            DomainEvent::AuctionPaused { .. } => "auction_paused",
            DomainEvent::AuctionResumed { .. } => "auction_resumed",
        }
    }
}

/// An outbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub recorded_at: Timestamp,
    pub event: DomainEvent,
}

pub trait EventSink: Send + Sync {
    fn publish(&self, envelope: &EventEnvelope);
}

/// Collects everything published. Used by tests and the stress binary.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<EventEnvelope> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.snapshot().iter().filter(|e| e.event.name() == name).count()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, envelope: &EventEnvelope) {
        if let Ok(mut events) = self.events.lock() {
            events.push(envelope.clone());
        }
    }
}

/// Writes each event to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, envelope: &EventEnvelope) {
        let payload = serde_json::to_value(&envelope.event).unwrap_or(serde_json::Value::Null);
        log(
            Level::Info,
            Domain::Audit,
            "domain_event",
            obj(&[
                ("name", v_str(envelope.event.name())),
                ("event_seq", json!(envelope.seq)),
                ("payload", payload),
            ]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_counts_by_name() {
        let sink = MemorySink::new();
        sink.publish(&EventEnvelope {
            seq: 1,
            recorded_at: 10,
            event: DomainEvent::PlayerReselected { player_id: PlayerId::new("p-1") },
        });
        sink.publish(&EventEnvelope {
            seq: 2,
            recorded_at: 11,
            event: DomainEvent::AuctionPaused { tournament_id: TournamentId::new("t-1") },
        });
        assert_eq!(sink.count("player_reselected"), 1);
        assert_eq!(sink.snapshot().len(), 2);
    }

    #[test]
    fn test_event_tagging() {
        let ev = DomainEvent::PlayerSold {
            round_id: RoundId::new("r"),
            player_id: PlayerId::new("p"),
            team_id: TeamId::new("a"),
            price: 200,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"player_sold\""));
    }
}
