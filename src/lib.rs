//! Cricket auction core.
//!
//! A ledger-backed state machine that admits bids, settles sales and keeps
//! team budgets consistent under concurrent callers.
//!
//! ```text
//!              Orchestrator (idempotency, conflict retry, event push)
//!              │            │               │
//!        RoundMachine   BidArbiter   SettlementEngine
//!              │            │  BudgetTracker │
//!              └────────────┴───────┬────────┘
//!                              LedgerStore
//!                      (MemoryLedger | SqliteLedger)
//! ```

pub mod arbiter;
pub mod budget;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod round;
pub mod settlement;

pub use arbiter::BidArbiter;
pub use budget::BudgetTracker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuctionConfig, LedgerBackend};
pub use error::{AuctionError, AuctionResult, ErrorClass};
pub use events::{DomainEvent, EventEnvelope, EventSink, LogSink, MemorySink};
pub use ledger::{Changeset, LedgerRead, LedgerStore, MemoryLedger, SqliteLedger};
pub use orchestrator::Orchestrator;
pub use round::RoundMachine;
pub use settlement::SettlementEngine;
