//! Error taxonomy for the auction core.
//!
//! Each variant belongs to one [`ErrorClass`]; callers decide what to do from
//! the class alone. Only [`ErrorClass::Conflict`] is retried automatically.

use crate::model::{Amount, PlayerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// State machine misuse. Not retryable as-is.
    Caller,
    /// Bid rejected by an auction rule; surfaced verbatim to the bidder.
    BusinessRule,
    /// Concurrent modification. Re-read and retry.
    Conflict,
    /// Settlement precondition failed; surfaced to the admin.
    Precondition,
    /// Storage, codec or I/O failure.
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum AuctionError {
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("player {player} is not open for bidding")]
    NotOpenForBidding { player: String },

    #[error("bid {amount} too low for player {player}: must exceed {floor}")]
    BidTooLow { player: String, amount: Amount, floor: Amount },

    #[error("team {team} cannot afford {amount} (spendable {spendable})")]
    InsufficientBudget { team: String, amount: Amount, spendable: Amount },

    #[error("team {team} roster is full ({max} players)")]
    RosterFull { team: String, max: u32 },

    #[error("auction for tournament {tournament} is paused")]
    AuctionPaused { tournament: String },

    #[error("concurrent modification of {key}")]
    Conflict { key: String },

    #[error("no active bids for player {player}")]
    NoBidsPresent { player: String },

    #[error("player {player} not eligible ({status}): {reason}")]
    NotEligible { player: String, status: PlayerStatus, reason: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("idempotency key {key} already used for a different request")]
    IdempotencyKeyReused { key: String },

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AuctionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AuctionError::InvalidTransition(_)
            | AuctionError::NotFound { .. }
            | AuctionError::IdempotencyKeyReused { .. } => ErrorClass::Caller,
            AuctionError::NotOpenForBidding { .. }
            | AuctionError::BidTooLow { .. }
            | AuctionError::InsufficientBudget { .. }
            | AuctionError::RosterFull { .. }
            | AuctionError::AuctionPaused { .. } => ErrorClass::BusinessRule,
            AuctionError::Conflict { .. } => ErrorClass::Conflict,
            AuctionError::NoBidsPresent { .. } | AuctionError::NotEligible { .. } => {
                ErrorClass::Precondition
            }
            AuctionError::Storage(_)
            | AuctionError::Codec(_)
            | AuctionError::Io(_)
            | AuctionError::Other(_) => ErrorClass::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    /// Short stable name for logs.
    pub fn code(&self) -> &'static str {
        match self {
            AuctionError::InvalidTransition(_) => "invalid_transition",
            AuctionError::NotOpenForBidding { .. } => "not_open_for_bidding",
            AuctionError::BidTooLow { .. } => "bid_too_low",
            AuctionError::InsufficientBudget { .. } => "insufficient_budget",
            AuctionError::RosterFull { .. } => "roster_full",
            AuctionError::AuctionPaused { .. } => "auction_paused",
            AuctionError::Conflict { .. } => "conflict",
            AuctionError::NoBidsPresent { .. } => "no_bids_present",
            AuctionError::NotEligible { .. } => "not_eligible",
            AuctionError::NotFound { .. } => "not_found",
            AuctionError::IdempotencyKeyReused { .. } => "idempotency_key_reused",
            AuctionError::Storage(_) => "storage",
            AuctionError::Codec(_) => "codec",
            AuctionError::Io(_) => "io",
            AuctionError::Other(_) => "other",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AuctionError::InvalidTransition(msg.into())
    }

    pub(crate) fn conflict(key: impl ToString) -> Self {
        AuctionError::Conflict { key: key.to_string() }
    }
}

pub type AuctionResult<T> = Result<T, AuctionError>;
