use std::sync::Arc;

use crate::error::AuctionResult;
use crate::ledger::{LedgerStore, MemoryLedger, SqliteLedger};
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct AuctionConfig {
    pub backend: LedgerBackend,
    pub sqlite_path: String,
    /// Journal for the memory backend. `None` keeps it volatile.
    pub journal_path: Option<String>,
    pub journal_fsync: bool,
    pub reservation_ttl_ms: u64,
    pub max_conflict_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AuctionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            backend: match var("LEDGER_BACKEND").map(|v| v.to_lowercase()).as_deref() {
                Some("sqlite") => LedgerBackend::Sqlite,
                _ => LedgerBackend::Memory,
            },
            sqlite_path: var("SQLITE_PATH").unwrap_or_else(|| "./auction.sqlite".to_string()),
            journal_path: var("JOURNAL_PATH").filter(|v| !v.is_empty()),
            journal_fsync: var("JOURNAL_FSYNC").map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")).unwrap_or(false),
            reservation_ttl_ms: var("RESERVATION_TTL_MS").and_then(|v| v.parse().ok()).unwrap_or(120_000),
            max_conflict_retries: var("MAX_CONFLICT_RETRIES").and_then(|v| v.parse().ok()).unwrap_or(5),
            retry_base_delay_ms: var("RETRY_BASE_DELAY_MS").and_then(|v| v.parse().ok()).unwrap_or(5),
            retry_max_delay_ms: var("RETRY_MAX_DELAY_MS").and_then(|v| v.parse().ok()).unwrap_or(200),
            retry_jitter: var("RETRY_JITTER").and_then(|v| v.parse().ok()).unwrap_or(0.5),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_conflict_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            jitter_factor: self.retry_jitter.clamp(0.0, 1.0),
        }
    }

    pub fn open_ledger(&self) -> AuctionResult<Arc<dyn LedgerStore>> {
        Ok(match self.backend {
            LedgerBackend::Sqlite => Arc::new(SqliteLedger::open(&self.sqlite_path)?),
            LedgerBackend::Memory => match &self.journal_path {
                Some(path) => Arc::new(MemoryLedger::open_journaled(path)?.with_journal_fsync(self.journal_fsync)),
                None => Arc::new(MemoryLedger::new()),
            },
        })
    }
}
