//! Ledger audit.
//!
//! Opens an auction ledger read-only in spirit (no commits), runs every
//! invariant check and prints the state digest, entity counts and the tail
//! of the outbox.
//!
//! Usage: ledger_audit [sqlite_path] [outbox_tail]
//! Without a path the configured backend (LEDGER_BACKEND etc.) is opened.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde_json::json;

use cricket_auction::invariants::check_all;
use cricket_auction::ledger::state_digest;
use cricket_auction::logging::{log, obj, v_str, Domain, Level};
use cricket_auction::{AuctionConfig, LedgerBackend};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut cfg = AuctionConfig::from_env();
    if let Some(path) = args.get(1) {
        cfg.backend = LedgerBackend::Sqlite;
        cfg.sqlite_path = path.clone();
    }
    let tail: usize = args.get(2).and_then(|v| v.parse().ok()).unwrap_or(10);

    let ledger = cfg.open_ledger().with_context(|| format!("opening ledger ({:?})", cfg.backend))?;
    let entities = ledger.entities()?;

    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for e in &entities {
        *counts.entry(e.kind().as_str()).or_default() += 1;
    }

    println!("=== LEDGER AUDIT ===\n");
    if cfg.backend == LedgerBackend::Sqlite {
        println!("Path: {}", cfg.sqlite_path);
    }
    for (kind, n) in &counts {
        println!("{:>14} {:>8}", kind, n);
    }

    let digest = state_digest(ledger.as_ref())?;
    println!("\nState digest: {}", digest);

    let events = ledger.events_since(0, usize::MAX)?;
    println!("Outbox: {} events", events.len());
    for env in events.iter().rev().take(tail).rev() {
        println!("  #{:<6} {:<20} {}", env.seq, env.event.name(), serde_json::to_string(&env.event)?);
    }

    let violations = check_all(ledger.as_ref())?;
    log(
        if violations.is_empty() { Level::Info } else { Level::Error },
        Domain::Audit,
        "ledger_audit",
        obj(&[
            ("digest", v_str(&digest)),
            ("entities", json!(entities.len())),
            ("violations", json!(violations.len())),
        ]),
    );
    if violations.is_empty() {
        println!("\n✓ All invariants hold");
        return Ok(());
    }
    println!();
    for v in &violations {
        println!("✗ {}: {}", v.scope, v.msg);
    }
    bail!("{} invariant violations", violations.len())
}
