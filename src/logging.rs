//! Structured logging for the auction core.
//!
//! Every record is one JSON line carrying `ts`, `run_id`, a process-wide
//! `seq`, level, domain and event name. Correlation fields (request, tournament,
//! round, player, team) are lifted to the top level so a run can be grepped by
//! any of them; everything else lands under `data`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::model::Amount;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Ledger,       // Commits, conflicts, journal replay
    Round,        // Round and player-slot transitions
    Bid,          // Bid admission and rejection
    Budget,       // Reservations, affordability
    Settlement,   // Sales, unsold dispositions, reselects
    Orchestrator, // Idempotency hits, retries
    System,       // Startup, config, binaries
    Audit,        // Invariant checks, digests
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Ledger => "ledger",
            Domain::Round => "round",
            Domain::Bid => "bid",
            Domain::Budget => "budget",
            Domain::Settlement => "settlement",
            Domain::Orchestrator => "orchestrator",
            Domain::System => "system",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    stdout: bool,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let stdout = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));

        // LOG_DIR unset: stdout only
        let Ok(base) = std::env::var("LOG_DIR") else {
            return RunContext { run_id, stdout, events: None, trace: None };
        };
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, stdout, events: None, trace: None };
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
            stdout,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["request_id", "tournament_id", "round_id", "player_id", "team_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.stdout {
        println!("{}", line);
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_commit(writes: usize, events: usize, idempotency_key: Option<&str>) {
    log(
        Level::Debug,
        Domain::Ledger,
        "commit",
        obj(&[
            ("writes", json!(writes)),
            ("events", json!(events)),
            ("request_id", idempotency_key.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_conflict_retry(operation: &str, attempt: u32, max_attempts: u32, key: &str, delay_ms: u64) {
    log(
        Level::Warn,
        Domain::Orchestrator,
        "conflict_retry",
        obj(&[
            ("operation", v_str(operation)),
            ("attempt", json!(attempt)),
            ("max_attempts", json!(max_attempts)),
            ("key", v_str(key)),
            ("delay_ms", json!(delay_ms)),
        ]),
    );
}

pub fn log_round_transition(round_id: &str, tournament_id: &str, from: &str, to: &str) {
    log(
        Level::Info,
        Domain::Round,
        "round_transition",
        obj(&[
            ("round_id", v_str(round_id)),
            ("tournament_id", v_str(tournament_id)),
            ("from", v_str(from)),
            ("to", v_str(to)),
        ]),
    );
}

pub fn log_bid_accepted(player_id: &str, team_id: &str, amount: Amount, superseded: usize) {
    log(
        Level::Info,
        Domain::Bid,
        "bid_accepted",
        obj(&[
            ("player_id", v_str(player_id)),
            ("team_id", v_str(team_id)),
            ("amount", json!(amount)),
            ("superseded", json!(superseded)),
        ]),
    );
}

pub fn log_bid_rejected(player_id: &str, team_id: &str, amount: Amount, code: &str, reason: &str) {
    log(
        Level::Info,
        Domain::Bid,
        "bid_rejected",
        obj(&[
            ("player_id", v_str(player_id)),
            ("team_id", v_str(team_id)),
            ("amount", json!(amount)),
            ("code", v_str(code)),
            ("msg", v_str(reason)),
        ]),
    );
}

pub fn log_sale(player_id: &str, team_id: &str, price: Amount, team_remaining: Amount) {
    log(
        Level::Info,
        Domain::Settlement,
        "player_sold",
        obj(&[
            ("player_id", v_str(player_id)),
            ("team_id", v_str(team_id)),
            ("price", json!(price)),
            ("team_remaining", json!(team_remaining)),
        ]),
    );
}

pub fn log_unsold(player_id: &str, overridden: bool, superseded: usize) {
    log(
        Level::Info,
        Domain::Settlement,
        "player_unsold",
        obj(&[
            ("player_id", v_str(player_id)),
            ("overridden", json!(overridden)),
            ("superseded", json!(superseded)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits elapsed time at trace level on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Map<String, Value>,
    started: Instant,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self { label, context: Map::new(), started: Instant::now() }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self { label, context: obj(fields), started: Instant::now() }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = std::mem::take(&mut self.context);
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::System, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================
