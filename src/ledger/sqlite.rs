use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{AuctionError, AuctionResult};
use crate::events::{DomainEvent, EventEnvelope};
use crate::ledger::{Changeset, CommitReceipt, IdempotencyRecord, LedgerStore, Write};
use crate::logging::log_commit;
use crate::model::{Entity, EntityKey, Kind, RequestId};

/// SQLite-backed ledger. Every commit runs in one `IMMEDIATE` transaction and
/// rolls back on the first version mismatch.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &str) -> AuctionResult<Self> {
        let ledger = Self { conn: Mutex::new(Connection::open(path)?) };
        ledger.init()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> AuctionResult<Self> {
        let ledger = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        ledger.init()?;
        Ok(ledger)
    }

    pub fn init(&self) -> AuctionResult<()> {
        self.lock()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS entities (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                scope TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );
            CREATE INDEX IF NOT EXISTS entities_scope ON entities (kind, scope);
            CREATE TABLE IF NOT EXISTS idempotency (
                key TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                outcome TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS outbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at INTEGER NOT NULL,
                event TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    fn lock(&self) -> AuctionResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| AuctionError::Other(anyhow!("sqlite connection lock poisoned")))
    }
}

fn decode(body: String) -> AuctionResult<Entity> {
    Ok(serde_json::from_str(&body)?)
}

impl LedgerStore for SqliteLedger {
    fn get(&self, key: &EntityKey) -> AuctionResult<Option<Entity>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM entities WHERE kind = ?1 AND id = ?2",
                params![key.kind.as_str(), key.id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(decode).transpose()
    }

    fn scan(&self, kind: Kind, scope: &str) -> AuctionResult<Vec<Entity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM entities WHERE kind = ?1 AND scope = ?2 ORDER BY id")?;
        let rows = stmt.query_map(params![kind.as_str(), scope], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(decode(body?)?);
        }
        Ok(out)
    }

    fn entities(&self) -> AuctionResult<Vec<Entity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM entities")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(decode(body?)?);
        }
        // Same order as the in-memory ledger so digests agree.
        out.sort_by_key(|e| e.key());
        Ok(out)
    }

    fn idempotency(&self, key: &RequestId) -> AuctionResult<Option<IdempotencyRecord>> {
        let conn = self.lock()?;
        let rec = conn
            .query_row(
                "SELECT operation, fingerprint, outcome, recorded_at FROM idempotency WHERE key = ?1",
                params![key.as_str()],
                |row| {
                    Ok(IdempotencyRecord {
                        key: key.clone(),
                        operation: row.get(0)?,
                        fingerprint: row.get(1)?,
                        outcome: row.get(2)?,
                        recorded_at: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    fn events_since(&self, after: u64, limit: usize) -> AuctionResult<Vec<EventEnvelope>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT seq, recorded_at, event FROM outbox WHERE seq > ?1 ORDER BY seq LIMIT ?2")?;
        let rows = stmt.query_map(params![after as i64, limit.min(i64::MAX as usize) as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, recorded_at, event) = row?;
            let event: DomainEvent = serde_json::from_str(&event)?;
            out.push(EventEnvelope { seq: seq as u64, recorded_at: recorded_at as u64, event });
        }
        Ok(out)
    }

    fn commit(&self, cs: Changeset) -> AuctionResult<CommitReceipt> {
        cs.validate()?;
        let mut conn = self.lock()?;
        // Dropping `tx` without commit rolls back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(rec) = &cs.idempotency {
            let n = tx.execute(
                "INSERT OR IGNORE INTO idempotency (key, operation, fingerprint, outcome, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![rec.key.as_str(), rec.operation, rec.fingerprint, rec.outcome, rec.recorded_at as i64],
            )?;
            if n == 0 {
                return Err(AuctionError::conflict(format!("request/{}", rec.key)));
            }
        }

        let mut receipt = CommitReceipt::default();
        for w in &cs.writes {
            match w {
                Write::Insert { entity } => {
                    let key = entity.key();
                    let mut next = entity.clone();
                    next.set_version(1);
                    let n = tx.execute(
                        "INSERT OR IGNORE INTO entities (kind, id, scope, version, body)
                         VALUES (?1, ?2, ?3, 1, ?4)",
                        params![key.kind.as_str(), key.id, next.scope(), serde_json::to_string(&next)?],
                    )?;
                    if n == 0 {
                        return Err(AuctionError::conflict(key));
                    }
                    receipt.versions.push((key, 1));
                }
                Write::Update { entity } => {
                    let key = entity.key();
                    let expected = entity.version();
                    let mut next = entity.clone();
                    next.set_version(expected + 1);
                    let n = tx.execute(
                        "UPDATE entities SET version = ?1, scope = ?2, body = ?3
                         WHERE kind = ?4 AND id = ?5 AND version = ?6",
                        params![
                            (expected + 1) as i64,
                            next.scope(),
                            serde_json::to_string(&next)?,
                            key.kind.as_str(),
                            key.id,
                            expected as i64
                        ],
                    )?;
                    if n != 1 {
                        return Err(AuctionError::conflict(key));
                    }
                    receipt.versions.push((key, expected + 1));
                }
                Write::Guard { key, version } => {
                    let found: Option<i64> = tx
                        .query_row(
                            "SELECT version FROM entities WHERE kind = ?1 AND id = ?2",
                            params![key.kind.as_str(), key.id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if found != Some(*version as i64) {
                        return Err(AuctionError::conflict(key));
                    }
                }
            }
        }

        for event in cs.events {
            tx.execute(
                "INSERT INTO outbox (recorded_at, event) VALUES (?1, ?2)",
                params![cs.recorded_at as i64, serde_json::to_string(&event)?],
            )?;
            let seq = tx.last_insert_rowid() as u64;
            receipt.events.push(EventEnvelope { seq, recorded_at: cs.recorded_at, event });
        }

        tx.commit()?;
        log_commit(
            receipt.versions.len(),
            receipt.events.len(),
            cs.idempotency.as_ref().map(|r| r.key.as_str()),
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{seed_registration, state_digest, LedgerRead, MemoryLedger};
    use crate::model::{Player, PlayerId, Team, Tournament};

    fn registration() -> (Tournament, Vec<Team>, Vec<Player>) {
        let t = Tournament::new("t-1", "League", 1000);
        let teams = vec![Team::new("a", &t, "Alpha")];
        let players = vec![Player::new("p-1", &t, "Keeper", 80), Player::new("p-2", &t, "Spinner", 60)];
        (t, teams, players)
    }

    #[test]
    fn test_seed_and_read_back() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let (t, teams, players) = registration();
        seed_registration(&ledger, t, teams, players, 1).unwrap();
        assert_eq!(ledger.players_in(&"t-1".into()).unwrap().len(), 2);
        let p = ledger.player(&PlayerId::new("p-2")).unwrap();
        assert_eq!(p.base_price, 60);
        assert_eq!(p.version, 1);
    }

    #[test]
    fn test_stale_write_rolls_back_whole_changeset() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let (t, teams, players) = registration();
        seed_registration(&ledger, t, teams, players, 1).unwrap();

        let mut team = ledger.team(&"a".into()).unwrap();
        let mut player = ledger.player(&"p-1".into()).unwrap();
        player.base_price = 999;
        team.version = 41; // stale
        let mut cs = Changeset::new(2);
        cs.update(player).update(team);
        assert!(matches!(ledger.commit(cs), Err(AuctionError::Conflict { .. })));
        assert_eq!(ledger.player(&"p-1".into()).unwrap().base_price, 80);
    }

    #[test]
    fn test_outbox_sequence() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let mut cs = Changeset::new(5);
        cs.emit(DomainEvent::AuctionPaused { tournament_id: "t-1".into() });
        cs.emit(DomainEvent::AuctionResumed { tournament_id: "t-1".into() });
        let receipt = ledger.commit(cs).unwrap();
        assert_eq!(receipt.events.len(), 2);
        let after_first = ledger.events_since(receipt.events[0].seq, 10).unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].event.name(), "auction_resumed");
        assert_eq!(ledger.events_since(0, usize::MAX).unwrap().len(), 2);
        assert_eq!(ledger.events_since(0, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_digest_matches_memory_backend() {
        let sqlite = SqliteLedger::open_in_memory().unwrap();
        let memory = MemoryLedger::new();
        let (t, teams, players) = registration();
        seed_registration(&sqlite, t.clone(), teams.clone(), players.clone(), 1).unwrap();
        seed_registration(&memory, t, teams, players, 1).unwrap();
        assert_eq!(state_digest(&sqlite).unwrap(), state_digest(&memory).unwrap());
    }

    #[test]
    fn test_reopen_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auction.sqlite");
        let path = path.to_str().unwrap();
        {
            let ledger = SqliteLedger::open(path).unwrap();
            let (t, teams, players) = registration();
            seed_registration(&ledger, t, teams, players, 1).unwrap();
        }
        let ledger = SqliteLedger::open(path).unwrap();
        assert_eq!(ledger.entities().unwrap().len(), 4);
    }
}
