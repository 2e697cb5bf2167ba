use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use serde_json::json;

use crate::error::{AuctionError, AuctionResult};
use crate::events::EventEnvelope;
use crate::ledger::journal::{Journal, JournalEntry};
use crate::ledger::{Changeset, CommitReceipt, IdempotencyRecord, LedgerStore, Write};
use crate::logging::{log, log_commit, obj, v_str, Domain, Level, ProfileScope};
use crate::model::{Entity, EntityKey, Kind, RequestId};

#[derive(Debug, Default)]
struct Inner {
    entities: BTreeMap<EntityKey, Entity>,
    idempotency: HashMap<String, IdempotencyRecord>,
    outbox: Vec<EventEnvelope>,
    commit_seq: u64,
    journal: Option<Journal>,
}

impl Inner {
    fn check_version(&self, key: &EntityKey, expected: u64) -> AuctionResult<u64> {
        match self.entities.get(key) {
            Some(stored) if stored.version() == expected => Ok(expected),
            _ => Err(AuctionError::conflict(key)),
        }
    }

    /// Validates every write against current state and returns the records
    /// as they will read after commit. Nothing is mutated.
    fn stage(&self, cs: &Changeset) -> AuctionResult<Vec<Entity>> {
        if let Some(rec) = &cs.idempotency {
            if self.idempotency.contains_key(rec.key.as_str()) {
                return Err(AuctionError::conflict(format!("request/{}", rec.key)));
            }
        }
        let mut staged = Vec::with_capacity(cs.writes.len());
        for w in &cs.writes {
            match w {
                Write::Insert { entity } => {
                    let key = entity.key();
                    if self.entities.contains_key(&key) {
                        return Err(AuctionError::conflict(key));
                    }
                    let mut next = entity.clone();
                    next.set_version(1);
                    staged.push(next);
                }
                Write::Update { entity } => {
                    let current = self.check_version(&entity.key(), entity.version())?;
                    let mut next = entity.clone();
                    next.set_version(current + 1);
                    staged.push(next);
                }
                Write::Guard { key, version } => {
                    self.check_version(key, *version)?;
                }
            }
        }
        Ok(staged)
    }

    fn apply(&mut self, entry: JournalEntry) -> CommitReceipt {
        self.commit_seq = self.commit_seq.max(entry.commit_seq);
        let mut versions = Vec::with_capacity(entry.entities.len());
        for entity in entry.entities {
            versions.push((entity.key(), entity.version()));
            self.entities.insert(entity.key(), entity);
        }
        if let Some(rec) = entry.idempotency {
            self.idempotency.insert(rec.key.as_str().to_string(), rec);
        }
        self.outbox.extend(entry.events.iter().cloned());
        CommitReceipt { versions, events: entry.events }
    }
}

/// Mutex-guarded ledger, optionally backed by a [`Journal`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays `path` (if it exists), cuts any torn tail and appends every
    /// later commit to it.
    pub fn open_journaled(path: &str) -> AuctionResult<Self> {
        let _scope = ProfileScope::new("journal_replay");
        let (journal, recovery) = Journal::open(path)?;
        let mut inner = Inner::default();
        let replayed = recovery.entries.len();
        for entry in recovery.entries {
            inner.apply(entry);
        }
        inner.journal = Some(journal);
        log(
            Level::Info,
            Domain::Ledger,
            "journal_replay",
            obj(&[
                ("path", v_str(path)),
                ("commits", json!(replayed)),
                ("torn_bytes", json!(recovery.torn_bytes)),
                ("entities", json!(inner.entities.len())),
            ]),
        );
        Ok(Self { inner: Mutex::new(inner) })
    }

    /// Sync the journal to disk after every append.
    pub fn with_journal_fsync(mut self, fsync: bool) -> Self {
        if let Ok(inner) = self.inner.get_mut() {
            inner.journal = inner.journal.take().map(|j| j.with_fsync(fsync));
        }
        self
    }

    fn lock(&self) -> AuctionResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| AuctionError::Other(anyhow!("ledger lock poisoned")))
    }
}

impl LedgerStore for MemoryLedger {
    fn get(&self, key: &EntityKey) -> AuctionResult<Option<Entity>> {
        Ok(self.lock()?.entities.get(key).cloned())
    }

    fn scan(&self, kind: Kind, scope: &str) -> AuctionResult<Vec<Entity>> {
        let inner = self.lock()?;
        Ok(inner
            .entities
            .iter()
            .filter(|(k, e)| k.kind == kind && e.scope() == scope)
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn entities(&self) -> AuctionResult<Vec<Entity>> {
        Ok(self.lock()?.entities.values().cloned().collect())
    }

    fn idempotency(&self, key: &RequestId) -> AuctionResult<Option<IdempotencyRecord>> {
        Ok(self.lock()?.idempotency.get(key.as_str()).cloned())
    }

    fn events_since(&self, after: u64, limit: usize) -> AuctionResult<Vec<EventEnvelope>> {
        let inner = self.lock()?;
        Ok(inner.outbox.iter().filter(|e| e.seq > after).take(limit).cloned().collect())
    }

    fn commit(&self, cs: Changeset) -> AuctionResult<CommitReceipt> {
        cs.validate()?;
        let mut inner = self.lock()?;
        let staged = inner.stage(&cs)?;

        let commit_seq = inner.commit_seq + 1;
        let next_event = inner.outbox.last().map(|e| e.seq).unwrap_or(0) + 1;
        let events: Vec<EventEnvelope> = cs
            .events
            .into_iter()
            .enumerate()
            .map(|(i, event)| EventEnvelope { seq: next_event + i as u64, recorded_at: cs.recorded_at, event })
            .collect();
        let entry = JournalEntry {
            commit_seq,
            recorded_at: cs.recorded_at,
            entities: staged,
            idempotency: cs.idempotency,
            events,
        };

        // Journal first: a failed append leaves memory untouched.
        if let Some(journal) = inner.journal.as_mut() {
            journal.append_entry(&entry)?;
        }
        let key = entry.idempotency.as_ref().map(|r| r.key.as_str().to_string());
        let receipt = inner.apply(entry);
        log_commit(receipt.versions.len(), receipt.events.len(), key.as_deref());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{seed_registration, LedgerRead};
    use crate::model::{Player, PlayerId, PlayerStatus, Record, Team, Tournament};

    fn seeded() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        let t = Tournament::new("t-1", "League", 1000);
        let teams = vec![Team::new("a", &t, "Alpha"), Team::new("b", &t, "Bravo")];
        let players = vec![Player::new("p-1", &t, "Opener", 100)];
        seed_registration(&ledger, t, teams, players, 1).unwrap();
        ledger
    }

    #[test]
    fn test_stale_update_rejected_without_partial_apply() {
        let ledger = seeded();
        let mut player = ledger.player(&PlayerId::new("p-1")).unwrap();
        let mut team = ledger.team(&"a".into()).unwrap();

        // Bump the team behind the caller's back.
        let mut cs = Changeset::new(2);
        let mut moved = team.clone();
        moved.spent = 10;
        cs.update(moved);
        ledger.commit(cs).unwrap();

        player.status = PlayerStatus::Sold;
        team.spent = 100;
        let mut cs = Changeset::new(3);
        cs.update(player).update(team);
        assert!(matches!(ledger.commit(cs), Err(AuctionError::Conflict { .. })));

        // Player write in the same changeset must not have landed.
        let p = ledger.player(&PlayerId::new("p-1")).unwrap();
        assert_eq!(p.status, PlayerStatus::Available);
        assert_eq!(p.version, 1);
    }

    #[test]
    fn test_duplicate_insert_conflicts() {
        let ledger = seeded();
        let t = ledger.tournament(&"t-1".into()).unwrap();
        let mut cs = Changeset::new(2);
        cs.insert(Team::new("a", &t, "Dup"));
        assert!(matches!(ledger.commit(cs), Err(AuctionError::Conflict { .. })));
    }

    #[test]
    fn test_guard_detects_moved_record() {
        let ledger = seeded();
        let team = ledger.team(&"a".into()).unwrap();
        let mut bumped = team.clone();
        bumped.spent = 1;
        let mut cs = Changeset::new(2);
        cs.update(bumped);
        ledger.commit(cs).unwrap();

        let mut cs = Changeset::new(3);
        cs.guard(&team);
        assert!(ledger.commit(cs).is_err());
        let mut cs = Changeset::new(3);
        cs.guard(&team.committed());
        assert!(ledger.commit(cs).is_ok());
    }

    #[test]
    fn test_idempotency_key_single_use() {
        let ledger = seeded();
        let rec = IdempotencyRecord {
            key: RequestId::new("req-1"),
            operation: "noop".into(),
            fingerprint: "f".into(),
            outcome: "null".into(),
            recorded_at: 2,
        };
        let mut cs = Changeset::new(2);
        cs.idempotency = Some(rec.clone());
        ledger.commit(cs).unwrap();
        let mut cs = Changeset::new(3);
        cs.idempotency = Some(rec);
        assert!(matches!(ledger.commit(cs), Err(AuctionError::Conflict { .. })));
        assert!(ledger.idempotency(&RequestId::new("req-1")).unwrap().is_some());
    }

    #[test]
    fn test_journal_replay_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");
        let path = path.to_str().unwrap();

        let digest = {
            let ledger = MemoryLedger::open_journaled(path).unwrap();
            let t = Tournament::new("t-1", "League", 1000);
            let teams = vec![Team::new("a", &t, "Alpha")];
            seed_registration(&ledger, t, teams, vec![], 1).unwrap();
            let mut team = ledger.team(&"a".into()).unwrap();
            team.spent = 250;
            let mut cs = Changeset::new(2);
            cs.update(team);
            ledger.commit(cs).unwrap();
            crate::ledger::state_digest(&ledger).unwrap()
        };

        let reopened = MemoryLedger::open_journaled(path).unwrap();
        assert_eq!(crate::ledger::state_digest(&reopened).unwrap(), digest);
        let team = reopened.team(&"a".into()).unwrap();
        assert_eq!(team.spent, 250);
        assert_eq!(team.version, 2);
    }

    #[test]
    fn test_commit_after_torn_tail_survives_restart() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");
        let path = path.to_str().unwrap();
        {
            let ledger = MemoryLedger::open_journaled(path).unwrap();
            seed_registration(&ledger, Tournament::new("t-1", "League", 1000), vec![], vec![], 1).unwrap();
        }
        // Crash mid-append.
        std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap()
            .write_all(b"{\"commit_seq\":2,\"recor")
            .unwrap();
        {
            let ledger = MemoryLedger::open_journaled(path).unwrap();
            let mut t = ledger.tournament(&"t-1".into()).unwrap();
            t.paused = true;
            let mut cs = Changeset::new(2);
            cs.update(t);
            ledger.commit(cs).unwrap();
        }

        let reopened = MemoryLedger::open_journaled(path).unwrap();
        let t = reopened.tournament(&"t-1".into()).unwrap();
        assert!(t.paused);
        assert_eq!(t.version, 2);
    }
}
