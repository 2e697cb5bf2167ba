//! Ledger store: versioned entity storage with atomic multi-entity
//! compare-and-set.
//!
//! ```text
//!   reader ──get/scan──► LedgerStore ◄──commit(Changeset)── writer
//!                            │
//!              ┌─────────────┼──────────────┐
//!              ▼             ▼              ▼
//!        MemoryLedger   (+ Journal)    SqliteLedger
//! ```
//!
//! A [`Changeset`] either commits whole or fails with
//! [`AuctionError::Conflict`]. Each `Update` names the version it was read
//! at; the store bumps it by one on success. `Guard` checks a version without
//! writing, so a decision that depended on a record is invalidated when that
//! record moves.

pub mod journal;
pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AuctionError, AuctionResult};
use crate::events::{DomainEvent, EventEnvelope};
use crate::model::{
    Bid, Entity, EntityKey, HoldId, Kind, Player, PlayerId, Record, RequestId, Reservation,
    Round, RoundId, Team, TeamId, Timestamp, Tournament, TournamentId,
};

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Write {
    /// Key must be absent.
    Insert { entity: Entity },
    /// Stored version must equal `entity.version()`.
    Update { entity: Entity },
    /// Stored version must equal `version`; nothing is written.
    Guard { key: EntityKey, version: u64 },
}

impl Write {
    pub fn key(&self) -> EntityKey {
        match self {
            Write::Insert { entity } | Write::Update { entity } => entity.key(),
            Write::Guard { key, .. } => key.clone(),
        }
    }
}

/// Stored result of an idempotent request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: RequestId,
    pub operation: String,
    /// Hex sha-256 of the request parameters.
    pub fingerprint: String,
    /// JSON-encoded outcome returned to the first caller.
    pub outcome: String,
    pub recorded_at: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub writes: Vec<Write>,
    pub events: Vec<DomainEvent>,
    pub idempotency: Option<IdempotencyRecord>,
    pub recorded_at: Timestamp,
}

impl Changeset {
    pub fn new(recorded_at: Timestamp) -> Self {
        Self { recorded_at, ..Default::default() }
    }

    pub fn insert<R: Record>(&mut self, record: R) -> &mut Self {
        self.writes.push(Write::Insert { entity: record.into_entity() });
        self
    }

    pub fn update<R: Record>(&mut self, record: R) -> &mut Self {
        self.writes.push(Write::Update { entity: record.into_entity() });
        self
    }

    pub fn guard<R: Record>(&mut self, record: &R) -> &mut Self {
        self.writes.push(Write::Guard { key: record.key(), version: record.version() });
        self
    }

    pub fn emit(&mut self, event: DomainEvent) -> &mut Self {
        self.events.push(event);
        self
    }

    pub fn writes_to(&self, key: &EntityKey) -> bool {
        self.writes.iter().any(|w| &w.key() == key)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.events.is_empty() && self.idempotency.is_none()
    }

    /// A key may appear at most once per changeset.
    pub fn validate(&self) -> AuctionResult<()> {
        let mut seen = HashSet::new();
        for w in &self.writes {
            let key = w.key();
            if !seen.insert(key.clone()) {
                return Err(AuctionError::invalid(format!("duplicate write for {}", key)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Keys written with their new versions.
    pub versions: Vec<(EntityKey, u64)>,
    pub events: Vec<EventEnvelope>,
}

/// A prepared change and the outcome the caller sees once it commits.
#[derive(Debug, Clone)]
pub struct Prepared<T> {
    pub changeset: Changeset,
    pub outcome: T,
}

pub trait LedgerStore: Send + Sync {
    fn get(&self, key: &EntityKey) -> AuctionResult<Option<Entity>>;

    /// All entities of `kind` whose scope equals `scope`.
    fn scan(&self, kind: Kind, scope: &str) -> AuctionResult<Vec<Entity>>;

    /// Every stored entity, sorted by key.
    fn entities(&self) -> AuctionResult<Vec<Entity>>;

    fn idempotency(&self, key: &RequestId) -> AuctionResult<Option<IdempotencyRecord>>;

    /// Outbox entries with `seq > after`, oldest first.
    fn events_since(&self, after: u64, limit: usize) -> AuctionResult<Vec<EventEnvelope>>;

    fn commit(&self, changeset: Changeset) -> AuctionResult<CommitReceipt>;
}

// =============================================================================
// Typed reads
// =============================================================================

fn fetch<R: Record, S: LedgerStore + ?Sized>(store: &S, id: &str) -> AuctionResult<R> {
    let key = EntityKey::new(R::KIND, id);
    store
        .get(&key)?
        .and_then(R::from_entity)
        .ok_or_else(|| AuctionError::NotFound { kind: R::KIND.as_str(), id: id.to_string() })
}

fn scan_typed<R: Record, S: LedgerStore + ?Sized>(store: &S, scope: &str) -> AuctionResult<Vec<R>> {
    Ok(store.scan(R::KIND, scope)?.into_iter().filter_map(R::from_entity).collect())
}

pub trait LedgerRead: LedgerStore {
    fn tournament(&self, id: &TournamentId) -> AuctionResult<Tournament> {
        fetch(self, id.as_str())
    }

    fn team(&self, id: &TeamId) -> AuctionResult<Team> {
        fetch(self, id.as_str())
    }

    fn player(&self, id: &PlayerId) -> AuctionResult<Player> {
        fetch(self, id.as_str())
    }

    fn round(&self, id: &RoundId) -> AuctionResult<Round> {
        fetch(self, id.as_str())
    }

    /// Bids for a player in submission order.
    fn bids_for(&self, player: &PlayerId) -> AuctionResult<Vec<Bid>> {
        let mut bids: Vec<Bid> = scan_typed(self, player.as_str())?;
        bids.sort_by(|a, b| a.placed_at.cmp(&b.placed_at).then(a.amount.cmp(&b.amount)));
        Ok(bids)
    }

    fn teams_in(&self, tournament: &TournamentId) -> AuctionResult<Vec<Team>> {
        scan_typed(self, tournament.as_str())
    }

    fn players_in(&self, tournament: &TournamentId) -> AuctionResult<Vec<Player>> {
        scan_typed(self, tournament.as_str())
    }

    fn rounds_in(&self, tournament: &TournamentId) -> AuctionResult<Vec<Round>> {
        scan_typed(self, tournament.as_str())
    }

    fn reservations_for_team(&self, team: &TeamId) -> AuctionResult<Vec<Reservation>> {
        scan_typed(self, team.as_str())
    }

    fn reservation(&self, id: &HoldId) -> AuctionResult<Option<Reservation>> {
        Ok(self.get(&EntityKey::new(Kind::Reservation, id.as_str()))?.and_then(Reservation::from_entity))
    }
}

impl<T: LedgerStore + ?Sized> LedgerRead for T {}

/// Single-record compare-and-set: applies `mutate` to the record stored at
/// `expected_version` and commits it.
pub fn update_if<S, R, F>(
    store: &S,
    id: &str,
    expected_version: u64,
    recorded_at: Timestamp,
    mutate: F,
) -> AuctionResult<R>
where
    S: LedgerStore + ?Sized,
    R: Record,
    F: FnOnce(&mut R) -> AuctionResult<Vec<DomainEvent>>,
{
    let mut record: R = fetch(store, id)?;
    if record.version() != expected_version {
        return Err(AuctionError::conflict(record.key()));
    }
    let events = mutate(&mut record)?;
    let outcome = record.committed();
    let mut cs = Changeset::new(recorded_at);
    cs.update(record);
    for ev in events {
        cs.emit(ev);
    }
    store.commit(cs)?;
    Ok(outcome)
}

/// Registration write path: inserts a tournament with its teams and players.
/// The auction core reads these records but never creates them.
pub fn seed_registration<S: LedgerStore + ?Sized>(
    store: &S,
    tournament: Tournament,
    teams: Vec<Team>,
    players: Vec<Player>,
    recorded_at: Timestamp,
) -> AuctionResult<CommitReceipt> {
    let mut cs = Changeset::new(recorded_at);
    for team in teams {
        if team.tournament_id != tournament.id {
            return Err(AuctionError::invalid(format!("team {} registered to another tournament", team.id)));
        }
        cs.insert(team);
    }
    for player in players {
        if player.tournament_id != tournament.id {
            return Err(AuctionError::invalid(format!("player {} registered to another tournament", player.id)));
        }
        cs.insert(player);
    }
    cs.insert(tournament);
    store.commit(cs)
}

/// Hex sha-256 over every entity in key order.
pub fn state_digest<S: LedgerStore + ?Sized>(store: &S) -> AuctionResult<String> {
    let mut hasher = Sha256::new();
    for entity in store.entities()? {
        hasher.update(serde_json::to_vec(&entity)?);
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlayerStatus;

    fn seeded() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        let t = Tournament::new("t-1", "League", 1000);
        let teams = vec![Team::new("a", &t, "Alpha")];
        let players = vec![Player::new("p-1", &t, "Opener", 100)];
        seed_registration(&ledger, t, teams, players, 1).unwrap();
        ledger
    }

    #[test]
    fn test_typed_reads() {
        let ledger = seeded();
        let p = ledger.player(&PlayerId::new("p-1")).unwrap();
        assert_eq!(p.status, PlayerStatus::Available);
        assert_eq!(p.version, 1);
        assert_eq!(ledger.teams_in(&TournamentId::new("t-1")).unwrap().len(), 1);
        assert!(matches!(
            ledger.team(&TeamId::new("zzz")),
            Err(AuctionError::NotFound { kind: "team", .. })
        ));
    }

    #[test]
    fn test_update_if_rejects_stale_version() {
        let ledger = seeded();
        let res: AuctionResult<Tournament> = update_if(&ledger, "t-1", 7, 2, |t: &mut Tournament| {
            t.paused = true;
            Ok(vec![])
        });
        assert!(matches!(res, Err(AuctionError::Conflict { .. })));

        let t: Tournament = update_if(&ledger, "t-1", 1, 2, |t: &mut Tournament| {
            t.paused = true;
            Ok(vec![])
        })
        .unwrap();
        assert!(t.paused);
        assert_eq!(t.version, 2);
        assert_eq!(ledger.tournament(&TournamentId::new("t-1")).unwrap().version, 2);
    }

    #[test]
    fn test_duplicate_write_rejected() {
        let t = Tournament::new("t-1", "League", 1000);
        let mut cs = Changeset::new(0);
        cs.guard(&t);
        cs.update(t);
        assert!(matches!(cs.validate(), Err(AuctionError::InvalidTransition(_))));
    }

    #[test]
    fn test_seed_rejects_foreign_team() {
        let ledger = MemoryLedger::new();
        let t = Tournament::new("t-1", "League", 1000);
        let other = Tournament::new("t-2", "Other", 1000);
        let res = seed_registration(&ledger, t, vec![Team::new("a", &other, "A")], vec![], 0);
        assert!(res.is_err());
        assert!(ledger.entities().unwrap().is_empty());
    }

    #[test]
    fn test_digest_tracks_state() {
        let ledger = seeded();
        let d1 = state_digest(&ledger).unwrap();
        assert_eq!(d1, state_digest(&ledger).unwrap());
        let _: Tournament = update_if(&ledger, "t-1", 1, 2, |t: &mut Tournament| {
            t.paused = true;
            Ok(vec![])
        })
        .unwrap();
        assert_ne!(d1, state_digest(&ledger).unwrap());
    }
}
