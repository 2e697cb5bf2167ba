//! Ledger entities: tournaments, teams, players, rounds, bids and budget holds.
//!
//! Every record carries a `version` owned by the ledger store. Callers read a
//! record, mutate a copy and hand the copy back in a changeset; the store
//! accepts the write only while the stored version still equals the carried one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Currency units (whole rupees / points). Never negative.
pub type Amount = u64;

/// Epoch milliseconds.
pub type Timestamp = u64;

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Random id with a readable prefix.
            pub fn generate() -> Self {
                Self(format!("{}-{:016x}", $prefix, rand::random::<u64>()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

id_type!(TournamentId, "trn");
id_type!(TeamId, "team");
id_type!(PlayerId, "plr");
id_type!(RoundId, "rnd");
id_type!(BidId, "bid");
id_type!(HoldId, "hold");
id_type!(RequestId, "req");

// =============================================================================
// Statuses
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerStatus {
    Available,
    InAuction,
    Sold,
    Unsold,
}

impl PlayerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerStatus::Available => "AVAILABLE",
            PlayerStatus::InAuction => "IN_AUCTION",
            PlayerStatus::Sold => "SOLD",
            PlayerStatus::Unsold => "UNSOLD",
        }
    }
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    Pending,
    Active,
    Completed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Pending => "PENDING",
            RoundStatus::Active => "ACTIVE",
            RoundStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Active,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldState {
    Held,
    Released,
    Committed,
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: TournamentId,
    pub name: String,
    /// Budget each team starts with.
    pub total_team_budget: Amount,
    /// Lowest valuation any player can carry; drives the roster floor.
    pub min_player_value: Amount,
    pub min_players_per_team: u32,
    pub max_players_per_team: u32,
    /// Administrative pause: no players opened, no bids admitted.
    pub paused: bool,
    pub active_round: Option<RoundId>,
    pub version: u64,
}

impl Tournament {
    pub fn new(id: impl Into<TournamentId>, name: &str, total_team_budget: Amount) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            total_team_budget,
            min_player_value: 0,
            min_players_per_team: 0,
            max_players_per_team: u32::MAX,
            paused: false,
            active_round: None,
            version: 0,
        }
    }

    pub fn with_roster_limits(mut self, min_players: u32, max_players: u32, min_value: Amount) -> Self {
        self.min_players_per_team = min_players;
        self.max_players_per_team = max_players;
        self.min_player_value = min_value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub tournament_id: TournamentId,
    pub name: String,
    pub total_budget: Amount,
    /// Sum of sold prices of `roster`. Written only by settlement.
    pub spent: Amount,
    pub roster: Vec<PlayerId>,
    pub version: u64,
}

impl Team {
    pub fn new(id: impl Into<TeamId>, tournament: &Tournament, name: &str) -> Self {
        Self {
            id: id.into(),
            tournament_id: tournament.id.clone(),
            name: name.to_string(),
            total_budget: tournament.total_team_budget,
            spent: 0,
            roster: Vec::new(),
            version: 0,
        }
    }

    pub fn remaining_budget(&self) -> Amount {
        self.total_budget.saturating_sub(self.spent)
    }
}

/// The bid currently leading for a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadingBid {
    pub bid_id: BidId,
    pub team_id: TeamId,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub tournament_id: TournamentId,
    pub name: String,
    pub base_price: Amount,
    pub status: PlayerStatus,
    pub sold_price: Option<Amount>,
    pub sold_to: Option<TeamId>,
    pub leading: Option<LeadingBid>,
    pub version: u64,
}

impl Player {
    pub fn new(id: impl Into<PlayerId>, tournament: &Tournament, name: &str, base_price: Amount) -> Self {
        Self {
            id: id.into(),
            tournament_id: tournament.id.clone(),
            name: name.to_string(),
            base_price,
            status: PlayerStatus::Available,
            sold_price: None,
            sold_to: None,
            leading: None,
            version: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub tournament_id: TournamentId,
    pub name: String,
    pub status: RoundStatus,
    /// Players assigned to this round, in auction order.
    pub players: Vec<PlayerId>,
    /// Players whose slot has been closed at least once.
    pub closed: Vec<PlayerId>,
    pub current_player: Option<PlayerId>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Completed by administrative force-close.
    pub forced: bool,
    pub version: u64,
}

impl Round {
    pub fn is_assigned(&self, player: &PlayerId) -> bool {
        self.players.contains(player)
    }

    pub fn pending_players(&self) -> Vec<&PlayerId> {
        self.players.iter().filter(|p| !self.closed.contains(p)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub tournament_id: TournamentId,
    pub round_id: RoundId,
    pub team_id: TeamId,
    pub player_id: PlayerId,
    pub amount: Amount,
    pub placed_at: Timestamp,
    pub status: BidStatus,
    pub hold_id: HoldId,
    pub version: u64,
}

impl Bid {
    pub fn is_active(&self) -> bool {
        self.status == BidStatus::Active
    }
}

/// Time-boxed hold against a team's budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: HoldId,
    pub team_id: TeamId,
    pub player_id: PlayerId,
    pub amount: Amount,
    pub expires_at: Timestamp,
    pub state: HoldState,
    pub version: u64,
}

impl Reservation {
    /// Held and not yet expired at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.state == HoldState::Held && now < self.expires_at
    }
}

/// Result of a committed sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub player_id: PlayerId,
    pub team_id: TeamId,
    pub round_id: RoundId,
    pub bid_id: BidId,
    pub sold_price: Amount,
    pub team_remaining: Amount,
    pub sold_at: Timestamp,
}

/// Result of an unsold disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsoldRecord {
    pub player_id: PlayerId,
    pub round_id: RoundId,
    pub overridden: bool,
    pub superseded_bids: Vec<BidId>,
    pub recorded_at: Timestamp,
}

/// Result of an administrative force-close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceCloseRecord {
    pub round: Round,
    pub unsold: Option<UnsoldRecord>,
}

// =============================================================================
// Generic record access
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Tournament,
    Team,
    Player,
    Round,
    Bid,
    Reservation,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Tournament => "tournament",
            Kind::Team => "team",
            Kind::Player => "player",
            Kind::Round => "round",
            Kind::Bid => "bid",
            Kind::Reservation => "reservation",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: Kind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: Kind, id: &str) -> Self {
        Self { kind, id: id.to_string() }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Entity {
    Tournament(Tournament),
    Team(Team),
    Player(Player),
    Round(Round),
    Bid(Bid),
    Reservation(Reservation),
}

impl Entity {
    pub fn kind(&self) -> Kind {
        match self {
            Entity::Tournament(_) => Kind::Tournament,
            Entity::Team(_) => Kind::Team,
            Entity::Player(_) => Kind::Player,
            Entity::Round(_) => Kind::Round,
            Entity::Bid(_) => Kind::Bid,
            Entity::Reservation(_) => Kind::Reservation,
        }
    }

    pub fn key(&self) -> EntityKey {
        let id = match self {
            Entity::Tournament(t) => t.id.as_str(),
            Entity::Team(t) => t.id.as_str(),
            Entity::Player(p) => p.id.as_str(),
            Entity::Round(r) => r.id.as_str(),
            Entity::Bid(b) => b.id.as_str(),
            Entity::Reservation(r) => r.id.as_str(),
        };
        EntityKey::new(self.kind(), id)
    }

    /// Secondary index used by `LedgerStore::scan`: tournament for
    /// teams/players/rounds, player for bids, team for reservations.
    pub fn scope(&self) -> &str {
        match self {
            Entity::Tournament(t) => t.id.as_str(),
            Entity::Team(t) => t.tournament_id.as_str(),
            Entity::Player(p) => p.tournament_id.as_str(),
            Entity::Round(r) => r.tournament_id.as_str(),
            Entity::Bid(b) => b.player_id.as_str(),
            Entity::Reservation(r) => r.team_id.as_str(),
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Entity::Tournament(t) => t.version,
            Entity::Team(t) => t.version,
            Entity::Player(p) => p.version,
            Entity::Round(r) => r.version,
            Entity::Bid(b) => b.version,
            Entity::Reservation(r) => r.version,
        }
    }

    pub fn set_version(&mut self, version: u64) {
        match self {
            Entity::Tournament(t) => t.version = version,
            Entity::Team(t) => t.version = version,
            Entity::Player(p) => p.version = version,
            Entity::Round(r) => r.version = version,
            Entity::Bid(b) => b.version = version,
            Entity::Reservation(r) => r.version = version,
        }
    }
}

/// Typed view over `Entity`.
pub trait Record: Clone + Sized {
    const KIND: Kind;

    fn id_str(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn from_entity(entity: Entity) -> Option<Self>;
    fn into_entity(self) -> Entity;

    fn key(&self) -> EntityKey {
        EntityKey::new(Self::KIND, self.id_str())
    }

    /// The record as it will read after a successful update commit.
    fn committed(&self) -> Self {
        let mut next = self.clone();
        next.set_version(self.version() + 1);
        next
    }
}

macro_rules! record_impl {
    ($ty:ident) => {
        impl Record for $ty {
            const KIND: Kind = Kind::$ty;

            fn id_str(&self) -> &str {
                self.id.as_str()
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn set_version(&mut self, version: u64) {
                self.version = version;
            }

            fn from_entity(entity: Entity) -> Option<Self> {
                match entity {
                    Entity::$ty(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_entity(self) -> Entity {
                Entity::$ty(self)
            }
        }
    };
}

record_impl!(Tournament);
record_impl!(Team);
record_impl!(Player);
record_impl!(Round);
record_impl!(Bid);
record_impl!(Reservation);
