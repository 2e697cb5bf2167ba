//! Durable backends: state, idempotency records and the outbox survive a
//! restart, and both backends agree on the resulting state.

use std::sync::Arc;

use cricket_auction::invariants::check_all;
use cricket_auction::ledger::{seed_registration, state_digest};
use cricket_auction::model::{Player, RequestId, Team, Tournament};
use cricket_auction::{
    AuctionConfig, LedgerBackend, LedgerRead, LedgerStore, ManualClock, MemoryLedger, Orchestrator, SqliteLedger,
};

fn register(ledger: &dyn LedgerStore) {
    let t = Tournament::new("t-1", "League", 1000);
    let teams = vec![Team::new("A", &t, "A"), Team::new("B", &t, "B")];
    let players = vec![Player::new("p-1", &t, "Opener", 100), Player::new("p-2", &t, "Spinner", 80)];
    seed_registration(ledger, t, teams, players, 0).unwrap();
}

/// Fixed request keys and a manual clock; only generated ids differ between runs.
async fn play(orch: &Orchestrator) {
    let round = orch
        .create_round(&"create".into(), &"t-1".into(), "R1", vec!["p-1".into(), "p-2".into()])
        .await
        .unwrap();
    orch.open_round(&"open".into(), &round.id).await.unwrap();
    orch.open_player(&"open-p1".into(), &round.id, &"p-1".into()).await.unwrap();
    orch.place_bid(&"a-150".into(), &"A".into(), &"p-1".into(), 150).await.unwrap();
    orch.place_bid(&"b-200".into(), &"B".into(), &"p-1".into(), 200).await.unwrap();
    orch.sell(&"sell-p1".into(), &"p-1".into()).await.unwrap();
    orch.open_player(&"open-p2".into(), &round.id, &"p-2".into()).await.unwrap();
    orch.mark_unsold(&"unsold-p2".into(), &"p-2".into(), false).await.unwrap();
    orch.complete_round(&"complete".into(), &round.id).await.unwrap();
}

fn orchestrator(ledger: Arc<dyn LedgerStore>) -> Orchestrator {
    Orchestrator::new(ledger, Arc::new(ManualClock::new(5_000)), &AuctionConfig::default())
}

#[tokio::test]
async fn sqlite_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auction.sqlite").to_string_lossy().to_string();
    let cfg = AuctionConfig { backend: LedgerBackend::Sqlite, sqlite_path: path.clone(), ..Default::default() };

    let before = {
        let ledger = cfg.open_ledger().unwrap();
        register(ledger.as_ref());
        let orch = orchestrator(ledger.clone());
        play(&orch).await;
        state_digest(ledger.as_ref()).unwrap()
    };

    let ledger: Arc<dyn LedgerStore> = Arc::new(SqliteLedger::open(&path).unwrap());
    assert_eq!(state_digest(ledger.as_ref()).unwrap(), before);
    assert_eq!(ledger.team(&"B".into()).unwrap().remaining_budget(), 800);
    assert!(check_all(ledger.as_ref()).unwrap().is_empty());

    // The idempotency record outlives the process: a retried sell replays.
    let orch = orchestrator(ledger.clone());
    let sale = orch.sell(&RequestId::new("sell-p1"), &"p-1".into()).await.unwrap();
    assert_eq!(sale.sold_price, 200);
    assert_eq!(state_digest(ledger.as_ref()).unwrap(), before);

    let events = ledger.events_since(0, 100).unwrap();
    assert_eq!(events.last().map(|e| e.event.name()), Some("round_completed"));
}

#[tokio::test]
async fn journal_replay_rebuilds_identical_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auction.journal").to_string_lossy().to_string();

    let before = {
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::open_journaled(&path).unwrap());
        register(ledger.as_ref());
        play(&orchestrator(ledger.clone())).await;
        state_digest(ledger.as_ref()).unwrap()
    };

    let replayed = MemoryLedger::open_journaled(&path).unwrap();
    assert_eq!(state_digest(&replayed).unwrap(), before);
    assert!(replayed.idempotency(&"sell-p1".into()).unwrap().is_some());
    assert_eq!(replayed.events_since(0, 100).unwrap().len(), 8);
}

#[tokio::test]
async fn backends_agree_on_final_state() {
    let memory: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
    let sqlite: Arc<dyn LedgerStore> = Arc::new(SqliteLedger::open_in_memory().unwrap());
    for ledger in [&memory, &sqlite] {
        register(ledger.as_ref());
    }

    // Round and bid ids are generated, so compare players and teams only.
    play(&orchestrator(memory.clone())).await;
    play(&orchestrator(sqlite.clone())).await;
    for ledger in [&memory, &sqlite] {
        assert!(check_all(ledger.as_ref()).unwrap().is_empty());
    }
    let players = |l: &Arc<dyn LedgerStore>| {
        let mut ps = l.players_in(&"t-1".into()).unwrap();
        for p in ps.iter_mut() {
            p.leading = None;
        }
        ps
    };
    assert_eq!(players(&memory), players(&sqlite));
    assert_eq!(memory.teams_in(&"t-1".into()).unwrap(), sqlite.teams_in(&"t-1".into()).unwrap());
}
