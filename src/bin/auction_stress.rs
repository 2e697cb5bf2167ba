//! Concurrent bidding stress test.
//!
//! Registers one tournament, then for every player fires a burst of
//! concurrent bids from all teams before settling. Reports admitted vs
//! rejected bids, throughput and the invariant check at the end.
//!
//! Usage: cargo run --release --bin auction_stress [players] [bids_per_team]
//! Backend follows LEDGER_BACKEND / SQLITE_PATH / JOURNAL_PATH.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use futures_util::future::join_all;
use rand::Rng;

use cricket_auction::invariants::check_all;
use cricket_auction::ledger::{seed_registration, state_digest};
use cricket_auction::model::{Player, PlayerId, RequestId, Team, TeamId, Tournament};
use cricket_auction::{AuctionConfig, AuctionError, LogSink, Orchestrator};

const BUDGET: u64 = 1_000_000;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let n_players: usize = args.get(1).and_then(|v| v.parse().ok()).unwrap_or(50);
    let bids_per_team: usize = args.get(2).and_then(|v| v.parse().ok()).unwrap_or(5);
    let n_teams = num_cpus::get().clamp(2, 8);

    println!("=== STRESS TEST: Concurrent Bidding ===\n");
    println!("Teams: {}", n_teams);
    println!("Players: {}", n_players);
    println!("Bids per team per player: {}", bids_per_team);
    println!();

    let cfg = AuctionConfig::from_env();
    let orch = Arc::new(Orchestrator::from_config(&cfg)?);
    orch.subscribe(Arc::new(LogSink));

    let tournament = Tournament::new(format!("stress-{:08x}", rand::random::<u32>()).as_str(), "Stress League", BUDGET);
    let teams: Vec<Team> = (0..n_teams)
        .map(|i| Team::new(format!("{}-team-{}", tournament.id, i).as_str(), &tournament, &format!("Team {}", i)))
        .collect();
    let players: Vec<Player> = (0..n_players)
        .map(|i| Player::new(format!("{}-p-{}", tournament.id, i).as_str(), &tournament, &format!("Player {}", i), 10))
        .collect();
    let team_ids: Vec<TeamId> = teams.iter().map(|t| t.id.clone()).collect();
    let player_ids: Vec<PlayerId> = players.iter().map(|p| p.id.clone()).collect();
    let tid = tournament.id.clone();
    seed_registration(orch.ledger().as_ref(), tournament, teams, players, 0)?;

    let round = orch.create_round(&RequestId::generate(), &tid, "Stress Round", player_ids.clone()).await?;
    orch.open_round(&RequestId::generate(), &round.id).await?;

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    let start = Instant::now();

    for player_id in &player_ids {
        orch.open_player(&RequestId::generate(), &round.id, player_id).await?;

        let mut tasks = Vec::with_capacity(n_teams * bids_per_team);
        for team_id in &team_ids {
            for _ in 0..bids_per_team {
                let orch = orch.clone();
                let team_id = team_id.clone();
                let player_id = player_id.clone();
                let amount = rand::thread_rng().gen_range(11..2_000);
                tasks.push(tokio::spawn(async move {
                    orch.place_bid(&RequestId::generate(), &team_id, &player_id, amount).await
                }));
            }
        }
        for joined in join_all(tasks).await {
            let code = match joined? {
                Ok(_) => "accepted",
                Err(e) => e.code(),
            };
            *outcomes.entry(code).or_default() += 1;
        }

        match orch.sell(&RequestId::generate(), player_id).await {
            Ok(_) => *outcomes.entry("sold").or_default() += 1,
            Err(AuctionError::NoBidsPresent { .. }) => {
                orch.mark_unsold(&RequestId::generate(), player_id, false).await?;
                *outcomes.entry("unsold").or_default() += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    orch.complete_round(&RequestId::generate(), &round.id).await?;
    let elapsed = start.elapsed();

    println!("{:>24} {:>10}", "Outcome", "Count");
    println!("{}", "-".repeat(36));
    for (code, count) in &outcomes {
        println!("{:>24} {:>10}", code, count);
    }
    let total_bids = (n_players * n_teams * bids_per_team) as f64;
    println!("\nTime: {:.2?}", elapsed);
    println!("Throughput: {:.0} bids/sec", total_bids / elapsed.as_secs_f64());

    let violations = check_all(orch.ledger().as_ref())?;
    println!("State digest: {}", state_digest(orch.ledger().as_ref())?);
    if !violations.is_empty() {
        for v in &violations {
            println!("✗ {}: {}", v.scope, v.msg);
        }
        bail!("{} invariant violations", violations.len());
    }
    if outcomes.contains_key("conflict") {
        println!("\n⚠️  Conflicts leaked past the retry budget; raise MAX_CONFLICT_RETRIES");
    }
    println!("\n✓ Stress test complete, invariants hold");
    Ok(())
}
