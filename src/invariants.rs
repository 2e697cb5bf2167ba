//! Ledger-wide consistency checks. Run by tests after every scenario and by
//! the `ledger_audit` binary against a live database.

use std::collections::HashMap;

use crate::error::AuctionResult;
use crate::ledger::{LedgerRead, LedgerStore};
use crate::model::{Amount, Entity, HoldState, PlayerStatus, RoundStatus, Tournament, TournamentId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub scope: String,
    pub msg: String,
}

impl InvariantViolation {
    fn new(scope: impl ToString, msg: impl Into<String>) -> Self {
        Self { scope: scope.to_string(), msg: msg.into() }
    }
}

/// Every tournament in the store.
pub fn check_all<S: LedgerStore + ?Sized>(store: &S) -> AuctionResult<Vec<InvariantViolation>> {
    let mut out = Vec::new();
    for entity in store.entities()? {
        if let Entity::Tournament(t) = entity {
            out.extend(check_tournament(store, &t.id)?);
        }
    }
    Ok(out)
}

pub fn check_tournament<S: LedgerStore + ?Sized>(
    store: &S,
    tournament_id: &TournamentId,
) -> AuctionResult<Vec<InvariantViolation>> {
    let tournament = store.tournament(tournament_id)?;
    let mut out = Vec::new();
    check_budgets(store, &tournament, &mut out)?;
    check_rounds(store, &tournament, &mut out)?;
    check_players(store, &tournament, &mut out)?;
    Ok(out)
}

/// `spent` equals the sold prices of the roster and the committed holds, and
/// never exceeds the team's total.
fn check_budgets<S: LedgerStore + ?Sized>(
    store: &S,
    tournament: &Tournament,
    out: &mut Vec<InvariantViolation>,
) -> AuctionResult<()> {
    let players: HashMap<_, _> = store.players_in(&tournament.id)?.into_iter().map(|p| (p.id.clone(), p)).collect();
    for team in store.teams_in(&tournament.id)? {
        if team.spent > team.total_budget {
            out.push(InvariantViolation::new(&team.id, format!("spent {} exceeds budget {}", team.spent, team.total_budget)));
        }
        let mut roster_total: Amount = 0;
        for pid in &team.roster {
            match players.get(pid) {
                Some(p) if p.status == PlayerStatus::Sold && p.sold_to.as_ref() == Some(&team.id) => {
                    roster_total += p.sold_price.unwrap_or(0);
                }
                _ => out.push(InvariantViolation::new(&team.id, format!("roster player {} not sold to team", pid))),
            }
        }
        if roster_total != team.spent {
            out.push(InvariantViolation::new(
                &team.id,
                format!("spent {} but roster sold prices sum to {}", team.spent, roster_total),
            ));
        }
        let committed: Amount = store
            .reservations_for_team(&team.id)?
            .iter()
            .filter(|r| r.state == HoldState::Committed)
            .map(|r| r.amount)
            .sum();
        if committed != team.spent {
            out.push(InvariantViolation::new(
                &team.id,
                format!("spent {} but committed holds sum to {}", team.spent, committed),
            ));
        }
        if team.roster.len() as u32 > tournament.max_players_per_team {
            out.push(InvariantViolation::new(&team.id, "roster above maximum"));
        }
    }
    Ok(())
}

/// At most one ACTIVE round and it is the one the tournament points at.
fn check_rounds<S: LedgerStore + ?Sized>(
    store: &S,
    tournament: &Tournament,
    out: &mut Vec<InvariantViolation>,
) -> AuctionResult<()> {
    let rounds = store.rounds_in(&tournament.id)?;
    let active: Vec<_> = rounds.iter().filter(|r| r.status == RoundStatus::Active).collect();
    if active.len() > 1 {
        out.push(InvariantViolation::new(&tournament.id, format!("{} active rounds", active.len())));
    }
    let pointed = tournament.active_round.as_ref();
    if active.first().map(|r| &r.id) != pointed && active.len() <= 1 {
        out.push(InvariantViolation::new(&tournament.id, "active_round does not match ACTIVE round"));
    }
    for round in &rounds {
        if round.status != RoundStatus::Active && round.current_player.is_some() {
            out.push(InvariantViolation::new(&round.id, format!("{} round has an open player", round.status.as_str())));
        }
    }
    Ok(())
}

/// One IN_AUCTION player at most, open in the active round; ACTIVE bids only
/// where a sale is pending or settled, and consistent with the player record.
fn check_players<S: LedgerStore + ?Sized>(
    store: &S,
    tournament: &Tournament,
    out: &mut Vec<InvariantViolation>,
) -> AuctionResult<()> {
    let players = store.players_in(&tournament.id)?;
    let in_auction: Vec<_> = players.iter().filter(|p| p.status == PlayerStatus::InAuction).collect();
    if in_auction.len() > 1 {
        out.push(InvariantViolation::new(&tournament.id, format!("{} players IN_AUCTION", in_auction.len())));
    }
    let current = match &tournament.active_round {
        Some(id) => store.round(id)?.current_player,
        None => None,
    };
    if let Some(p) = in_auction.first() {
        if current.as_ref() != Some(&p.id) {
            out.push(InvariantViolation::new(&p.id, "IN_AUCTION but not open in the active round"));
        }
    }

    for player in &players {
        let bids = store.bids_for(&player.id)?;
        let active: Vec<_> = bids.iter().filter(|b| b.is_active()).collect();
        if active.len() > 1 {
            out.push(InvariantViolation::new(&player.id, format!("{} ACTIVE bids", active.len())));
        }
        let top = active.iter().max_by_key(|b| b.amount);
        match player.status {
            PlayerStatus::Available | PlayerStatus::Unsold => {
                if !active.is_empty() || player.leading.is_some() {
                    out.push(InvariantViolation::new(&player.id, "bid artifacts on a player not under auction"));
                }
                if player.sold_price.is_some() || player.sold_to.is_some() {
                    out.push(InvariantViolation::new(&player.id, "sale fields set on unsold player"));
                }
            }
            PlayerStatus::InAuction => {
                let leading = player.leading.as_ref().map(|l| (&l.bid_id, l.amount));
                if leading != top.map(|b| (&b.id, b.amount)) {
                    out.push(InvariantViolation::new(&player.id, "leading bid is not the highest ACTIVE bid"));
                }
            }
            PlayerStatus::Sold => match (top, player.sold_price, &player.sold_to) {
                (Some(bid), Some(price), Some(team)) if bid.amount == price && &bid.team_id == team => {}
                _ => out.push(InvariantViolation::new(&player.id, "SOLD without a matching winning bid")),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{seed_registration, Changeset, MemoryLedger};
    use crate::model::{Player, Team};

    fn seeded() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        let t = Tournament::new("t-1", "League", 1000);
        let teams = vec![Team::new("a", &t, "Alpha")];
        let players = vec![Player::new("p-1", &t, "Opener", 100)];
        seed_registration(&ledger, t, teams, players, 0).unwrap();
        ledger
    }

    #[test]
    fn test_fresh_registration_is_clean() {
        let ledger = seeded();
        assert!(check_all(&ledger).unwrap().is_empty());
    }

    #[test]
    fn test_detects_unbacked_spend() {
        let ledger = seeded();
        let mut team = ledger.team(&"a".into()).unwrap();
        team.spent = 300;
        let mut cs = Changeset::new(1);
        cs.update(team);
        ledger.commit(cs).unwrap();
        let violations = check_all(&ledger).unwrap();
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| v.scope == "a"));
    }

    #[test]
    fn test_detects_sale_fields_on_available_player() {
        let ledger = seeded();
        let mut p = ledger.player(&"p-1".into()).unwrap();
        p.sold_price = Some(120);
        let mut cs = Changeset::new(1);
        cs.update(p);
        ledger.commit(cs).unwrap();
        let violations = check_tournament(&ledger, &"t-1".into()).unwrap();
        assert_eq!(violations, vec![InvariantViolation::new("p-1", "sale fields set on unsold player")]);
    }
}
