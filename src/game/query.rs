//! Read-only projections.
//!
//! Everything handed out from here goes through [`RoundView`], which asks
//! [`Round::revealed`] for the winning mountain. An open round never shows it.
//! Bets of a round that is still open read as pending, even when an
//! interrupted settlement has already resolved some of them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Game, GameError};
use crate::Crystals;
use crate::model::{
    AccountId, Bet, BetId, Mountain, Page, PageRequest, Resolution, Round, RoundId, RoundStatus,
    TransactionKind, TransactionRecord,
};

/// Outward view of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundView {
    pub id: RoundId,
    pub status: RoundStatus,
    pub started_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winning: Option<Mountain>,
}

impl From<&Round> for RoundView {
    fn from(round: &Round) -> Self {
        Self {
            id: round.id,
            status: round.status,
            started_at: round.started_at,
            settled_at: round.settled_at,
            winning: round.revealed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentRound {
    #[serde(flatten)]
    pub round: RoundView,
    pub mountains: [Mountain; 2],
}

/// The caller's own stake in a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BetSummary {
    pub mountain: Mountain,
    pub amount: Crystals,
    pub resolution: Resolution,
    pub reward: Crystals,
}

impl BetSummary {
    fn disclosed(bet: &Bet, round: &Round) -> Self {
        let (resolution, reward) = disclosed_outcome(bet, round);
        Self {
            mountain: bet.mountain,
            amount: bet.amount,
            resolution,
            reward,
        }
    }
}

/// Resolution and reward as outsiders may see them.
fn disclosed_outcome(bet: &Bet, round: &Round) -> (Resolution, Crystals) {
    if round.outcome_visible() {
        (bet.resolution, bet.reward)
    } else {
        (Resolution::Pending, Crystals::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundDetail {
    #[serde(flatten)]
    pub round: RoundView,
    pub mountains: [Mountain; 2],
    pub my_bet: Option<BetSummary>,
}

/// One entry of an account's bet history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BetView {
    pub id: BetId,
    pub mountain: Mountain,
    pub amount: Crystals,
    pub resolution: Resolution,
    pub reward: Crystals,
    pub created_at: DateTime<Utc>,
    /// `None` only if the round record could not be found.
    pub round: Option<RoundView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub account: AccountId,
    pub total_profit: i64,
    pub total_reward: Crystals,
}

/// Aggregate resolved bets per account and rank them.
///
/// Sorted by total profit, highest first, ties broken by account id
/// ascending. Ranks are dense: equal profits share a rank and the next
/// distinct profit takes the next number. Pending bets are ignored.
pub fn rank_profits(bets: impl IntoIterator<Item = Bet>, limit: usize) -> Vec<LeaderboardEntry> {
    let mut totals: BTreeMap<AccountId, (i64, Crystals)> = BTreeMap::new();
    for bet in bets.into_iter().filter(|bet| !bet.is_pending()) {
        let (profit, reward) = totals.entry(bet.account.clone()).or_default();
        *profit = profit.saturating_add(bet.profit());
        *reward = reward.saturating_add(bet.reward);
    }

    // BTreeMap iteration is already ordered by account, and the sort is stable
    let mut totals: Vec<_> = totals.into_iter().collect();
    totals.sort_by(|(_, (a, _)), (_, (b, _))| b.cmp(a));

    let mut rank = 0;
    let mut previous = None;
    totals
        .into_iter()
        .take(limit)
        .map(|(account, (total_profit, total_reward))| {
            if previous != Some(total_profit) {
                rank += 1;
                previous = Some(total_profit);
            }
            LeaderboardEntry {
                rank,
                account,
                total_profit,
                total_reward,
            }
        })
        .collect()
}

/// Query surface
impl Game {
    /// The open round, opening one first if needed.
    pub fn current_round(&self) -> Result<CurrentRound, GameError> {
        let round = self.ensure_open_round()?;
        Ok(CurrentRound {
            round: RoundView::from(&round),
            mountains: Mountain::ALL,
        })
    }

    pub fn round_detail(&self, id: RoundId, account: &AccountId) -> Result<RoundDetail, GameError> {
        let round = self.store.round(id).ok_or(GameError::NotFound(id))?;
        let my_bet = self
            .store
            .bet(id, account)
            .map(|bet| BetSummary::disclosed(&bet, &round));
        Ok(RoundDetail {
            round: RoundView::from(&round),
            mountains: Mountain::ALL,
            my_bet,
        })
    }

    /// All rounds, newest first.
    pub fn rounds(&self, page: PageRequest) -> Page<RoundView> {
        page.slice(self.store.rounds()).map(|round| RoundView::from(&round))
    }

    /// The account's bets, newest first, each with its round.
    pub fn bet_history(&self, account: &AccountId, page: PageRequest) -> Page<BetView> {
        page.slice(self.store.bets_for_account(account)).map(|bet| {
            let round = self.store.round(bet.round);
            let (resolution, reward) = match &round {
                Some(round) => disclosed_outcome(&bet, round),
                None => (Resolution::Pending, Crystals::ZERO),
            };
            BetView {
                id: bet.id,
                mountain: bet.mountain,
                amount: bet.amount,
                resolution,
                reward,
                created_at: bet.created_at,
                round: round.as_ref().map(RoundView::from),
            }
        })
    }

    /// Ranks over settled rounds only.
    pub fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let bets = self.store.resolved_bets().into_iter().filter(|bet| {
            self.store
                .round(bet.round)
                .is_some_and(|round| round.outcome_visible())
        });
        rank_profits(bets, limit)
    }

    /// Current balance. Provisions the account on first touch.
    pub fn balance(&self, account: &AccountId) -> Result<Crystals, GameError> {
        Ok(self.ledger.balance(account)?)
    }

    /// Ledger entries of the account, newest first. Payouts and forfeits
    /// stay out of the listing until their round has settled.
    pub fn transactions(&self, account: &AccountId, page: PageRequest) -> Page<TransactionRecord> {
        self.ledger.transactions_where(account, page, |tx| match tx.kind {
            TransactionKind::Payout | TransactionKind::Forfeit => tx
                .reference
                .round
                .and_then(|id| self.store.round(id))
                .is_some_and(|round| round.outcome_visible()),
            TransactionKind::Grant | TransactionKind::Stake => true,
        })
    }

    /// Every provisioned account with its balance, sorted by account id.
    pub fn accounts(&self) -> Vec<(AccountId, Crystals)> {
        self.ledger.accounts()
    }
}
