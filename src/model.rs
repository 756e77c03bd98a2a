//! Core domain types for the round engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Crystals;

/// Round identifier. Rounds are numbered 1, 2, 3, ... without gaps, so the
/// sequence number doubles as the id.
pub type RoundId = u64;

/// Bet identifier.
pub type BetId = u64;

/// Ledger transaction identifier.
pub type TxId = u64;

/// Opaque, already-authenticated account identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        AccountId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        AccountId::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        AccountId(id)
    }
}

/// One of the two outcomes a bet can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mountain {
    AzureDragon,
    WhiteTiger,
}

impl Mountain {
    pub const ALL: [Mountain; 2] = [Mountain::AzureDragon, Mountain::WhiteTiger];

    pub fn as_str(self) -> &'static str {
        match self {
            Mountain::AzureDragon => "azure-dragon",
            Mountain::WhiteTiger => "white-tiger",
        }
    }
}

impl fmt::Display for Mountain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names neither mountain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMountain(pub String);

impl FromStr for Mountain {
    type Err = UnknownMountain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mountain::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMountain(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Open,
    Settled,
}

/// One betting period.
///
/// The winning mountain is drawn when the round opens and never changes.
/// It is only readable through [`Round::revealed`] outside this crate, which
/// hides it until the round is settled, and `Debug` output redacts it the
/// same way so it cannot slip into logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Round {
    pub id: RoundId,
    pub(crate) winning: Mountain,
    pub status: RoundStatus,
    pub started_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Round {
    pub(crate) fn open(id: RoundId, winning: Mountain, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            winning,
            status: RoundStatus::Open,
            started_at,
            settled_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == RoundStatus::Open
    }

    /// Whether the winning mountain may be shown to anyone.
    pub fn outcome_visible(&self) -> bool {
        self.status == RoundStatus::Settled
    }

    /// The winning mountain, once the round is settled.
    pub fn revealed(&self) -> Option<Mountain> {
        self.outcome_visible().then_some(self.winning)
    }
}

impl fmt::Debug for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Round")
            .field("id", &self.id)
            .field("winning", &self.revealed())
            .field("status", &self.status)
            .field("started_at", &self.started_at)
            .field("settled_at", &self.settled_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Pending,
    Won,
    Lost,
}

/// One account's stake on one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bet {
    pub id: BetId,
    pub account: AccountId,
    pub round: RoundId,
    pub mountain: Mountain,
    /// Cumulative stake. Frozen once the bet is resolved.
    pub amount: Crystals,
    pub resolution: Resolution,
    /// Zero until resolved, then zero or twice the stake.
    pub reward: Crystals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bet {
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }

    /// Net result for the leaderboard: `+amount` won, `-amount` lost, 0 pending.
    pub fn profit(&self) -> i64 {
        match self.resolution {
            Resolution::Won => self.amount.signed(),
            Resolution::Lost => -self.amount.signed(),
            Resolution::Pending => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Starting balance, once per account.
    Grant,
    /// Crystals moved from the balance into a bet.
    Stake,
    /// Winnings credited on settlement.
    Payout,
    /// Bookkeeping entry for a lost bet; the balance was already debited by the stake.
    Forfeit,
}

impl TransactionKind {
    /// Whether entries of this kind change the balance.
    pub fn moves_balance(self) -> bool {
        !matches!(self, TransactionKind::Forfeit)
    }
}

/// Optional round and bet a ledger entry refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxRef {
    pub round: Option<RoundId>,
    pub bet: Option<BetId>,
}

impl TxRef {
    pub fn bet(round: RoundId, bet: BetId) -> Self {
        Self {
            round: Some(round),
            bet: Some(bet),
        }
    }
}

/// Immutable ledger entry, one per balance change (plus forfeits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub id: TxId,
    pub account: AccountId,
    pub kind: TransactionKind,
    pub delta: i64,
    pub balance_after: Crystals,
    #[serde(flatten)]
    pub reference: TxRef,
    pub created_at: DateTime<Utc>,
}

/// Commands accepted by [`Game::apply`](crate::Game::apply).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Place or amend a bet on the current round.
    Bet {
        account: AccountId,
        mountain: Option<String>,
        amount: Option<i64>,
    },
    /// Settle the open round now and open the next one.
    Settle,
    /// Touch an account's balance (provisions it if new).
    Balance { account: AccountId },
}

/// 1-based page request for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit,
        }
    }

    pub fn skip(&self) -> usize {
        (self.page.max(1) - 1).saturating_mul(self.limit)
    }

    /// Cut one page out of an already-sorted listing.
    pub fn slice<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len();
        let items = items.into_iter().skip(self.skip()).take(self.limit).collect();
        Page {
            items,
            total,
            page: self.page.max(1),
            limit: self.limit,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
        }
    }
}
