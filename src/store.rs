//! In-process record store.
//!
//! Every mutation is atomic with respect to the single record it touches:
//! an account, a round, or one (round, account) bet slot. Nothing here takes
//! a lock that spans unrelated records. When a primitive must touch several
//! records it always locks them in this order:
//!
//! open-round slot -> round -> bet -> account
//!
//! Callers passing closures into [`MemoryStore::create_bet`],
//! [`MemoryStore::amend_bet`] or [`MemoryStore::update_bet`] may reach into
//! accounts but never back into rounds or bets.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use thiserror::Error;

use crate::Crystals;
use crate::ledger::AccountState;
use crate::model::{
    AccountId, Bet, BetId, Mountain, Resolution, Round, RoundId, RoundStatus, TransactionRecord,
    TxId,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("round {0} not found")]
    RoundNotFound(RoundId),

    #[error("round {0} is not accepting changes")]
    RoundNotOpen(RoundId),

    #[error("round {0} is already open")]
    RoundAlreadyOpen(RoundId),

    #[error("round {round} still has {count} pending bets")]
    PendingBets { round: RoundId, count: usize },

    #[error("account {account} already has a bet in round {round}")]
    DuplicateBet { account: AccountId, round: RoundId },

    #[error("account {account} has no bet in round {round}")]
    BetNotFound { account: AccountId, round: RoundId },

    #[error("storage fault: {0}")]
    Fault(String),
}

#[derive(Debug)]
struct RoundRecord {
    round: Round,
    /// Set when settlement starts; no new bets may be created afterwards.
    sealed: bool,
}

/// Unique index over `status = open`, plus the last allocated round number.
#[derive(Debug, Default)]
struct OpenSlot {
    open: Option<RoundId>,
    last: RoundId,
}

pub struct MemoryStore {
    accounts: DashMap<AccountId, AccountState>,
    rounds: DashMap<RoundId, RoundRecord>,
    open_slot: Mutex<OpenSlot>,
    bets: DashMap<(RoundId, AccountId), Bet>,
    next_bet: AtomicU64,
    next_tx: AtomicU64,
    #[cfg(test)]
    faults: FaultPlan,
}

/// Accounts
impl MemoryStore {
    /// Run `f` against the account record, creating it with `provision` on
    /// first touch. The record stays locked for the duration of `f`.
    pub fn update_account<T, E>(
        &self,
        account: &AccountId,
        provision: impl FnOnce() -> AccountState,
        f: impl FnOnce(&mut AccountState) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.check_fault()?;
        let mut state = self.accounts.entry(account.clone()).or_insert_with(provision);
        f(&mut state)
    }

    pub fn account_transactions(&self, account: &AccountId) -> Vec<TransactionRecord> {
        self.accounts
            .get(account)
            .map(|state| state.transactions().to_vec())
            .unwrap_or_default()
    }

    /// Every provisioned account with its balance, sorted by account id.
    pub fn account_balances(&self) -> Vec<(AccountId, Crystals)> {
        let mut balances: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().balance()))
            .collect();
        balances.sort();
        balances
    }

    pub fn next_tx_id(&self) -> TxId {
        self.next_tx.fetch_add(1, Ordering::Relaxed)
    }
}

/// Rounds
impl MemoryStore {
    pub fn open_round(&self) -> Option<Round> {
        let slot = self.open_slot.lock();
        slot.open
            .and_then(|id| self.rounds.get(&id).map(|record| record.round.clone()))
    }

    pub fn round(&self, id: RoundId) -> Option<Round> {
        self.rounds.get(&id).map(|record| record.round.clone())
    }

    /// All rounds, newest first.
    pub fn rounds(&self) -> Vec<Round> {
        let mut rounds: Vec<_> = self
            .rounds
            .iter()
            .map(|record| record.round.clone())
            .collect();
        rounds.sort_by(|a, b| b.id.cmp(&a.id));
        rounds
    }

    /// Open the next round in sequence. Fails if another round is open.
    pub fn create_round(
        &self,
        winning: Mountain,
        started_at: DateTime<Utc>,
    ) -> Result<Round, StoreError> {
        self.check_fault()?;
        let mut slot = self.open_slot.lock();
        if let Some(open) = slot.open {
            return Err(StoreError::RoundAlreadyOpen(open));
        }

        let id = slot.last + 1;
        let round = Round::open(id, winning, started_at);
        self.rounds.insert(
            id,
            RoundRecord {
                round: round.clone(),
                sealed: false,
            },
        );
        slot.open = Some(id);
        slot.last = id;
        Ok(round)
    }

    /// Stop accepting new bets for an open round. Idempotent.
    pub fn seal_round(&self, id: RoundId) -> Result<Round, StoreError> {
        self.check_fault()?;
        let mut record = self
            .rounds
            .get_mut(&id)
            .ok_or(StoreError::RoundNotFound(id))?;
        if !record.round.is_open() {
            return Err(StoreError::RoundNotOpen(id));
        }
        record.sealed = true;
        Ok(record.round.clone())
    }

    /// Compare-and-set `open -> settled`. Refused while any bet of the round
    /// is still pending.
    pub fn mark_settled(&self, id: RoundId, at: DateTime<Utc>) -> Result<Round, StoreError> {
        self.check_fault()?;
        let mut slot = self.open_slot.lock();
        let mut record = self
            .rounds
            .get_mut(&id)
            .ok_or(StoreError::RoundNotFound(id))?;
        if !record.round.is_open() {
            return Err(StoreError::RoundNotOpen(id));
        }

        let pending = self
            .bets
            .iter()
            .filter(|bet| bet.round == id && bet.is_pending())
            .count();
        if pending > 0 {
            return Err(StoreError::PendingBets {
                round: id,
                count: pending,
            });
        }

        record.round.status = RoundStatus::Settled;
        record.round.settled_at = Some(at);
        record.sealed = true;
        if slot.open == Some(id) {
            slot.open = None;
        }
        Ok(record.round.clone())
    }
}

/// Bets
impl MemoryStore {
    /// Create the one bet `account` may hold in `round`.
    ///
    /// `fund` runs while the (round, account) slot is held and before the
    /// bet becomes visible; if it fails nothing is inserted. A concurrent
    /// creation for the same slot gets [`StoreError::DuplicateBet`].
    pub fn create_bet<T, E>(
        &self,
        round: RoundId,
        account: &AccountId,
        mountain: Mountain,
        amount: Crystals,
        at: DateTime<Utc>,
        fund: impl FnOnce(&Bet) -> Result<T, E>,
    ) -> Result<(Bet, T), E>
    where
        E: From<StoreError>,
    {
        self.check_fault()?;
        self.pass_creation_gate();
        let record = self
            .rounds
            .get(&round)
            .ok_or(StoreError::RoundNotFound(round))?;
        if !record.round.is_open() || record.sealed {
            return Err(StoreError::RoundNotOpen(round).into());
        }

        match self.bets.entry((round, account.clone())) {
            Entry::Occupied(_) => Err(StoreError::DuplicateBet {
                account: account.clone(),
                round,
            }
            .into()),
            Entry::Vacant(slot) => {
                let bet = Bet {
                    id: self.next_bet_id(),
                    account: account.clone(),
                    round,
                    mountain,
                    amount,
                    resolution: Resolution::Pending,
                    reward: Crystals::ZERO,
                    created_at: at,
                    updated_at: at,
                };
                let funded = fund(&bet)?;
                slot.insert(bet.clone());
                Ok((bet, funded))
            }
        }
    }

    /// Caller-side change to a bet. Like [`MemoryStore::update_bet`], but
    /// refused with [`StoreError::RoundNotOpen`] once settlement has sealed
    /// the round. The round stays read-locked while `f` runs, so sealing
    /// waits for an amendment already in progress.
    pub fn amend_bet<T, E>(
        &self,
        round: RoundId,
        account: &AccountId,
        f: impl FnOnce(&mut Bet) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.check_fault()?;
        let record = self
            .rounds
            .get(&round)
            .ok_or(StoreError::RoundNotFound(round))?;
        if !record.round.is_open() || record.sealed {
            return Err(StoreError::RoundNotOpen(round).into());
        }
        self.write_bet(round, account, f)
    }

    /// Apply `f` to a copy of the bet and write it back only if `f` succeeds.
    /// The bet stays locked throughout, so updates to one bet are serialized.
    pub fn update_bet<T, E>(
        &self,
        round: RoundId,
        account: &AccountId,
        f: impl FnOnce(&mut Bet) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.check_fault()?;
        self.write_bet(round, account, f)
    }

    fn write_bet<T, E>(
        &self,
        round: RoundId,
        account: &AccountId,
        f: impl FnOnce(&mut Bet) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut entry =
            self.bets
                .get_mut(&(round, account.clone()))
                .ok_or_else(|| StoreError::BetNotFound {
                    account: account.clone(),
                    round,
                })?;
        let mut draft = entry.value().clone();
        let out = f(&mut draft)?;
        *entry = draft;
        Ok(out)
    }

    pub fn bet(&self, round: RoundId, account: &AccountId) -> Option<Bet> {
        self.bets
            .get(&(round, account.clone()))
            .map(|bet| bet.value().clone())
    }

    /// Bets of one round in placement order.
    pub fn bets_for_round(&self, round: RoundId) -> Vec<Bet> {
        let mut bets: Vec<_> = self
            .bets
            .iter()
            .filter(|bet| bet.round == round)
            .map(|bet| bet.value().clone())
            .collect();
        bets.sort_by_key(|bet| bet.id);
        bets
    }

    /// Bets of one account, newest first.
    pub fn bets_for_account(&self, account: &AccountId) -> Vec<Bet> {
        let mut bets: Vec<_> = self
            .bets
            .iter()
            .filter(|bet| &bet.account == account)
            .map(|bet| bet.value().clone())
            .collect();
        bets.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        bets
    }

    pub fn resolved_bets(&self) -> Vec<Bet> {
        self.bets
            .iter()
            .filter(|bet| !bet.is_pending())
            .map(|bet| bet.value().clone())
            .collect()
    }

    fn next_bet_id(&self) -> BetId {
        self.next_bet.fetch_add(1, Ordering::Relaxed)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            rounds: DashMap::new(),
            open_slot: Mutex::new(OpenSlot::default()),
            bets: DashMap::new(),
            next_bet: AtomicU64::new(1),
            next_tx: AtomicU64::new(1),
            #[cfg(test)]
            faults: FaultPlan::default(),
        }
    }

    #[cfg(not(test))]
    fn check_fault(&self) -> Result<(), StoreError> {
        Ok(())
    }

    #[cfg(not(test))]
    fn pass_creation_gate(&self) {}
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Fault injection for exercising partial failures and races.
#[cfg(test)]
#[derive(Debug, Default)]
struct FaultPlan {
    /// Mutations left before every mutation starts failing.
    remaining: Mutex<Option<usize>>,
    /// Bet creations wait here until all parties have arrived.
    creation_gate: Mutex<Option<std::sync::Arc<std::sync::Barrier>>>,
}

#[cfg(test)]
impl MemoryStore {
    pub(crate) fn fail_after(&self, mutations: usize) {
        *self.faults.remaining.lock() = Some(mutations);
    }

    pub(crate) fn heal(&self) {
        *self.faults.remaining.lock() = None;
    }

    /// Hold the next `parties` bet creations until they have all entered
    /// [`MemoryStore::create_bet`].
    pub(crate) fn gate_bet_creation(&self, parties: usize) {
        *self.faults.creation_gate.lock() =
            Some(std::sync::Arc::new(std::sync::Barrier::new(parties)));
    }

    fn pass_creation_gate(&self) {
        let gate = self.faults.creation_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait();
        }
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let mut remaining = self.faults.remaining.lock();
        match remaining.as_mut() {
            Some(0) => Err(StoreError::Fault("injected".to_string())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
