//! Crystal balances and their transaction log.
//!
//! Accounts are provisioned with the starting grant the first time any
//! balance operation touches them. Every balance change is checked and
//! applied inside the store's per-account atomic update, together with the
//! log entry describing it.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Crystals;
use crate::clock::Clock;
use crate::model::{AccountId, Page, PageRequest, TransactionKind, TransactionRecord, TxRef};
use crate::store::{MemoryStore, StoreError};

mod account;
pub use account::AccountState;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient crystals for account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Crystals,
        requested: Crystals,
    },

    #[error("crediting {amount} to account {account} would overflow its balance")]
    Overflow { account: AccountId, amount: Crystals },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Ledger {
    store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    starting_balance: Crystals,
}

/// Public API
impl Ledger {
    pub fn new(store: Arc<MemoryStore>, clock: Arc<dyn Clock>, starting_balance: Crystals) -> Self {
        if starting_balance > Crystals::MAX {
            warn!(requested = %starting_balance, max = %Crystals::MAX, "starting balance clamped");
        }
        Self {
            store,
            clock,
            starting_balance: starting_balance.min(Crystals::MAX),
        }
    }

    pub fn balance(&self, account: &AccountId) -> Result<Crystals, LedgerError> {
        self.store.update_account(
            account,
            || self.provision(account),
            |state| Ok(state.balance()),
        )
    }

    /// Remove `amount` only if the balance covers it, logging a `stake` entry.
    /// On failure the account is left exactly as it was.
    pub fn debit_if_sufficient(
        &self,
        account: &AccountId,
        amount: Crystals,
        reference: TxRef,
    ) -> Result<Crystals, LedgerError> {
        self.store.update_account(
            account,
            || self.provision(account),
            |state| {
                let balance_after = state.balance_after_debit(amount).ok_or_else(|| {
                    LedgerError::InsufficientFunds {
                        account: account.clone(),
                        balance: state.balance(),
                        requested: amount,
                    }
                })?;
                state.record(self.entry(
                    account,
                    TransactionKind::Stake,
                    -amount.signed(),
                    balance_after,
                    reference,
                ));
                Ok(balance_after)
            },
        )
    }

    /// Add `amount`, logging an entry of the given kind (`grant` or `payout`).
    pub fn credit(
        &self,
        account: &AccountId,
        amount: Crystals,
        kind: TransactionKind,
        reference: TxRef,
    ) -> Result<Crystals, LedgerError> {
        self.store.update_account(
            account,
            || self.provision(account),
            |state| {
                let balance_after =
                    state
                        .balance_after_credit(amount)
                        .ok_or_else(|| LedgerError::Overflow {
                            account: account.clone(),
                            amount,
                        })?;
                state.record(self.entry(account, kind, amount.signed(), balance_after, reference));
                Ok(balance_after)
            },
        )
    }

    /// Log a lost stake. The balance is not touched; the crystals already
    /// left it when the stake was debited.
    pub fn record_forfeit(
        &self,
        account: &AccountId,
        amount: Crystals,
        reference: TxRef,
    ) -> Result<TransactionRecord, LedgerError> {
        self.store.update_account(
            account,
            || self.provision(account),
            |state| {
                let entry = self.entry(
                    account,
                    TransactionKind::Forfeit,
                    -amount.signed(),
                    state.balance(),
                    reference,
                );
                state.record(entry.clone());
                Ok(entry)
            },
        )
    }

    /// Ledger entries of one account, newest first.
    pub fn transactions(&self, account: &AccountId, page: PageRequest) -> Page<TransactionRecord> {
        self.transactions_where(account, page, |_| true)
    }

    /// Like [`Ledger::transactions`], over the entries `keep` accepts only.
    pub fn transactions_where(
        &self,
        account: &AccountId,
        page: PageRequest,
        keep: impl FnMut(&TransactionRecord) -> bool,
    ) -> Page<TransactionRecord> {
        let mut log = self.store.account_transactions(account);
        log.retain(keep);
        log.reverse();
        page.slice(log)
    }

    /// Every provisioned account and its balance, sorted by account id.
    pub fn accounts(&self) -> Vec<(AccountId, Crystals)> {
        self.store.account_balances()
    }
}

/// Private API
impl Ledger {
    /// Build the record for a brand new account. Runs at most once per
    /// account, while the store holds the vacant entry.
    fn provision(&self, account: &AccountId) -> AccountState {
        info!(account = %account, grant = %self.starting_balance, "account provisioned");
        AccountState::granted(self.entry(
            account,
            TransactionKind::Grant,
            self.starting_balance.signed(),
            self.starting_balance,
            TxRef::default(),
        ))
    }

    fn entry(
        &self,
        account: &AccountId,
        kind: TransactionKind,
        delta: i64,
        balance_after: Crystals,
        reference: TxRef,
    ) -> TransactionRecord {
        debug!(account = %account, ?kind, delta, balance_after = %balance_after, "ledger entry");
        TransactionRecord {
            id: self.store.next_tx_id(),
            account: account.clone(),
            kind,
            delta,
            balance_after,
            reference,
            created_at: self.clock.now(),
        }
    }
}
