//! Error types returned by the round engine.

use thiserror::Error;

use crate::Crystals;
use crate::ledger::LedgerError;
use crate::model::{AccountId, RoundId};
use crate::store::StoreError;

/// Top-level error returned by every [`Game`](super::Game) operation.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("round {0} not found")]
    NotFound(RoundId),

    #[error("round {0} is closed")]
    RoundClosed(RoundId),

    #[error("insufficient crystals for account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Crystals,
        requested: Crystals,
    },

    #[error("conflict: {0}")]
    Conflict(#[from] Conflict),

    #[error("storage fault: {0}")]
    Storage(String),
}

/// Malformed input. Nothing was changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("a round reference is required")]
    MissingRound,
    #[error("unknown mountain '{0}'")]
    UnknownMountain(String),
    #[error("amount {0} is negative")]
    NegativeAmount(i64),
    #[error("a first bet needs a mountain and an amount of at least 1")]
    IncompleteFirstBet,
}

/// Lost a race against another writer of the same record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    /// Another first bet for the same account and round got there first; retry as an amendment.
    #[error("account {account} already has a bet in round {round}")]
    DuplicateBet { account: AccountId, round: RoundId },

    /// Settlement already resolved the bet.
    #[error("bet of account {account} in round {round} is already resolved")]
    BetResolved { account: AccountId, round: RoundId },
}

impl GameError {
    /// Whether the caller can act on the error (as opposed to an infrastructure failure).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GameError::Storage(_))
    }
}

impl From<StoreError> for GameError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RoundNotFound(id) => GameError::NotFound(id),
            StoreError::RoundNotOpen(id) => GameError::RoundClosed(id),
            StoreError::DuplicateBet { account, round } => {
                Conflict::DuplicateBet { account, round }.into()
            }
            StoreError::Fault(reason) => GameError::Storage(reason),
            other @ (StoreError::RoundAlreadyOpen(_)
            | StoreError::PendingBets { .. }
            | StoreError::BetNotFound { .. }) => GameError::Storage(other.to_string()),
        }
    }
}

impl From<LedgerError> for GameError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                account,
                balance,
                requested,
            } => GameError::InsufficientFunds {
                account,
                balance,
                requested,
            },
            LedgerError::Overflow { .. } => GameError::Storage(err.to_string()),
            LedgerError::Store(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_caller_kinds() {
        assert!(matches!(
            GameError::from(StoreError::RoundNotFound(3)),
            GameError::NotFound(3)
        ));
        assert!(matches!(
            GameError::from(StoreError::RoundNotOpen(3)),
            GameError::RoundClosed(3)
        ));
        assert!(matches!(
            GameError::from(StoreError::DuplicateBet {
                account: "alice".into(),
                round: 3
            }),
            GameError::Conflict(Conflict::DuplicateBet { round: 3, .. })
        ));
    }

    #[test]
    fn faults_are_not_recoverable() {
        let err = GameError::from(StoreError::Fault("disk on fire".into()));
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "storage fault: disk on fire");
    }

    #[test]
    fn ledger_shortfall_becomes_insufficient_funds() {
        let err = GameError::from(LedgerError::InsufficientFunds {
            account: "alice".into(),
            balance: Crystals::new(5),
            requested: Crystals::new(10),
        });
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "insufficient crystals for account alice: balance 5, requested 10"
        );
    }
}
