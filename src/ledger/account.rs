use crate::Crystals;
use crate::model::TransactionRecord;

/// An account's crystal balance together with its append-only history.
///
/// Balance and log live in the same record so that every change to one is
/// made together with the other.
#[derive(Debug, Clone)]
pub struct AccountState {
    balance: Crystals,
    log: Vec<TransactionRecord>,
}

impl AccountState {
    /// A freshly provisioned account, holding only its grant.
    pub(crate) fn granted(grant: TransactionRecord) -> Self {
        Self {
            balance: grant.balance_after,
            log: vec![grant],
        }
    }

    pub fn balance(&self) -> Crystals {
        self.balance
    }

    pub fn transactions(&self) -> &[TransactionRecord] {
        &self.log
    }

    /// Sum of all balance-moving deltas equals the current balance.
    /// Forfeits restate a stake already logged, so they are not counted twice.
    pub fn reconciles(&self) -> bool {
        let total: i64 = self
            .log
            .iter()
            .filter(|tx| tx.kind.moves_balance())
            .map(|tx| tx.delta)
            .sum();
        total == self.balance.signed()
    }

    /// Balance after removing `amount`, or `None` if that would go negative.
    pub(crate) fn balance_after_debit(&self, amount: Crystals) -> Option<Crystals> {
        self.balance.checked_sub(amount)
    }

    pub(crate) fn balance_after_credit(&self, amount: Crystals) -> Option<Crystals> {
        self.balance.checked_add(amount)
    }

    /// Append an entry and move the balance to its snapshot.
    pub(crate) fn record(&mut self, tx: TransactionRecord) {
        self.balance = tx.balance_after;
        self.log.push(tx);
    }
}
