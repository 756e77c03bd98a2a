//! Round lifecycle engine.
//!
//! `Game` ties the store, the ledger and the winning-mountain draw together.
//! Betting, settlement and the read-only projections live in submodules as
//! further `impl Game` blocks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::GameConfig;
use crate::ledger::Ledger;
use crate::model::{AccountId, Command, Mountain, Round};
use crate::store::{MemoryStore, StoreError};

mod betting;
pub use betting::BetRequest;

mod settlement;
pub use settlement::{SettleOutcome, Settlement};

mod query;
pub use query::{
    BetSummary, BetView, CurrentRound, LeaderboardEntry, RoundDetail, RoundView, rank_profits,
};

mod error;
pub use error::{Conflict, GameError, ValidationError};

pub struct Game {
    pub(crate) store: Arc<MemoryStore>,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    config: GameConfig,
    rng: Mutex<StdRng>,
}

/// Public API
impl Game {
    pub fn new(config: GameConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GameConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(Arc::clone(&store), Arc::clone(&clock), config.starting_balance);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            ledger,
            clock,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The round currently accepting bets, if any.
    pub fn open_round(&self) -> Option<Round> {
        self.store.open_round()
    }

    /// Return the open round, opening a new one if none exists.
    pub fn ensure_open_round(&self) -> Result<Round, GameError> {
        match self.store.open_round() {
            Some(round) => Ok(round),
            None => self.open_round_with(self.draw_mountain()),
        }
    }

    /// Time since the round opened.
    pub fn round_age(&self, round: &Round) -> Duration {
        (self.clock.now() - round.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Run the game over the given command stream.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        while let Some(command) = stream.next().await {
            // a rejected command never stops the game
            let _ = self.apply(command);
        }
    }

    /// Apply a single command against the current state.
    pub fn apply(&self, command: Command) -> Result<(), GameError> {
        match command {
            Command::Bet {
                account,
                mountain,
                amount,
            } => {
                let result = self.ensure_open_round().and_then(|round| {
                    self.place_or_amend_bet(
                        &account,
                        BetRequest {
                            round: Some(round.id),
                            mountain,
                            amount,
                        },
                    )
                });
                Self::log_result("bet", Some(&account), &result);
                result?;
            }
            Command::Settle => {
                let result = self.settle_open_round();
                Self::log_result("settle", None, &result);
                result?;
            }
            Command::Balance { account } => {
                let result = self.balance(&account);
                Self::log_result("balance", Some(&account), &result);
                result?;
            }
        }
        Ok(())
    }
}

/// Private API
impl Game {
    fn log_result<T>(command: &str, account: Option<&AccountId>, result: &Result<T, GameError>) {
        match (result, account) {
            (Ok(_), Some(account)) => info!(account = %account, "{command} applied"),
            (Ok(_), None) => info!("{command} applied"),
            (Err(e), Some(account)) => info!(account = %account, reason = %e, "{command} skipped"),
            (Err(e), None) => info!(reason = %e, "{command} skipped"),
        }
    }

    /// Uniform draw over both mountains.
    fn draw_mountain(&self) -> Mountain {
        let index = self.rng.lock().gen_range(0..Mountain::ALL.len());
        Mountain::ALL[index]
    }

    /// Open the next round with a known winner. If another caller opened a
    /// round first, that round is returned instead.
    pub(crate) fn open_round_with(&self, winning: Mountain) -> Result<Round, GameError> {
        match self.store.create_round(winning, self.clock.now()) {
            Ok(round) => {
                info!(round = round.id, "round opened");
                Ok(round)
            }
            Err(StoreError::RoundAlreadyOpen(id)) => {
                self.store.round(id).ok_or(GameError::NotFound(id))
            }
            Err(err) => Err(err.into()),
        }
    }
}
