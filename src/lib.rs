pub mod amount;
pub mod clock;
pub mod config;
pub mod csv;
pub mod game;
pub mod ledger;
pub mod model;
pub mod scheduler;
pub mod store;

pub use amount::Crystals;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GameConfig};
pub use game::{BetRequest, Conflict, Game, GameError, SettleOutcome, ValidationError};
pub use model::{AccountId, Bet, Command, Mountain, Resolution, Round, RoundId, RoundStatus};
pub use scheduler::{Scheduler, SchedulerError, Tick};
