use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::Crystals;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("{var}: {value} exceeds the largest balance of {max}")]
    OutOfRange {
        var: &'static str,
        value: u64,
        max: Crystals,
    },
}

/// Tunables consumed by the round engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameConfig {
    /// How long a round stays open before the scheduler settles it.
    pub round_duration: Duration,
    /// Crystals granted to an account the first time it is touched.
    pub starting_balance: Crystals,
    /// Scheduler tick interval.
    pub poll_interval: Duration,
    /// Consecutive faulted ticks after which the scheduler gives up.
    pub max_consecutive_faults: u32,
    /// Fixed seed for the winning-mountain draw; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            round_duration: Duration::from_secs(60),
            starting_balance: Crystals::new(100),
            poll_interval: Duration::from_secs(1),
            max_consecutive_faults: 10,
            seed: None,
        }
    }
}

impl GameConfig {
    /// Read `ROUND_SECONDS`, `STARTING_BALANCE`, `POLL_INTERVAL_MS`,
    /// `MAX_SCHEDULER_FAULTS` and `GAME_SEED`, defaulting whatever is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let round_duration = parse(&lookup, "ROUND_SECONDS")?
            .map(|secs: u64| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.round_duration);
        let starting_balance = match parse(&lookup, "STARTING_BALANCE")? {
            Some(value) if value > Crystals::MAX.value() => {
                return Err(ConfigError::OutOfRange {
                    var: "STARTING_BALANCE",
                    value,
                    max: Crystals::MAX,
                });
            }
            Some(value) => Crystals::new(value),
            None => defaults.starting_balance,
        };
        let poll_interval = parse(&lookup, "POLL_INTERVAL_MS")?
            .map(|ms: u64| Duration::from_millis(ms.max(1)))
            .unwrap_or(defaults.poll_interval);
        let max_consecutive_faults = parse(&lookup, "MAX_SCHEDULER_FAULTS")?
            .unwrap_or(defaults.max_consecutive_faults);
        let seed = parse(&lookup, "GAME_SEED")?;

        Ok(Self {
            round_duration,
            starting_balance,
            poll_interval,
            max_consecutive_faults,
            seed,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
