//! Timer-driven round lifecycle.
//!
//! Every tick either opens a round, waits for the open one to age, or
//! settles it. Settlement never runs concurrently with itself: a tick that
//! finds another one still in flight does nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::game::{Game, GameError, SettleOutcome};
use crate::model::RoundId;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler halted after {faults} consecutive faults, last: {last}")]
    Halted { faults: u32, last: GameError },
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// No round was open; this one was opened.
    Opened(RoundId),
    /// The open round has not run its course yet.
    Waiting { round: RoundId, remaining: Duration },
    /// The round was settled and `next` opened.
    Settled { round: RoundId, next: RoundId },
    /// Another tick is still settling.
    Busy,
}

pub struct Scheduler {
    game: Arc<Game>,
    in_flight: AtomicBool,
}

/// Holds the single-flight flag. Set when a tick starts, cleared when the
/// tick ends, whether it completed or faulted.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Public API
impl Scheduler {
    pub fn new(game: Arc<Game>) -> Self {
        Self {
            game,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn game(&self) -> &Arc<Game> {
        &self.game
    }

    /// Run one tick.
    pub fn tick(&self) -> Result<Tick, GameError> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            debug!("tick skipped, settlement in flight");
            return Ok(Tick::Busy);
        };

        let Some(round) = self.game.open_round() else {
            let round = self.game.ensure_open_round()?;
            return Ok(Tick::Opened(round.id));
        };

        let age = self.game.round_age(&round);
        let duration = self.game.config().round_duration;
        if age < duration {
            return Ok(Tick::Waiting {
                round: round.id,
                remaining: duration - age,
            });
        }

        match self.game.settle_round(round.id)? {
            SettleOutcome::Settled(settlement) => Ok(Tick::Settled {
                round: settlement.round.id,
                next: settlement.next.id,
            }),
            SettleOutcome::Opened(next) => Ok(Tick::Opened(next.id)),
            // settled elsewhere in the meantime; the next tick picks up the new round
            SettleOutcome::AlreadySettled(id) => Ok(Tick::Waiting {
                round: id,
                remaining: Duration::ZERO,
            }),
        }
    }

    /// Tick at the configured interval until too many ticks in a row fault.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        let config = self.game.config();
        let mut interval = time::interval(config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut faults = 0;

        loop {
            interval.tick().await;
            match self.tick() {
                Ok(tick) => {
                    if faults > 0 {
                        info!(faults, "scheduler recovered");
                    }
                    faults = 0;
                    match tick {
                        Tick::Opened(round) => info!(round, "tick opened round"),
                        Tick::Settled { round, next } => info!(round, next, "tick settled round"),
                        Tick::Waiting { .. } | Tick::Busy => {}
                    }
                }
                Err(e) => {
                    faults += 1;
                    warn!(faults, reason = %e, "tick faulted, retrying next tick");
                    if faults >= config.max_consecutive_faults {
                        error!(faults, reason = %e, "scheduler halting");
                        return Err(SchedulerError::Halted { faults, last: e });
                    }
                }
            }
        }
    }
}
