use std::env;
use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use crystal_rounds::csv::{read_commands, write_accounts};
use crystal_rounds::{Game, GameConfig, Scheduler};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: crystal-rounds <commands.csv> | --serve";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let config = match GameConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    let arg = env::args().nth(1).expect(USAGE);
    if arg == "--serve" {
        return serve(config).await;
    }

    if !arg.ends_with(".csv") {
        warn!(path = %arg, "input file seems to not be a csv file");
    }
    replay(config, arg).await
}

/// Keep rounds cycling until the scheduler gives up.
async fn serve(config: GameConfig) -> ExitCode {
    let game = Arc::new(Game::new(config));
    match game.ensure_open_round() {
        Ok(round) => info!(round = round.id, "serving"),
        Err(e) => warn!(reason = %e, "no initial round, the scheduler will retry"),
    }

    match Scheduler::new(game).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Apply every command of the file, then print the resulting balances.
async fn replay(config: GameConfig, path: String) -> ExitCode {
    let commands = match read_commands(path) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let game = Game::new(config);
    let (command_sender, command_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if command_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    game.run(ReceiverStream::new(command_receiver)).await;

    match write_accounts(io::stdout().lock(), game.accounts()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
