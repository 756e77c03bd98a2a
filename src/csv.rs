use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::{AccountId, Command, Crystals};

/// Errors that can occur when reading or writing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open csv file: {0}")]
    Open(#[source] csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{command}'")]
    UnrecognizedType { line: usize, command: String },

    #[error("line {line}: {command} missing account")]
    MissingAccount { line: usize, command: String },

    #[error("failed to write csv output: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush csv output: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    account: Option<String>,
    mountain: Option<String>,
    amount: Option<i64>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    account: &'a str,
    balance: u64,
}

/// Read commands from a csv file with columns `type,account,mountain,amount`
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let account = |command: &str| {
                row.account
                    .clone()
                    .filter(|account| !account.is_empty())
                    .map(AccountId::from)
                    .ok_or_else(|| CsvError::MissingAccount {
                        line,
                        command: command.to_string(),
                    })
            };
            match row.r#type.as_str() {
                "bet" => Ok(Command::Bet {
                    account: account("bet")?,
                    mountain: row.mountain.clone().filter(|m| !m.is_empty()),
                    amount: row.amount,
                }),
                "balance" => Ok(Command::Balance {
                    account: account("balance")?,
                }),
                "settle" => Ok(Command::Settle),
                other => Err(CsvError::UnrecognizedType {
                    line,
                    command: other.to_string(),
                }),
            }
        }))
}

/// Write accounts and their balances in csv format
pub fn write_accounts(
    writer: impl io::Write,
    accounts: impl IntoIterator<Item = (AccountId, Crystals)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (account, balance) in accounts {
        writer.serialize(OutputRow {
            account: account.as_str(),
            balance: balance.value(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
