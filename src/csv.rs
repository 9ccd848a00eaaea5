use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::balance::Balance;
use crate::model::{AccountId, BankAccountId, IntentId, LedgerCommand};
use crate::Amount;

/// Errors that can occur when parsing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized transaction type '{tx_type}'")]
    UnrecognizedType { line: usize, tx_type: String },

    #[error("line {line}: {tx_type} missing amount")]
    MissingAmount { line: usize, tx_type: String },

    #[error("line {line}: {tx_type} missing counterparty")]
    MissingCounterparty { line: usize, tx_type: String },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    tx: IntentId,
    account: AccountId,
    to: Option<u32>,
    amount: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    account: AccountId,
    available: String,
    blocked: String,
    future: String,
    frozen: bool,
}

/// Read ledger commands from a csv file
pub fn read_commands(
    path: impl AsRef<Path>,
) -> impl Iterator<Item = Result<LedgerCommand, CsvError>> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .expect("failed to open csv file");

    reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;

            let amount = |tx_type: &str| {
                row.amount
                    .map(Amount::from_float)
                    .ok_or_else(|| CsvError::MissingAmount {
                        line,
                        tx_type: tx_type.to_string(),
                    })
            };
            let counterparty = |tx_type: &str| {
                row.to.ok_or_else(|| CsvError::MissingCounterparty {
                    line,
                    tx_type: tx_type.to_string(),
                })
            };

            match row.r#type.as_str() {
                "deposit" => Ok(LedgerCommand::Deposit {
                    tx: row.tx,
                    account: row.account,
                    amount: amount("deposit")?,
                }),
                "transfer" => Ok(LedgerCommand::Transfer {
                    tx: row.tx,
                    from: row.account,
                    to: counterparty("transfer")? as AccountId,
                    amount: amount("transfer")?,
                }),
                "withdrawal" => Ok(LedgerCommand::Withdrawal {
                    tx: row.tx,
                    account: row.account,
                    destination: counterparty("withdrawal")? as BankAccountId,
                    amount: amount("withdrawal")?,
                }),
                other => Err(CsvError::UnrecognizedType {
                    line,
                    tx_type: other.to_string(),
                }),
            }
        })
}

/// Write the account statement in csv format
pub fn write_statement<W: io::Write>(
    writer: W,
    accounts: impl IntoIterator<Item = (AccountId, Balance, bool)>,
) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);

    for (account, balance, frozen) in accounts {
        let row = OutputRow {
            account,
            available: balance.available.to_string(),
            blocked: balance.blocked.to_string(),
            future: balance.future.to_string(),
            frozen,
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn read_deposit() {
        let file = write_csv("type,tx,account,to,amount\ndeposit,1,10,,10.50\n");
        let results: Vec<_> = read_commands(file.path()).collect();
        assert_eq!(results.len(), 1);

        let command = results.into_iter().next().unwrap().unwrap();
        match command {
            LedgerCommand::Deposit { tx, account, amount } => {
                assert_eq!(tx, 1);
                assert_eq!(account, 10);
                assert_eq!(amount, Amount::from_minor(1050));
            }
            _ => panic!("expected deposit"),
        }
    }

    #[test]
    fn read_transfer() {
        let file = write_csv("type,tx,account,to,amount\ntransfer,2,10,20,5.25\n");
        let results: Vec<_> = read_commands(file.path()).collect();
        assert_eq!(results.len(), 1);

        let command = results.into_iter().next().unwrap().unwrap();
        match command {
            LedgerCommand::Transfer { tx, from, to, amount } => {
                assert_eq!(tx, 2);
                assert_eq!(from, 10);
                assert_eq!(to, 20);
                assert_eq!(amount, Amount::from_minor(525));
            }
            _ => panic!("expected transfer"),
        }
    }

    #[test]
    fn read_withdrawal() {
        let file = write_csv("type,tx,account,to,amount\nwithdrawal,3,10,7,50.00\n");
        let results: Vec<_> = read_commands(file.path()).collect();
        assert_eq!(results.len(), 1);

        let command = results.into_iter().next().unwrap().unwrap();
        match command {
            LedgerCommand::Withdrawal {
                tx,
                account,
                destination,
                amount,
            } => {
                assert_eq!(tx, 3);
                assert_eq!(account, 10);
                assert_eq!(destination, 7);
                assert_eq!(amount, Amount::from_minor(5000));
            }
            _ => panic!("expected withdrawal"),
        }
    }

    #[test]
    fn read_with_whitespace() {
        let file = write_csv("type, tx, account, to, amount\ndeposit, 1, 10, , 10.00\n");
        let results: Vec<_> = read_commands(file.path()).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn read_returns_error_for_unknown_type() {
        let file = write_csv("type,tx,account,to,amount\nbogus,1,10,,10.00\n");
        let results: Vec<_> = read_commands(file.path()).collect();
        assert_eq!(results.len(), 1);
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::UnrecognizedType { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_amount() {
        let file = write_csv("type,tx,account,to,amount\ndeposit,1,10,,\n");
        let results: Vec<_> = read_commands(file.path()).collect();
        assert_eq!(results.len(), 1);
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::MissingAmount { line: 2, .. }));
    }

    #[test]
    fn read_returns_error_for_missing_counterparty() {
        let file = write_csv("type,tx,account,to,amount\ntransfer,1,10,,10.00\n");
        let results: Vec<_> = read_commands(file.path()).collect();
        assert_eq!(results.len(), 1);
        let err = results[0].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::MissingCounterparty { line: 2, .. }));
    }

    #[test]
    fn write_statement_formats_balances() {
        let balance = Balance {
            available: Amount::from_minor(7500),
            blocked: Amount::from_minor(100),
            future: Amount::from_minor(-50),
        };

        let mut out = Vec::new();
        write_statement(&mut out, vec![(1, balance, false)]).unwrap();

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "account,available,blocked,future,frozen");
        assert_eq!(lines.next().unwrap(), "1,75.00,1.00,-0.50,false");
    }
}
