// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use loyalty_ledger::{
    CustomerId, Engine, EngineConfig, IdempotencyKey, InMemoryDirectory, LedgerError, TenantId,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Loyalty Ledger - Replay loyalty operations from a CSV file
///
/// Reads order, earn and redeem operations from a CSV file and writes the
/// resulting point balances to stdout. Set RUST_LOG to see skipped rows.
#[derive(Parser, Debug)]
#[command(name = "loyalty-ledger")]
#[command(about = "Replays loyalty point operations and prints balances", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,tenant,customer,amount,key,reason
    /// Example: cargo run -- operations.csv > balances.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Give up on a busy customer after this many milliseconds
    #[arg(long, value_name = "MS")]
    lock_timeout_ms: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    if args.lock_timeout_ms.is_some() {
        config.lock_timeout_ms = args.lock_timeout_ms;
    }

    let engine = match Engine::with_config(InMemoryDirectory::new(), config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    match process_operations(&engine, BufReader::new(file)) {
        Ok(applied) => tracing::info!(applied, "operations replayed"),
        Err(e) => {
            eprintln!("Error processing operations: {}", e);
            process::exit(1);
        }
    }

    if let Err(e) = write_balances(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, tenant, customer, amount, key, reason`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    tenant: u64,
    customer: u64,
    amount: i64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    key: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    reason: Option<String>,
}

/// A single operation parsed from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    Order {
        subtotal_cents: i64,
        key: Option<IdempotencyKey>,
    },
    Earn {
        points: i64,
    },
    Redeem {
        points: i64,
        reason: String,
        key: Option<IdempotencyKey>,
    },
}

impl CsvRecord {
    /// Splits the record into its customer and operation.
    ///
    /// Returns `None` for unknown operation types.
    fn into_operation(self) -> Option<(TenantId, CustomerId, Operation)> {
        let key = self
            .key
            .filter(|k| !k.trim().is_empty())
            .map(IdempotencyKey::from);

        let operation = match self.op.to_lowercase().as_str() {
            "order" => Operation::Order {
                subtotal_cents: self.amount,
                key,
            },
            "earn" => Operation::Earn {
                points: self.amount,
            },
            "redeem" => Operation::Redeem {
                points: self.amount,
                reason: self
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "redemption".to_string()),
                key,
            },
            _ => return None,
        };

        Some((TenantId(self.tenant), CustomerId(self.customer), operation))
    }
}

fn apply(
    engine: &Engine,
    tenant: TenantId,
    customer: CustomerId,
    operation: Operation,
) -> Result<(), LedgerError> {
    match operation {
        Operation::Order {
            subtotal_cents,
            key,
        } => engine
            .create_order_and_earn(tenant, customer, subtotal_cents, key)
            .map(|_| ()),
        Operation::Earn { points } => engine.earn(tenant, customer, None, points).map(|_| ()),
        Operation::Redeem {
            points,
            reason,
            key,
        } => engine
            .redeem(tenant, customer, points, &reason, key)
            .map(|_| ()),
    }
}

/// Replays operations from a CSV reader.
///
/// Streams the input, so files of any size work. Customers are registered
/// with their tenant on first sight. Malformed rows and rejected operations
/// are logged and skipped.
///
/// # CSV Format
///
/// Expected columns: `op, tenant, customer, amount, key, reason`
/// - `op`: Operation (order, earn, redeem)
/// - `tenant`, `customer`: Numeric ids
/// - `amount`: Subtotal in cents for `order`, points otherwise
/// - `key`: Optional idempotency key (order and redeem)
/// - `reason`: Optional redemption reason
///
/// # Example
///
/// ```csv
/// op,tenant,customer,amount,key,reason
/// order,1,1,2599,o1,
/// redeem,1,1,10,r1,free coffee
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails. Returns the number of
/// operations applied otherwise.
pub fn process_operations<R: Read>(engine: &Engine, reader: R) -> Result<usize, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let mut applied = 0;
    for (row, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(row, error = %e, "skipping malformed row");
                continue;
            }
        };

        let Some((tenant, customer, operation)) = record.into_operation() else {
            tracing::warn!(row, "skipping unknown operation");
            continue;
        };

        engine.directory().insert(tenant, customer);

        match apply(engine, tenant, customer, operation) {
            Ok(()) => applied += 1,
            Err(e) => tracing::warn!(row, %tenant, %customer, error = %e, "operation rejected"),
        }
    }

    Ok(applied)
}

/// Output row: one balance per customer.
#[derive(Debug, Serialize)]
struct BalanceRow {
    tenant: TenantId,
    customer: CustomerId,
    balance: i64,
}

/// Writes every customer's balance as CSV, ordered by tenant then customer.
///
/// # CSV Format
///
/// Columns: `tenant, customer, balance`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_balances<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    for (tenant, customer) in engine.customers() {
        wtr.serialize(BalanceRow {
            tenant,
            customer,
            balance: engine.balance(tenant, customer),
        })?;
    }

    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn replay(csv: &str) -> Engine {
        let engine = Engine::default();
        process_operations(&engine, Cursor::new(csv.to_string())).unwrap();
        engine
    }

    #[test]
    fn parse_simple_order() {
        let engine = replay("op,tenant,customer,amount,key,reason\norder,1,1,2599,,\n");
        assert_eq!(engine.balance(TenantId(1), CustomerId(1)), 25);
    }

    #[test]
    fn parse_order_and_redeem() {
        let engine = replay(
            "op,tenant,customer,amount,key,reason\n\
             order,1,1,5000,o1,\n\
             redeem,1,1,20,r1,free coffee\n",
        );
        assert_eq!(engine.balance(TenantId(1), CustomerId(1)), 30);
    }

    #[test]
    fn duplicate_keys_apply_once() {
        let engine = replay(
            "op,tenant,customer,amount,key,reason\n\
             order,1,1,5000,o1,\n\
             order,1,1,5000,o1,\n\
             redeem,1,1,20,r1,gift\n\
             redeem,1,1,20,r1,gift\n",
        );
        assert_eq!(engine.balance(TenantId(1), CustomerId(1)), 30);
        assert_eq!(engine.store().order_count(), 1);
    }

    #[test]
    fn overdraft_row_is_skipped() {
        let engine = replay(
            "op,tenant,customer,amount,key,reason\n\
             earn,1,1,10,,\n\
             redeem,1,1,30,,\n",
        );
        assert_eq!(engine.balance(TenantId(1), CustomerId(1)), 10);
    }

    #[test]
    fn parse_with_whitespace_and_missing_columns() {
        let engine = replay("op,tenant,customer,amount,key,reason\n order , 1 , 2 , 300 \n");
        assert_eq!(engine.balance(TenantId(1), CustomerId(2)), 3);
    }

    #[test]
    fn skip_malformed_rows() {
        let engine = replay(
            "op,tenant,customer,amount,key,reason\n\
             earn,1,1,10,,\n\
             invalid,row,data,here,,\n\
             transfer,1,1,10,,\n\
             earn,1,2,5,,\n",
        );
        assert_eq!(engine.customers().len(), 2);
    }

    #[test]
    fn customer_cannot_cross_tenants() {
        let engine = replay(
            "op,tenant,customer,amount,key,reason\n\
             earn,1,1,10,,\n\
             earn,2,1,10,,\n",
        );
        assert_eq!(engine.balance(TenantId(1), CustomerId(1)), 10);
        assert_eq!(engine.balance(TenantId(2), CustomerId(1)), 0);
    }

    #[test]
    fn write_balances_sorted() {
        let engine = replay(
            "op,tenant,customer,amount,key,reason\n\
             earn,2,3,7,,\n\
             earn,1,2,5,,\n\
             earn,1,1,4,,\n",
        );

        let mut output = Vec::new();
        write_balances(&engine, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(output, "tenant,customer,balance\n1,1,4\n1,2,5\n2,3,7\n");
    }
}
