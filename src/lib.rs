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

//! # Loyalty Ledger
//!
//! This library provides a points ledger for retail loyalty programs:
//! customers earn points from orders and redeem them, with exactly-once
//! effects under concurrent and retried requests.
//!
//! ## Core Components
//!
//! - [`Engine`]: Transaction coordinator exposing earn, redeem and order creation
//! - [`LedgerStore`]: Append-only ledger, balances and orders
//! - [`KeySerializer`]: Per-`(tenant, customer)` mutual exclusion
//! - [`IdempotencyRegistry`]: Replay of previously committed results
//! - [`LedgerError`]: Error types for ledger operations
//!
//! ## Example
//!
//! ```
//! use loyalty_ledger::{Engine, IdempotencyKey, InMemoryDirectory, LedgerError, TenantId};
//!
//! let engine = Engine::new(InMemoryDirectory::new());
//! let tenant = TenantId(1);
//! let customer = engine.directory().register(tenant);
//!
//! // A $25.99 order earns 25 points.
//! let order = engine.create_order_and_earn(tenant, customer, 2599, None).unwrap();
//! assert_eq!(order.points_earned, 25);
//!
//! // Retrying a keyed redemption debits once.
//! let key = IdempotencyKey::new("r1");
//! let first = engine.redeem(tenant, customer, 25, "free coffee", Some(key.clone())).unwrap();
//! let retry = engine.redeem(tenant, customer, 25, "free coffee", Some(key)).unwrap();
//! assert!(retry.replay);
//! assert_eq!(first.ledger_entry, retry.ledger_entry);
//! assert_eq!(engine.balance(tenant, customer), 0);
//!
//! // Overdrafts are refused.
//! let err = engine.redeem(tenant, customer, 1, "free coffee", None).unwrap_err();
//! assert_eq!(err, LedgerError::InsufficientBalance { balance: 0, requested: 1 });
//! ```
//!
//! ## Thread Safety
//!
//! The engine serializes mutations per `(tenant, customer)` and lets different
//! customers proceed in parallel. Share it across threads behind an `Arc`.

mod base;
pub mod config;
pub mod directory;
mod engine;
mod entry;
pub mod error;
pub mod idempotency;
mod serializer;
mod store;
pub mod webhook;

pub use base::{CustomerId, EntryId, IdempotencyKey, OrderId, PosCustomerId, TenantId};
pub use config::EngineConfig;
pub use directory::{CustomerDirectory, InMemoryDirectory, PosCustomerResolver};
pub use engine::{Engine, OrderReceipt, RedeemReceipt};
pub use entry::{
    CENTS_PER_POINT, EARN_FROM_ORDER, LedgerEntry, NewEntry, NewOrder, Order, points_for_subtotal,
};
pub use error::{LedgerError, Result};
pub use idempotency::{Check, IdempotencyRegistry, OrderScope, RedeemScope, Registration};
pub use serializer::{KeySerializer, Lease};
pub use store::{LedgerPage, LedgerStore, LedgerTxn, PreparedTxn};
pub use webhook::{PosOrderEvent, ingest_pos_order};
