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

//! Transaction coordinator.
//!
//! The [`Engine`] turns earn and redeem requests into exactly-once ledger
//! mutations. Each mutating operation runs as one transaction:
//!
//! ```text
//! BEGIN ─► LOCK ─► IDEMPOTENCY_CHECK ─► VALIDATE ─► APPEND ─► COMMIT
//!            │                                                   │
//!            └──────────────► ROLLBACK (any error) ◄─────────────┘
//! ```
//!
//! Input validation happens before `LOCK`. From `LOCK` on, the transaction
//! owns the customer's lease; any error drops the transaction, which discards
//! staged writes and releases the lease exactly once.
//!
//! # Thread Safety
//!
//! All operations take `&self`. Operations on the same `(tenant, customer)`
//! are serialized by the lease; operations on different pairs run in parallel.
//! Keyed order creation also locks the tenant-wide order key after the lease,
//! until the order is published, so a replay never runs ahead of its commit.

use crate::base::{CustomerId, EntryId, IdempotencyKey, OrderId, TenantId};
use crate::config::EngineConfig;
use crate::directory::{CustomerDirectory, InMemoryDirectory};
use crate::entry::{LedgerEntry, NewEntry, NewOrder, Order, points_for_subtotal};
use crate::error::{LedgerError, Result};
use crate::idempotency::{Check, IdempotencyRegistry, OrderScope, RedeemScope, Registration};
use crate::serializer::KeySerializer;
use crate::store::{LedgerPage, LedgerStore, LedgerTxn};
use serde::Serialize;

/// Result of [`Engine::create_order_and_earn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderReceipt {
    pub order: Order,
    /// Points credited for this order, not the running balance.
    pub points_earned: i64,
    /// `true` if the order already existed for the idempotency key.
    pub replay: bool,
}

/// Result of [`Engine::redeem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeemReceipt {
    pub redeemed: i64,
    /// Balance after the redemption. On replay, the current balance, which
    /// already reflects the original redemption.
    pub balance: i64,
    pub ledger_entry: LedgerEntry,
    pub replay: bool,
}

/// Idempotent, per-customer serialized points ledger.
///
/// # Invariants
///
/// - A committed balance is never negative.
/// - A key is honoured once per scope: an order key once per tenant, a
///   redemption key once per `(tenant, customer)`.
/// - Every order has exactly one earn entry.
/// - Committed entries and orders are never changed.
pub struct Engine<D = InMemoryDirectory> {
    store: LedgerStore,
    serializer: KeySerializer,
    order_locks: KeySerializer<OrderScope>,
    order_keys: IdempotencyRegistry<OrderScope, OrderReceipt>,
    redeem_keys: IdempotencyRegistry<RedeemScope, LedgerEntry>,
    directory: D,
    config: EngineConfig,
}

impl<D: CustomerDirectory> Engine<D> {
    /// Creates an engine with default configuration.
    pub fn new(directory: D) -> Self {
        Self::build(directory, EngineConfig::default())
    }

    /// Creates an engine with the given configuration.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if the configuration is unusable.
    pub fn with_config(directory: D, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(directory, config))
    }

    fn build(directory: D, config: EngineConfig) -> Self {
        Engine {
            store: LedgerStore::new(),
            serializer: KeySerializer::with_timeout(config.lock_timeout()),
            order_locks: KeySerializer::keyed(config.lock_timeout()),
            order_keys: IdempotencyRegistry::new(),
            redeem_keys: IdempotencyRegistry::new(),
            directory,
            config,
        }
    }

    /// Credits `points` to a customer, optionally linked to an existing order.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - `points` is not positive, or the order
    ///   already carries its earn entry.
    /// - [`LedgerError::CustomerNotFound`] - customer is not the tenant's.
    /// - [`LedgerError::OrderNotFound`] - order is unknown or not the customer's.
    #[tracing::instrument(skip_all, fields(tenant = %tenant, customer = %customer, points = points))]
    pub fn earn(
        &self,
        tenant: TenantId,
        customer: CustomerId,
        order_id: Option<OrderId>,
        points: i64,
    ) -> Result<LedgerEntry> {
        validate_points(points)?;

        let mut txn = self.begin(tenant, customer)?;
        self.ensure_owned(tenant, customer)?;
        txn.stage_earn(order_id, points)?;

        let (_, mut entries) = txn.prepare().commit();
        entries
            .pop()
            .ok_or_else(|| LedgerError::Internal("earn committed no entry".to_string()))
    }

    /// Debits `points` from a customer's balance.
    ///
    /// With an idempotency key, a repeated call returns the original entry
    /// and `replay: true` without debiting again.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - bad `points`, `reason` or key.
    /// - [`LedgerError::CustomerNotFound`] - customer is not the tenant's.
    /// - [`LedgerError::InsufficientBalance`] - balance is below `points`.
    #[tracing::instrument(skip_all, fields(tenant = %tenant, customer = %customer, points = points))]
    pub fn redeem(
        &self,
        tenant: TenantId,
        customer: CustomerId,
        points: i64,
        reason: &str,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<RedeemReceipt> {
        validate_points(points)?;
        self.validate_reason(reason)?;
        if let Some(key) = &idempotency_key {
            self.validate_key(key)?;
        }

        let mut txn = self.begin(tenant, customer)?;
        self.ensure_owned(tenant, customer)?;

        let scope = idempotency_key.map(|key| RedeemScope::new(tenant, customer, key));
        if let Some(scope) = &scope
            && let Check::Replay(entry) = self.redeem_keys.check(scope)
        {
            let balance = txn.balance();
            tracing::debug!(entry = %entry.id, "redemption replayed");
            return Ok(RedeemReceipt {
                redeemed: entry.points(),
                balance,
                ledger_entry: entry,
                replay: true,
            });
        }

        let balance = txn.balance();
        if balance < points {
            tracing::debug!(balance, "redemption exceeds balance");
            return Err(LedgerError::InsufficientBalance {
                balance,
                requested: points,
            });
        }

        txn.stage_entry(NewEntry {
            tenant_id: tenant,
            customer_id: customer,
            order_id: None,
            points_delta: -points,
            reason: reason.to_string(),
            idempotency_key: scope.as_ref().map(|s| s.key.clone()),
        })?;

        let prepared = txn.prepare();
        let entry = prepared
            .entries()
            .first()
            .cloned()
            .ok_or_else(|| LedgerError::Internal("redemption staged no entry".to_string()))?;

        if let Some(scope) = scope
            && let Registration::Conflict(winner) = self.redeem_keys.record(scope, entry.clone())
        {
            // Still under the lease, nothing of ours published.
            let balance = self.store.balance(tenant, customer);
            prepared.rollback();
            tracing::info!(entry = %winner.id, "redemption key registered concurrently, replaying");
            return Ok(RedeemReceipt {
                redeemed: winner.points(),
                balance,
                ledger_entry: winner,
                replay: true,
            });
        }

        prepared.commit();
        Ok(RedeemReceipt {
            redeemed: points,
            balance: balance - points,
            ledger_entry: entry,
            replay: false,
        })
    }

    /// Records an order and credits `floor(subtotal_cents / 100)` points for it.
    ///
    /// With an idempotency key, a repeated call (for any customer of the
    /// tenant) returns the original order and its points with `replay: true`.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - `subtotal_cents` not positive or bad key.
    /// - [`LedgerError::CustomerNotFound`] - customer is not the tenant's.
    #[tracing::instrument(skip_all, fields(tenant = %tenant, customer = %customer, subtotal_cents = subtotal_cents))]
    pub fn create_order_and_earn(
        &self,
        tenant: TenantId,
        customer: CustomerId,
        subtotal_cents: i64,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<OrderReceipt> {
        if subtotal_cents <= 0 {
            return Err(LedgerError::validation("subtotal_cents must be positive"));
        }
        if let Some(key) = &idempotency_key {
            self.validate_key(key)?;
        }

        let mut txn = self.begin(tenant, customer)?;

        let scope = idempotency_key.map(|key| OrderScope::new(tenant, key));
        // Order keys span customers, so the customer lease does not cover
        // them. Held past commit: a request with the same key sees either
        // nothing or the published order.
        let _key_lock = match &scope {
            Some(scope) => Some(
                self.order_locks
                    .lock(scope.clone())
                    .ok_or(LedgerError::LockTimeout { tenant, customer })?,
            ),
            None => None,
        };

        if let Some(scope) = &scope
            && let Check::Replay(receipt) = self.order_keys.check(scope)
        {
            tracing::debug!(order = %receipt.order.id, "order replayed");
            return Ok(OrderReceipt {
                replay: true,
                ..receipt
            });
        }

        self.ensure_owned(tenant, customer)?;

        let points = points_for_subtotal(subtotal_cents);
        let order_id = txn.stage_order(NewOrder {
            tenant_id: tenant,
            customer_id: customer,
            subtotal_cents,
            idempotency_key: scope.as_ref().map(|s| s.key.clone()),
        })?;
        txn.stage_earn(Some(order_id), points)?;

        let prepared = txn.prepare();
        let order = prepared
            .order()
            .cloned()
            .ok_or_else(|| LedgerError::Internal("order vanished from transaction".to_string()))?;
        let receipt = OrderReceipt {
            order,
            points_earned: points,
            replay: false,
        };

        if let Some(scope) = scope
            && let Registration::Conflict(winner) = self.order_keys.record(scope, receipt.clone())
        {
            prepared.rollback();
            tracing::info!(
                order = %winner.order.id,
                "order key registered concurrently, replaying"
            );
            return Ok(OrderReceipt {
                replay: true,
                ..winner
            });
        }

        prepared.commit();
        Ok(receipt)
    }

    /// Returns a page of the customer's ledger, newest first.
    ///
    /// `limit` defaults to the configured page size. Pass the previous page's
    /// `next_before_id` as `before` to continue.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] - `limit` is zero or above the maximum.
    /// - [`LedgerError::CustomerNotFound`] - customer is not the tenant's.
    pub fn list_ledger(
        &self,
        tenant: TenantId,
        customer: CustomerId,
        limit: Option<usize>,
        before: Option<EntryId>,
    ) -> Result<LedgerPage> {
        let limit = limit.unwrap_or(self.config.default_page_limit);
        if limit == 0 || limit > self.config.max_page_limit {
            return Err(LedgerError::Validation(format!(
                "limit must be between 1 and {}",
                self.config.max_page_limit
            )));
        }
        self.ensure_owned(tenant, customer)?;

        Ok(self.store.list(tenant, customer, limit, before))
    }

    /// Current balance, read without the lease.
    ///
    /// May miss a transaction committing concurrently; never use it to gate
    /// a write.
    pub fn balance(&self, tenant: TenantId, customer: CustomerId) -> i64 {
        self.store.balance(tenant, customer)
    }

    /// Looks up one of the tenant's orders.
    pub fn order(&self, tenant: TenantId, order_id: OrderId) -> Option<Order> {
        self.store.order(tenant, order_id)
    }

    /// All `(tenant, customer)` pairs with ledger activity.
    pub fn customers(&self) -> Vec<(TenantId, CustomerId)> {
        self.store.customers()
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn begin(&self, tenant: TenantId, customer: CustomerId) -> Result<LedgerTxn<'_>> {
        let lease = self.serializer.acquire(tenant, customer)?;
        Ok(self.store.begin(lease))
    }

    fn ensure_owned(&self, tenant: TenantId, customer: CustomerId) -> Result<()> {
        if self.directory.owns_customer(tenant, customer)? {
            Ok(())
        } else {
            Err(LedgerError::CustomerNotFound { tenant, customer })
        }
    }

    fn validate_reason(&self, reason: &str) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(LedgerError::validation("reason must not be empty"));
        }
        if reason.chars().count() > self.config.max_reason_len {
            return Err(LedgerError::Validation(format!(
                "reason longer than {} characters",
                self.config.max_reason_len
            )));
        }
        Ok(())
    }

    fn validate_key(&self, key: &IdempotencyKey) -> Result<()> {
        if key.as_str().trim().is_empty() {
            return Err(LedgerError::validation("idempotency key must not be empty"));
        }
        if key.as_str().chars().count() > self.config.max_idempotency_key_len {
            return Err(LedgerError::Validation(format!(
                "idempotency key longer than {} characters",
                self.config.max_idempotency_key_len
            )));
        }
        Ok(())
    }
}

impl Default for Engine<InMemoryDirectory> {
    fn default() -> Self {
        Self::new(InMemoryDirectory::new())
    }
}

fn validate_points(points: i64) -> Result<()> {
    if points <= 0 {
        return Err(LedgerError::validation("points must be positive"));
    }
    Ok(())
}
