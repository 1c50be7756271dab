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

//! Append-only points ledger and order table.
//!
//! Entries are partitioned by `(tenant, customer)`. Within a partition they
//! are kept in ascending [`EntryId`] order: ids are drawn and entries
//! published while the partition's [`Lease`] is held, so no other writer can
//! interleave.
//!
//! Writes only happen through a [`LedgerTxn`], which owns the lease:
//!
//! ```text
//! begin(lease) ──stage_*──► LedgerTxn ──prepare──► PreparedTxn ──commit──► visible
//!                               │                      │
//!                               └──────rollback────────┘  (drop = rollback)
//! ```
//!
//! Staged work is invisible to every reader until `commit`. Prepared values
//! already carry their final ids and timestamps, so a caller can register
//! them (for instance as an idempotency replay) before publishing.

use crate::base::{CustomerId, EntryId, OrderId, TenantId};
use crate::entry::{EARN_FROM_ORDER, LedgerEntry, NewEntry, NewOrder, Order};
use crate::error::{LedgerError, Result};
use crate::serializer::Lease;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

type PartitionKey = (TenantId, CustomerId);

/// One customer's slice of the ledger.
#[derive(Debug, Default)]
struct Partition {
    /// Ascending by id.
    entries: Vec<LedgerEntry>,
    /// Running sum of `entries[..].points_delta`.
    balance: i64,
}

impl Partition {
    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= 0,
            "Invariant violated: balance went negative: {}",
            self.balance
        );
        debug_assert_eq!(
            self.balance,
            self.entries.iter().map(|e| e.points_delta).sum::<i64>(),
            "Invariant violated: cached balance diverged from ledger"
        );
        debug_assert!(
            self.entries.windows(2).all(|w| w[0].id < w[1].id),
            "Invariant violated: entries out of id order"
        );
    }

    fn append(&mut self, entry: LedgerEntry) {
        self.balance += entry.points_delta;
        self.entries.push(entry);
    }
}

#[derive(Debug, Clone)]
struct StoredOrder {
    order: Order,
    /// Whether an earn entry referencing this order has been committed.
    credited: bool,
}

/// One page of a customer's ledger, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerPage {
    /// Strictly decreasing by id.
    pub entries: Vec<LedgerEntry>,
    /// Cursor for the next (older) page: the smallest id returned, or `None`
    /// when no older entries exist.
    pub next_before_id: Option<EntryId>,
}

/// The single source of truth for balances and orders.
#[derive(Debug)]
pub struct LedgerStore {
    partitions: DashMap<PartitionKey, Partition>,
    orders: DashMap<OrderId, StoredOrder>,
    next_entry_id: AtomicU64,
    next_order_id: AtomicU64,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            orders: DashMap::new(),
            next_entry_id: AtomicU64::new(1),
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Opens a transaction on the partition covered by `lease`.
    pub fn begin<'a>(&'a self, lease: Lease<'a>) -> LedgerTxn<'a> {
        LedgerTxn {
            store: self,
            lease,
            order: None,
            entries: Vec::new(),
        }
    }

    /// Sum of all committed deltas for the pair; `0` for unknown customers.
    ///
    /// Without the pair's lease this is a snapshot that may be stale by the
    /// time it is returned. Only read it under the lease when it gates a write.
    pub fn balance(&self, tenant: TenantId, customer: CustomerId) -> i64 {
        self.partitions
            .get(&(tenant, customer))
            .map(|p| p.balance)
            .unwrap_or(0)
    }

    /// Returns up to `limit` entries older than `before`, newest first.
    ///
    /// Keyset pagination on id: concurrent appends only add ids above any
    /// cursor already handed out, so pages neither overlap nor skip.
    pub fn list(
        &self,
        tenant: TenantId,
        customer: CustomerId,
        limit: usize,
        before: Option<EntryId>,
    ) -> LedgerPage {
        let Some(partition) = self.partitions.get(&(tenant, customer)) else {
            return LedgerPage {
                entries: Vec::new(),
                next_before_id: None,
            };
        };

        let entries = &partition.entries;
        let end = match before {
            Some(cursor) => entries.partition_point(|e| e.id < cursor),
            None => entries.len(),
        };
        let start = end.saturating_sub(limit);

        LedgerPage {
            entries: entries[start..end].iter().rev().cloned().collect(),
            next_before_id: (start > 0).then(|| entries[start].id),
        }
    }

    /// Looks up an order, hiding orders of other tenants.
    pub fn order(&self, tenant: TenantId, order_id: OrderId) -> Option<Order> {
        self.orders
            .get(&order_id)
            .filter(|stored| stored.order.tenant_id == tenant)
            .map(|stored| stored.order.clone())
    }

    /// Returns whether the order already has a committed earn entry.
    pub fn is_credited(&self, order_id: OrderId) -> bool {
        self.orders
            .get(&order_id)
            .is_some_and(|stored| stored.credited)
    }

    /// All `(tenant, customer)` pairs with at least one committed entry, sorted.
    pub fn customers(&self) -> Vec<(TenantId, CustomerId)> {
        let mut keys: Vec<_> = self.partitions.iter().map(|p| *p.key()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn entry_count(&self) -> usize {
        self.partitions.iter().map(|p| p.entries.len()).sum()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    fn publish(&self, key: PartitionKey, order: Option<Order>, entries: &[LedgerEntry]) {
        if let Some(order) = order {
            let credited = entries.iter().any(|e| e.order_id == Some(order.id));
            self.orders.insert(order.id, StoredOrder { order, credited });
        }

        for entry in entries {
            if let Some(order_id) = entry.order_id
                && let Some(mut stored) = self.orders.get_mut(&order_id)
            {
                stored.credited = true;
            }
        }

        if !entries.is_empty() {
            let mut partition = self.partitions.entry(key).or_default();
            for entry in entries {
                partition.append(entry.clone());
            }
            partition.assert_invariants();
        }
    }
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Open transaction: holds the lease and any staged writes.
///
/// Dropping it without [`prepare`](Self::prepare) rolls back.
#[derive(Debug)]
pub struct LedgerTxn<'a> {
    store: &'a LedgerStore,
    lease: Lease<'a>,
    order: Option<(OrderId, NewOrder)>,
    entries: Vec<NewEntry>,
}

impl<'a> LedgerTxn<'a> {
    pub fn tenant(&self) -> TenantId {
        self.lease.tenant()
    }

    pub fn customer(&self) -> CustomerId {
        self.lease.customer()
    }

    /// Balance including writes staged in this transaction.
    ///
    /// Consistent until commit because the lease excludes other writers.
    pub fn balance(&self) -> i64 {
        let committed = self.store.balance(self.tenant(), self.customer());
        let staged: i64 = self.entries.iter().map(|e| e.points_delta).sum();
        committed + staged
    }

    /// Stages an order and reserves its id.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Internal`] if the order is for another partition or an
    /// order is already staged.
    pub fn stage_order(&mut self, order: NewOrder) -> Result<OrderId> {
        if !self.lease.covers(order.tenant_id, order.customer_id) {
            return Err(LedgerError::Internal(
                "order staged outside the held lease".to_string(),
            ));
        }
        if self.order.is_some() {
            return Err(LedgerError::Internal(
                "transaction already has a staged order".to_string(),
            ));
        }

        let id = OrderId(self.store.next_order_id.fetch_add(1, Ordering::Relaxed));
        self.order = Some((id, order));
        Ok(id)
    }

    /// Stages an entry.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Internal`] if the entry is for another partition.
    /// - [`LedgerError::InsufficientBalance`] if the entry would take the
    ///   balance below zero.
    /// - [`LedgerError::Validation`] if the balance would overflow.
    pub fn stage_entry(&mut self, entry: NewEntry) -> Result<()> {
        if !self.lease.covers(entry.tenant_id, entry.customer_id) {
            return Err(LedgerError::Internal(
                "entry staged outside the held lease".to_string(),
            ));
        }

        let balance = self.balance();
        let after = balance
            .checked_add(entry.points_delta)
            .ok_or_else(|| LedgerError::validation("points would overflow balance"))?;
        if after < 0 {
            return Err(LedgerError::InsufficientBalance {
                balance,
                requested: -entry.points_delta,
            });
        }

        self.entries.push(entry);
        Ok(())
    }

    /// Stages the earn entry crediting `points`, linked to `order_id` if given.
    ///
    /// A linked order must be the one staged in this transaction or a
    /// committed order of this customer, and must not carry an earn entry yet.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::OrderNotFound`] - order is unknown or not the customer's.
    /// - [`LedgerError::Validation`] - order already credited, or the balance
    ///   would overflow.
    pub fn stage_earn(&mut self, order_id: Option<OrderId>, points: i64) -> Result<()> {
        if let Some(order_id) = order_id {
            let staged = self.order.as_ref().is_some_and(|(id, _)| *id == order_id);
            if !staged {
                self.store
                    .order(self.tenant(), order_id)
                    .filter(|order| order.customer_id == self.customer())
                    .ok_or(LedgerError::OrderNotFound(order_id))?;
            }

            let credited = self.store.is_credited(order_id)
                || self.entries.iter().any(|e| e.order_id == Some(order_id));
            if credited {
                return Err(LedgerError::Validation(format!(
                    "order {order_id} already credited"
                )));
            }
        }

        self.stage_entry(NewEntry {
            tenant_id: self.tenant(),
            customer_id: self.customer(),
            order_id,
            points_delta: points,
            reason: EARN_FROM_ORDER.to_string(),
            idempotency_key: None,
        })
    }

    /// Assigns entry ids and timestamps. Nothing becomes visible yet.
    pub fn prepare(self) -> PreparedTxn<'a> {
        let created_at = Utc::now();
        let LedgerTxn {
            store,
            lease,
            order,
            entries,
        } = self;

        let order = order.map(|(id, order)| order.commit(id, created_at));
        let entries = entries
            .into_iter()
            .map(|entry| {
                let id = EntryId(store.next_entry_id.fetch_add(1, Ordering::Relaxed));
                entry.commit(id, created_at)
            })
            .collect();

        PreparedTxn {
            store,
            lease,
            order,
            entries,
            committed: false,
        }
    }

    /// Discards staged writes and releases the lease.
    pub fn rollback(self) {
        tracing::debug!(
            tenant = %self.tenant(),
            customer = %self.customer(),
            staged = self.entries.len(),
            "rolling back"
        );
    }
}

/// Transaction with final ids assigned, awaiting commit.
///
/// Dropping it without [`commit`](Self::commit) rolls back; the reserved ids
/// are not reused.
#[derive(Debug)]
pub struct PreparedTxn<'a> {
    store: &'a LedgerStore,
    lease: Lease<'a>,
    order: Option<Order>,
    entries: Vec<LedgerEntry>,
    committed: bool,
}

impl PreparedTxn<'_> {
    pub fn order(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Publishes the staged writes, then releases the lease.
    pub fn commit(mut self) -> (Option<Order>, Vec<LedgerEntry>) {
        let key = (self.lease.tenant(), self.lease.customer());
        let order = self.order.take();
        let entries = std::mem::take(&mut self.entries);

        self.store.publish(key, order.clone(), &entries);
        self.committed = true;

        tracing::debug!(
            tenant = %key.0,
            customer = %key.1,
            order = ?order.as_ref().map(|o| o.id),
            entries = entries.len(),
            "committed"
        );
        (order, entries)
    }

    /// Discards the prepared writes and releases the lease.
    pub fn rollback(self) {}
}

impl Drop for PreparedTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(
                tenant = %self.lease.tenant(),
                customer = %self.lease.customer(),
                "prepared transaction rolled back"
            );
        }
    }
}
