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

//! Customer ownership seams.
//!
//! The engine does not manage customers. It asks a [`CustomerDirectory`]
//! whether a customer belongs to the calling tenant, always from inside the
//! transaction so the answer is consistent with the lease. Webhook ingestion
//! additionally needs a [`PosCustomerResolver`] to map a point-of-sale
//! customer reference to one of ours.
//!
//! [`InMemoryDirectory`] implements both for tests, the CLI and the demo server.

use crate::base::{CustomerId, PosCustomerId, TenantId};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Answers whether a customer belongs to a tenant.
pub trait CustomerDirectory: Send + Sync {
    /// # Errors
    ///
    /// An error means the directory could not answer; the calling
    /// transaction rolls back.
    fn owns_customer(&self, tenant: TenantId, customer: CustomerId) -> Result<bool>;
}

/// Maps external point-of-sale customer references to customers.
pub trait PosCustomerResolver: Send + Sync {
    /// Returns the customer linked to `pos_customer`, registering a new one
    /// under `tenant` on first sight.
    fn resolve_or_register(
        &self,
        tenant: TenantId,
        pos_customer: &PosCustomerId,
    ) -> Result<CustomerId>;
}

impl<T: CustomerDirectory + ?Sized> CustomerDirectory for Arc<T> {
    fn owns_customer(&self, tenant: TenantId, customer: CustomerId) -> Result<bool> {
        (**self).owns_customer(tenant, customer)
    }
}

impl<T: PosCustomerResolver + ?Sized> PosCustomerResolver for Arc<T> {
    fn resolve_or_register(
        &self,
        tenant: TenantId,
        pos_customer: &PosCustomerId,
    ) -> Result<CustomerId> {
        (**self).resolve_or_register(tenant, pos_customer)
    }
}

/// Thread-safe customer directory held in memory.
#[derive(Debug)]
pub struct InMemoryDirectory {
    /// Owning tenant of every known customer.
    owners: DashMap<CustomerId, TenantId>,
    pos_links: DashMap<(TenantId, PosCustomerId), CustomerId>,
    next_customer_id: AtomicU64,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
            pos_links: DashMap::new(),
            next_customer_id: AtomicU64::new(1),
        }
    }

    /// Registers a new customer for `tenant` with a fresh id.
    pub fn register(&self, tenant: TenantId) -> CustomerId {
        loop {
            let id = CustomerId(self.next_customer_id.fetch_add(1, Ordering::Relaxed));
            // Skip ids claimed explicitly through `insert`.
            if self.owners.insert_if_absent(id, tenant) {
                return id;
            }
        }
    }

    /// Registers `customer` under `tenant`.
    ///
    /// Returns `false` if the id is already owned by any tenant.
    pub fn insert(&self, tenant: TenantId, customer: CustomerId) -> bool {
        self.owners.insert_if_absent(customer, tenant)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomerDirectory for InMemoryDirectory {
    fn owns_customer(&self, tenant: TenantId, customer: CustomerId) -> Result<bool> {
        Ok(self
            .owners
            .get(&customer)
            .is_some_and(|owner| *owner == tenant))
    }
}

impl PosCustomerResolver for InMemoryDirectory {
    fn resolve_or_register(
        &self,
        tenant: TenantId,
        pos_customer: &PosCustomerId,
    ) -> Result<CustomerId> {
        let customer = *self
            .pos_links
            .entry((tenant, pos_customer.clone()))
            .or_insert_with(|| self.register(tenant));
        Ok(customer)
    }
}

/// Insert helper over [`DashMap`]'s entry API.
trait InsertIfAbsent<K, V> {
    fn insert_if_absent(&self, key: K, value: V) -> bool;
}

impl<K, V> InsertIfAbsent<K, V> for DashMap<K, V>
where
    K: Eq + std::hash::Hash,
{
    fn insert_if_absent(&self, key: K, value: V) -> bool {
        match self.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }
}
