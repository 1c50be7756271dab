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

//! Per-key serialization of balance mutations.
//!
//! Every mutating operation holds a [`Lease`] on its `(tenant, customer)` pair
//! for the whole transaction. Leases on different pairs never contend; there
//! is no global lock.
//!
//! The same lock table, keyed by an order's idempotency scope, keeps requests
//! for one tenant-wide order key apart even when they come from different
//! customers. Such a lock is always taken after the customer lease, and its
//! holder already owns every lease it needs, so no wait cycle can form.
//!
//! # Example
//!
//! ```
//! use loyalty_ledger::{CustomerId, KeySerializer, TenantId};
//!
//! let serializer = KeySerializer::new();
//! let lease = serializer.acquire(TenantId(1), CustomerId(1)).unwrap();
//! assert_eq!(lease.customer(), CustomerId(1));
//! drop(lease);
//! assert_eq!(serializer.tracked_keys(), 0);
//! ```

use crate::base::{CustomerId, TenantId};
use crate::error::{LedgerError, Result};
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

type LeaseKey = (TenantId, CustomerId);

/// Lock table, by default keyed by `(tenant, customer)`.
///
/// Entries are created on first use and evicted when their last holder or
/// waiter lets go, so the table only tracks keys with in-flight operations.
#[derive(Debug)]
pub struct KeySerializer<K: Eq + Hash = LeaseKey> {
    locks: DashMap<K, Arc<Mutex<()>>>,
    /// Upper bound on waiting for a held key. `None` waits indefinitely.
    timeout: Option<Duration>,
}

impl KeySerializer {
    /// Creates a serializer that waits indefinitely for contended keys.
    pub fn new() -> Self {
        Self::with_timeout(None)
    }

    /// Creates a serializer that gives up after `timeout` with
    /// [`LedgerError::LockTimeout`].
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self::keyed(timeout)
    }

    /// Acquires the lease for `(tenant, customer)`, blocking while another
    /// operation holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::LockTimeout`] if a timeout is configured and
    /// the key stays held past it.
    pub fn acquire(&self, tenant: TenantId, customer: CustomerId) -> Result<Lease<'_>> {
        self.lock((tenant, customer))
            .ok_or(LedgerError::LockTimeout { tenant, customer })
    }
}

impl Default for KeySerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeySerializer<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Creates a lock table over arbitrary keys.
    pub fn keyed(timeout: Option<Duration>) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Locks `key`, blocking while another holder has it.
    ///
    /// Returns `None` if a timeout is configured and the key stays held
    /// past it.
    pub fn lock(&self, key: K) -> Option<Lease<'_, K>> {
        // Clone out of the table so the shard lock is released before blocking.
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match mutex.try_lock_arc() {
            Some(guard) => guard,
            None => {
                tracing::trace!(?key, "lease contended, waiting");
                match self.timeout {
                    None => mutex.lock_arc(),
                    Some(timeout) => match mutex.try_lock_arc_for(timeout) {
                        Some(guard) => guard,
                        None => {
                            drop(mutex);
                            self.evict(&key);
                            tracing::warn!(?key, ?timeout, "lease acquisition timed out");
                            return None;
                        }
                    },
                }
            }
        };
        drop(mutex);

        Some(Lease {
            serializer: self,
            key,
            guard: Some(guard),
        })
    }

    /// Number of keys currently held or waited on.
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }
}

impl<K: Eq + Hash> KeySerializer<K> {
    /// Drops the table entry if nobody but the table references it.
    ///
    /// The strong count is read under the shard write lock, the same lock
    /// `lock` needs to clone the entry, so a concurrent acquirer either
    /// already holds a clone (count > 1) or will insert a fresh mutex.
    fn evict(&self, key: &K) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Exclusive hold on one key, by default a `(tenant, customer)` balance.
///
/// Released exactly once, when dropped. Dropping happens on every exit path
/// of the owning transaction, including early returns and panics.
pub struct Lease<'a, K: Eq + Hash = LeaseKey> {
    serializer: &'a KeySerializer<K>,
    key: K,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Lease<'_> {
    pub fn tenant(&self) -> TenantId {
        self.key.0
    }

    pub fn customer(&self) -> CustomerId {
        self.key.1
    }

    /// Returns `true` if this lease covers `(tenant, customer)`.
    pub fn covers(&self, tenant: TenantId, customer: CustomerId) -> bool {
        self.key == (tenant, customer)
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for Lease<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("held", &self.guard.is_some())
            .finish()
    }
}

impl<K: Eq + Hash> Drop for Lease<'_, K> {
    fn drop(&mut self) {
        // Unlock first so our own reference no longer counts against eviction.
        drop(self.guard.take());
        self.serializer.evict(&self.key);
    }
}
