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

//! Idempotency key registry.
//!
//! Maps a scoped idempotency key to the committed result it produced, so a
//! repeated submission is answered with the original result instead of
//! re-running the side effect. Order creation and redemption use separate
//! scope types ([`OrderScope`], [`RedeemScope`]) and separate registries;
//! a key in one namespace can never match a key in the other.

use crate::base::{CustomerId, IdempotencyKey, TenantId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;

/// Order-creation key scope: unique per tenant, across all its customers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderScope {
    pub tenant: TenantId,
    pub key: IdempotencyKey,
}

impl OrderScope {
    pub fn new(tenant: TenantId, key: IdempotencyKey) -> Self {
        Self { tenant, key }
    }
}

/// Redemption key scope: unique per `(tenant, customer)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedeemScope {
    pub tenant: TenantId,
    pub customer: CustomerId,
    pub key: IdempotencyKey,
}

impl RedeemScope {
    pub fn new(tenant: TenantId, customer: CustomerId, key: IdempotencyKey) -> Self {
        Self {
            tenant,
            customer,
            key,
        }
    }
}

/// Outcome of checking a key before doing any work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<V> {
    /// The key was already used; here is what it produced.
    Replay(V),
    /// First sighting of the key; run the operation.
    Proceed,
}

/// Outcome of registering a key at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration<V> {
    /// The key now maps to the caller's result.
    Recorded,
    /// Another submission registered the key first. The caller must discard
    /// its staged work and answer with the winner's result.
    Conflict(V),
}

/// Thread-safe map from scoped keys to committed results.
///
/// Uniqueness is enforced atomically by [`record`](Self::record); checking
/// first with [`check`](Self::check) is an optimisation, not a guarantee.
#[derive(Debug)]
pub struct IdempotencyRegistry<S, V>
where
    S: Eq + Hash,
{
    records: DashMap<S, V>,
}

impl<S, V> IdempotencyRegistry<S, V>
where
    S: Eq + Hash,
    V: Clone,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Looks up a previously registered result.
    pub fn check(&self, scope: &S) -> Check<V> {
        match self.records.get(scope) {
            Some(previous) => Check::Replay(previous.value().clone()),
            None => Check::Proceed,
        }
    }

    /// Registers `value` as the result for `scope` unless the key is taken.
    pub fn record(&self, scope: S, value: V) -> Registration<V> {
        // Entry API holds the shard lock across check-and-insert.
        match self.records.entry(scope) {
            Entry::Occupied(existing) => Registration::Conflict(existing.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Registration::Recorded
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<S, V> Default for IdempotencyRegistry<S, V>
where
    S: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn order_scope(tenant: u64, key: &str) -> OrderScope {
        OrderScope::new(TenantId(tenant), IdempotencyKey::new(key))
    }

    #[test]
    fn first_sighting_proceeds() {
        let registry: IdempotencyRegistry<OrderScope, u64> = IdempotencyRegistry::new();
        assert_eq!(registry.check(&order_scope(1, "o1")), Check::Proceed);
        assert!(registry.is_empty());
    }

    #[test]
    fn recorded_key_replays() {
        let registry = IdempotencyRegistry::new();
        assert_eq!(registry.record(order_scope(1, "o1"), 42u64), Registration::Recorded);
        assert_eq!(registry.check(&order_scope(1, "o1")), Check::Replay(42));
    }

    #[test]
    fn second_record_reports_winner() {
        let registry = IdempotencyRegistry::new();
        registry.record(order_scope(1, "o1"), 1u64);
        assert_eq!(registry.record(order_scope(1, "o1"), 2u64), Registration::Conflict(1));
        assert_eq!(registry.check(&order_scope(1, "o1")), Check::Replay(1));
    }

    #[test]
    fn tenants_do_not_share_keys() {
        let registry = IdempotencyRegistry::new();
        registry.record(order_scope(1, "o1"), 1u64);
        assert_eq!(registry.check(&order_scope(2, "o1")), Check::Proceed);
    }

    #[test]
    fn redeem_scope_includes_customer() {
        let registry = IdempotencyRegistry::new();
        let key = IdempotencyKey::new("r1");
        registry.record(RedeemScope::new(TenantId(1), CustomerId(1), key.clone()), 10i64);

        assert_eq!(
            registry.check(&RedeemScope::new(TenantId(1), CustomerId(2), key.clone())),
            Check::Proceed
        );
        assert_eq!(
            registry.check(&RedeemScope::new(TenantId(1), CustomerId(1), key)),
            Check::Replay(10)
        );
    }

    #[test]
    fn concurrent_record_has_exactly_one_winner() {
        let registry = IdempotencyRegistry::new();
        let barrier = Barrier::new(16);

        let outcomes: Vec<Registration<usize>> = thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let registry = &registry;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        registry.record(order_scope(1, "race"), i)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = outcomes
            .iter()
            .filter(|o| **o == Registration::Recorded)
            .count();
        assert_eq!(winners, 1);

        let Check::Replay(winner) = registry.check(&order_scope(1, "race")) else {
            panic!("key must be registered");
        };
        for outcome in outcomes {
            if let Registration::Conflict(seen) = outcome {
                assert_eq!(seen, winner);
            }
        }
    }
}
