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

//! Ledger records.
//!
//! A [`LedgerEntry`] is a signed point delta; a customer's balance is the sum
//! of their entries. Entries and [`Order`]s are immutable once committed.
//! Before commit they exist only as staged values ([`NewEntry`], [`NewOrder`])
//! that carry no identifier and no timestamp.

use crate::base::{CustomerId, EntryId, IdempotencyKey, OrderId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason recorded on entries created by an order.
pub const EARN_FROM_ORDER: &str = "earn_from_order";

/// Earning rate: one point per this many cents of subtotal.
pub const CENTS_PER_POINT: i64 = 100;

/// Points earned for an order subtotal.
///
/// Truncating division; cents below a whole point are forfeited.
///
/// ```
/// use loyalty_ledger::points_for_subtotal;
///
/// assert_eq!(points_for_subtotal(2599), 25);
/// assert_eq!(points_for_subtotal(99), 0);
/// ```
pub fn points_for_subtotal(subtotal_cents: i64) -> i64 {
    subtotal_cents / CENTS_PER_POINT
}

/// A committed change to a customer's points balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub order_id: Option<OrderId>,
    /// Positive for earn, negative for redeem.
    pub points_delta: i64,
    pub reason: String,
    pub idempotency_key: Option<IdempotencyKey>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_earn(&self) -> bool {
        self.points_delta > 0
    }

    /// Absolute number of points moved by this entry.
    pub fn points(&self) -> i64 {
        self.points_delta.abs()
    }
}

/// An entry staged inside a transaction, not yet visible to anyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub order_id: Option<OrderId>,
    pub points_delta: i64,
    pub reason: String,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewEntry {
    pub(crate) fn commit(self, id: EntryId, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id,
            tenant_id: self.tenant_id,
            customer_id: self.customer_id,
            order_id: self.order_id,
            points_delta: self.points_delta,
            reason: self.reason,
            idempotency_key: self.idempotency_key,
            created_at,
        }
    }
}

/// A committed purchase that earned points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub subtotal_cents: i64,
    pub idempotency_key: Option<IdempotencyKey>,
    pub created_at: DateTime<Utc>,
}

/// An order staged inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub subtotal_cents: i64,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewOrder {
    pub(crate) fn commit(self, id: OrderId, created_at: DateTime<Utc>) -> Order {
        Order {
            id,
            tenant_id: self.tenant_id,
            customer_id: self.customer_id,
            subtotal_cents: self.subtotal_cents,
            idempotency_key: self.idempotency_key,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earn_rate_truncates() {
        assert_eq!(points_for_subtotal(2599), 25);
        assert_eq!(points_for_subtotal(99), 0);
        assert_eq!(points_for_subtotal(100), 1);
        assert_eq!(points_for_subtotal(1000), 10);
    }

    #[test]
    fn commit_preserves_staged_fields() {
        let staged = NewEntry {
            tenant_id: TenantId(1),
            customer_id: CustomerId(2),
            order_id: Some(OrderId(3)),
            points_delta: 25,
            reason: EARN_FROM_ORDER.to_string(),
            idempotency_key: None,
        };
        let now = Utc::now();
        let entry = staged.commit(EntryId(9), now);

        assert_eq!(entry.id, EntryId(9));
        assert_eq!(entry.order_id, Some(OrderId(3)));
        assert_eq!(entry.points_delta, 25);
        assert_eq!(entry.created_at, now);
        assert!(entry.is_earn());
    }

    #[test]
    fn redeem_entry_points_are_absolute() {
        let entry = NewEntry {
            tenant_id: TenantId(1),
            customer_id: CustomerId(2),
            order_id: None,
            points_delta: -40,
            reason: "gift card".to_string(),
            idempotency_key: Some(IdempotencyKey::new("r1")),
        }
        .commit(EntryId(1), Utc::now());

        assert!(!entry.is_earn());
        assert_eq!(entry.points(), 40);
    }

    #[test]
    fn entry_serializes_with_transparent_ids() {
        let entry = NewEntry {
            tenant_id: TenantId(1),
            customer_id: CustomerId(2),
            order_id: None,
            points_delta: -5,
            reason: "coupon".to_string(),
            idempotency_key: Some(IdempotencyKey::new("k")),
        }
        .commit(EntryId(4), Utc::now());

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["customer_id"], 2);
        assert_eq!(json["points_delta"], -5);
        assert_eq!(json["idempotency_key"], "k");
        assert!(json["order_id"].is_null());
    }
}
