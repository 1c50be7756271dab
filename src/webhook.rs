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

//! Point-of-sale order ingestion.
//!
//! POS systems push order events over an at-least-once channel and identify
//! customers by their own reference. Signature verification happens before
//! an event reaches this module. Here the reference is mapped to a customer
//! and the order is credited through [`Engine::create_order_and_earn`], so a
//! redelivered event with the same idempotency key is answered as a replay.

use crate::base::{IdempotencyKey, PosCustomerId, TenantId};
use crate::directory::{CustomerDirectory, PosCustomerResolver};
use crate::engine::{Engine, OrderReceipt};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// An authenticated order event from a point-of-sale system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosOrderEvent {
    pub pos_customer_id: PosCustomerId,
    pub subtotal_cents: i64,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Resolves the event's customer and credits the order.
///
/// # Errors
///
/// Whatever [`Engine::create_order_and_earn`] or the resolver returns.
#[tracing::instrument(skip_all, fields(tenant = %tenant, pos_customer = %event.pos_customer_id))]
pub fn ingest_pos_order<D>(
    engine: &Engine<D>,
    tenant: TenantId,
    event: PosOrderEvent,
) -> Result<OrderReceipt>
where
    D: CustomerDirectory + PosCustomerResolver,
{
    let customer = engine
        .directory()
        .resolve_or_register(tenant, &event.pos_customer_id)?;

    let receipt = engine.create_order_and_earn(
        tenant,
        customer,
        event.subtotal_cents,
        event.idempotency_key,
    )?;
    tracing::info!(
        order = %receipt.order.id,
        points = receipt.points_earned,
        replay = receipt.replay,
        "pos order ingested"
    );
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(pos: &str, subtotal_cents: i64, key: Option<&str>) -> PosOrderEvent {
        PosOrderEvent {
            pos_customer_id: PosCustomerId(pos.to_string()),
            subtotal_cents,
            idempotency_key: key.map(IdempotencyKey::from),
        }
    }

    #[test]
    fn first_event_registers_customer_and_credits() {
        let engine: Engine = Engine::default();
        let receipt =
            ingest_pos_order(&engine, TenantId(1), event("pos-1", 2599, Some("e1"))).unwrap();

        assert_eq!(receipt.points_earned, 25);
        assert!(!receipt.replay);
        assert_eq!(engine.balance(TenantId(1), receipt.order.customer_id), 25);
    }

    #[test]
    fn redelivery_is_replayed() {
        let engine: Engine = Engine::default();
        let redelivered = event("pos-1", 1000, Some("e1"));
        let first = ingest_pos_order(&engine, TenantId(1), redelivered.clone()).unwrap();
        let again = ingest_pos_order(&engine, TenantId(1), redelivered).unwrap();

        assert!(again.replay);
        assert_eq!(first.order.id, again.order.id);
        assert_eq!(engine.balance(TenantId(1), first.order.customer_id), 10);
        assert_eq!(engine.store().order_count(), 1);
    }

    #[test]
    fn same_pos_customer_accumulates() {
        let engine: Engine = Engine::default();
        let a = ingest_pos_order(&engine, TenantId(1), event("pos-9", 500, None)).unwrap();
        let b = ingest_pos_order(&engine, TenantId(1), event("pos-9", 700, None)).unwrap();

        assert_eq!(a.order.customer_id, b.order.customer_id);
        assert_eq!(engine.balance(TenantId(1), a.order.customer_id), 12);
    }

    #[test]
    fn event_deserializes_without_key() {
        let event: PosOrderEvent =
            serde_json::from_str(r#"{"pos_customer_id": "abc", "subtotal_cents": 150}"#).unwrap();
        assert_eq!(event.idempotency_key, None);
        assert_eq!(event.pos_customer_id, PosCustomerId("abc".to_string()));
    }
}
