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

//! Error types for ledger operations.
//!
//! Client errors ([`Validation`](LedgerError::Validation), the not-found
//! variants and [`InsufficientBalance`](LedgerError::InsufficientBalance)) are
//! caused by the request itself and must not be retried unchanged. The
//! remaining variants are internal failures: the operation rolled back
//! completely, and retrying is safe when the request carries an idempotency key.

use crate::base::{CustomerId, OrderId, TenantId};
use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or out-of-range input, rejected before any lock is taken
    #[error("invalid request: {0}")]
    Validation(String),

    /// Customer does not exist or belongs to another tenant
    #[error("customer {customer} not found for tenant {tenant}")]
    CustomerNotFound {
        tenant: TenantId,
        customer: CustomerId,
    },

    /// Order does not exist or is not owned by the caller
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// Redemption exceeds the current balance
    #[error("insufficient balance: requested {requested} points, balance is {balance}")]
    InsufficientBalance { balance: i64, requested: i64 },

    /// The customer's lease could not be acquired within the configured timeout
    #[error("timed out waiting for lease on tenant {tenant} customer {customer}")]
    LockTimeout {
        tenant: TenantId,
        customer: CustomerId,
    },

    /// Storage or collaborator failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Returns `true` for errors caused by the request itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::CustomerNotFound { .. }
                | Self::OrderNotFound(_)
                | Self::InsufficientBalance { .. }
        )
    }

    /// Returns `true` for failures that left no trace and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Internal(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
