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

//! Engine configuration.
//!
//! Reads from environment variables through [`EngineConfig::from_env`]:
//! - `LOYALTY_LOCK_TIMEOUT_MS` - bounded wait for a customer lease (default: unbounded)
//! - `LOYALTY_DEFAULT_PAGE_LIMIT` - ledger page size when none is given (default: `50`)
//! - `LOYALTY_MAX_PAGE_LIMIT` - largest accepted ledger page size (default: `200`)

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum wait for a held lease, in milliseconds. `None` blocks until
    /// the holder commits or rolls back.
    pub lock_timeout_ms: Option<u64>,

    /// Page size of `list_ledger` when the caller gives none.
    pub default_page_limit: usize,

    /// Largest page size `list_ledger` accepts.
    pub max_page_limit: usize,

    /// Longest accepted redemption reason, in characters.
    pub max_reason_len: usize,

    /// Longest accepted idempotency key, in characters.
    pub max_idempotency_key_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: None,
            default_page_limit: 50,
            max_page_limit: 200,
            max_reason_len: 200,
            max_idempotency_key_len: 128,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable source.
    ///
    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse().ok());

        Self {
            lock_timeout_ms: parsed("LOYALTY_LOCK_TIMEOUT_MS").or(defaults.lock_timeout_ms),
            default_page_limit: parsed("LOYALTY_DEFAULT_PAGE_LIMIT")
                .map(|v: u64| v as usize)
                .unwrap_or(defaults.default_page_limit),
            max_page_limit: parsed("LOYALTY_MAX_PAGE_LIMIT")
                .map(|v: u64| v as usize)
                .unwrap_or(defaults.max_page_limit),
            ..defaults
        }
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Checks that the limits are usable.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] if a limit is zero or the default page
    /// size exceeds the maximum.
    pub fn validate(&self) -> Result<()> {
        if self.default_page_limit == 0 || self.max_page_limit == 0 {
            return Err(LedgerError::validation("page limits must be positive"));
        }
        if self.default_page_limit > self.max_page_limit {
            return Err(LedgerError::validation(
                "default page limit exceeds max page limit",
            ));
        }
        if self.max_reason_len == 0 || self.max_idempotency_key_len == 0 {
            return Err(LedgerError::validation("length limits must be positive"));
        }
        Ok(())
    }
}
