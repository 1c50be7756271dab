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

//! REST API server exposing the loyalty ledger over HTTP.
//!
//! The tenant comes from the `x-tenant-id` header, standing in for real
//! authentication. Engine calls run on the blocking pool: if a client
//! disconnects mid-request, the operation still commits or rolls back in full.
//!
//! Run with: `cargo run --example server`
//!
//! # Example Requests
//!
//! ```bash
//! # Register a customer
//! curl -X POST http://localhost:3000/customers -H "x-tenant-id: 1"
//!
//! # Create an order (earns floor(subtotal_cents / 100) points)
//! curl -X POST http://localhost:3000/orders \
//!   -H "x-tenant-id: 1" -H "Content-Type: application/json" \
//!   -d '{"customer_id": 1, "subtotal_cents": 2599, "idempotency_key": "o1"}'
//!
//! # Redeem
//! curl -X POST http://localhost:3000/customers/1/redeem \
//!   -H "x-tenant-id: 1" -H "Content-Type: application/json" \
//!   -d '{"points": 10, "reason": "free coffee", "idempotency_key": "r1"}'
//!
//! # Balance and history
//! curl -H "x-tenant-id: 1" http://localhost:3000/customers/1/points
//! curl -H "x-tenant-id: 1" "http://localhost:3000/customers/1/ledger?limit=50"
//! ```

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use loyalty_ledger::{
    CustomerDirectory, CustomerId, Engine, EngineConfig, EntryId, IdempotencyKey,
    InMemoryDirectory, LedgerError, LedgerPage, OrderReceipt, PosCustomerResolver, PosOrderEvent,
    RedeemReceipt, TenantId, ingest_pos_order,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

// === Request/Response DTOs ===

/// Request body for `POST /orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: u64,
    pub subtotal_cents: i64,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Request body for `POST /customers/{id}/redeem`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemRequest {
    pub points: i64,
    pub reason: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Query string for `GET /customers/{id}/ledger`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerQuery {
    pub limit: Option<usize>,
    pub before_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerResponse {
    pub customer_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointsResponse {
    pub customer_id: u64,
    pub points: i64,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<i64>,
}

// === Application State ===

/// Shared application state containing the ledger engine.
pub struct AppState<D = InMemoryDirectory> {
    pub engine: Arc<Engine<D>>,
}

impl<D> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

// === Tenant Extraction ===

/// Calling tenant, taken from the `x-tenant-id` header.
pub struct Tenant(pub TenantId);

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-tenant-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .map(|id| Tenant(TenantId(id)))
            .ok_or(AppError::Unauthorized)
    }
}

// === Error Handling ===

/// Converts ledger errors into HTTP responses.
pub enum AppError {
    Ledger(LedgerError),
    Unauthorized,
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError::Ledger(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = match self {
            AppError::Unauthorized => {
                let body = ErrorResponse {
                    error: "missing or invalid x-tenant-id header".to_string(),
                    code: "UNAUTHORIZED".to_string(),
                    balance: None,
                };
                return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
            }
            AppError::Ledger(err) => err,
        };

        let (status, code, balance) = match &err {
            LedgerError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", None),
            LedgerError::CustomerNotFound { .. } => {
                (StatusCode::NOT_FOUND, "CUSTOMER_NOT_FOUND", None)
            }
            LedgerError::OrderNotFound(_) => (StatusCode::NOT_FOUND, "ORDER_NOT_FOUND", None),
            LedgerError::InsufficientBalance { balance, .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INSUFFICIENT_BALANCE",
                Some(*balance),
            ),
            LedgerError::LockTimeout { .. } | LedgerError::Internal(_) => {
                tracing::error!(error = %err, "internal error");
                (StatusCode::SERVICE_UNAVAILABLE, "INTERNAL_ERROR", None)
            }
        };

        // Internal details stay in the logs.
        let error = if err.is_retryable() {
            "temporary failure, retry with the same idempotency key".to_string()
        } else {
            err.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error,
                code: code.to_string(),
                balance,
            }),
        )
            .into_response()
    }
}

/// Runs an engine call on the blocking pool.
///
/// The spawned task is detached from the request future, so it finishes even
/// if the client goes away.
async fn run<D, T, F>(state: &AppState<D>, op: F) -> Result<T, AppError>
where
    D: CustomerDirectory + 'static,
    T: Send + 'static,
    F: FnOnce(&Engine<D>) -> Result<T, LedgerError> + Send + 'static,
{
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || op(&engine))
        .await
        .map_err(|e| AppError::Ledger(LedgerError::Internal(e.to_string())))?
        .map_err(AppError::from)
}

fn key(raw: Option<String>) -> Option<IdempotencyKey> {
    raw.map(IdempotencyKey::from)
}

// === Handlers ===

/// POST /customers - Register a customer for the calling tenant.
async fn create_customer(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> (StatusCode, Json<CustomerResponse>) {
    let customer = state.engine.directory().register(tenant);
    (
        StatusCode::CREATED,
        Json(CustomerResponse {
            customer_id: customer.0,
        }),
    )
}

/// POST /orders - Create an order and earn its points.
async fn create_order<D: CustomerDirectory + 'static>(
    State(state): State<AppState<D>>,
    Tenant(tenant): Tenant,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderReceipt>), AppError> {
    let receipt = run(&state, move |engine| {
        engine.create_order_and_earn(
            tenant,
            CustomerId(request.customer_id),
            request.subtotal_cents,
            key(request.idempotency_key),
        )
    })
    .await?;

    let status = if receipt.replay {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(receipt)))
}

/// POST /customers/{id}/redeem - Redeem points.
async fn redeem<D: CustomerDirectory + 'static>(
    State(state): State<AppState<D>>,
    Tenant(tenant): Tenant,
    Path(id): Path<u64>,
    Json(request): Json<RedeemRequest>,
) -> Result<Json<RedeemReceipt>, AppError> {
    let receipt = run(&state, move |engine| {
        engine.redeem(
            tenant,
            CustomerId(id),
            request.points,
            &request.reason,
            key(request.idempotency_key),
        )
    })
    .await?;
    Ok(Json(receipt))
}

/// GET /customers/{id}/points - Current balance (may be momentarily stale).
async fn points<D: CustomerDirectory + 'static>(
    State(state): State<AppState<D>>,
    Tenant(tenant): Tenant,
    Path(id): Path<u64>,
) -> Result<Json<PointsResponse>, AppError> {
    let customer = CustomerId(id);
    if !state.engine.directory().owns_customer(tenant, customer)? {
        return Err(LedgerError::CustomerNotFound { tenant, customer }.into());
    }
    Ok(Json(PointsResponse {
        customer_id: id,
        points: state.engine.balance(tenant, customer),
    }))
}

/// GET /customers/{id}/ledger - Ledger history, newest first.
async fn ledger<D: CustomerDirectory + 'static>(
    State(state): State<AppState<D>>,
    Tenant(tenant): Tenant,
    Path(id): Path<u64>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<LedgerPage>, AppError> {
    let page = state.engine.list_ledger(
        tenant,
        CustomerId(id),
        query.limit,
        query.before_id.map(EntryId),
    )?;
    Ok(Json(page))
}

/// POST /webhooks/pos - Ingest an order event from a point-of-sale system.
async fn pos_webhook<D>(
    State(state): State<AppState<D>>,
    Tenant(tenant): Tenant,
    Json(event): Json<PosOrderEvent>,
) -> Result<Json<OrderReceipt>, AppError>
where
    D: CustomerDirectory + PosCustomerResolver + 'static,
{
    let receipt = run(&state, move |engine| ingest_pos_order(engine, tenant, event)).await?;
    Ok(Json(receipt))
}

// === Router ===

/// Ledger routes for an engine over any customer directory.
///
/// Customer registration is left out; it belongs to the directory.
pub fn ledger_routes<D>() -> Router<AppState<D>>
where
    D: CustomerDirectory + PosCustomerResolver + 'static,
{
    Router::new()
        .route("/orders", post(create_order::<D>))
        .route("/customers/{id}/redeem", post(redeem::<D>))
        .route("/customers/{id}/points", get(points::<D>))
        .route("/customers/{id}/ledger", get(ledger::<D>))
        .route("/webhooks/pos", post(pos_webhook::<D>))
}

pub fn create_router(state: AppState) -> Router {
    ledger_routes::<InMemoryDirectory>()
        .route("/customers", post(create_customer))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine = match Engine::with_config(InMemoryDirectory::new(), EngineConfig::from_env()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let state = AppState {
        engine: Arc::new(engine),
    };

    let app = create_router(state);

    let addr = std::env::var("LOYALTY_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let listener = TcpListener::bind(&addr).await.unwrap();
    tracing::info!(%addr, "loyalty ledger API listening");

    axum::serve(listener, app).await.unwrap();
}
