use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use lore_core::audit::{AuditRecord, AuditStats, PaginatedResponse};
use lore_core::error::ApiError;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/audit", get(list_audit))
        .route("/api/audit/stats", get(audit_stats))
        .route("/api/audit/{chat_id}", get(get_audit))
}

/// Query parameters for listing the audit ledger
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListAuditParams {
    /// Maximum number of records to return (default 50, max 200)
    #[serde(default)]
    pub limit: Option<i64>,
    /// Cursor for pagination (opaque string from previous response's next_cursor)
    #[serde(default)]
    pub cursor: Option<String>,
}

/// List audit records with cursor-based pagination
///
/// Newest first. The ledger is append-only, so a cursor stays valid while
/// new turns arrive.
#[utoipa::path(
    get,
    path = "/api/audit",
    params(ListAuditParams),
    responses(
        (status = 200, description = "Paginated audit records", body = PaginatedResponse<AuditRecord>),
        (status = 400, description = "Invalid cursor", body = ApiError)
    ),
    tag = "audit"
)]
pub async fn list_audit(
    State(state): State<AppState>,
    Query(params): Query<ListAuditParams>,
) -> Result<Json<PaginatedResponse<AuditRecord>>, AppError> {
    let limit = params.limit.unwrap_or(50).min(200).max(1);
    let page = state.ledger.list(limit, params.cursor.as_deref()).await?;
    Ok(Json(page))
}

/// Aggregate statistics over the whole ledger
#[utoipa::path(
    get,
    path = "/api/audit/stats",
    responses(
        (status = 200, description = "Turn counts and latency aggregates", body = AuditStats)
    ),
    tag = "audit"
)]
pub async fn audit_stats(State(state): State<AppState>) -> Result<Json<AuditStats>, AppError> {
    let stats = state.ledger.stats().await?;
    Ok(Json(stats))
}

/// The most recent audit record of a conversation
#[utoipa::path(
    get,
    path = "/api/audit/{chat_id}",
    params(("chat_id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "Latest turn of the conversation", body = AuditRecord),
        (status = 404, description = "Unknown conversation", body = ApiError)
    ),
    tag = "audit"
)]
pub async fn get_audit(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<AuditRecord>, AppError> {
    let record = state.ledger.latest_for_chat(chat_id).await?;
    Ok(Json(record))
}
