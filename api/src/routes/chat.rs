use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use uuid::Uuid;

use lore_core::chat::{ChatRequest, ChatResponse, FeedbackRequest, FeedbackResponse, StreamEvent};
use lore_core::error::ApiError;

use crate::error::AppError;
use crate::routes::knowledge::validate_query;
use crate::state::AppState;

const MAX_FEEDBACK_CHARS: usize = 4_000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/chat/{chat_id}/feedback", post(submit_feedback))
}

fn validate_feedback(req: &FeedbackRequest) -> Result<(), AppError> {
    if req.feedback.trim().is_empty() {
        return Err(AppError::Validation {
            message: "feedback must not be empty".to_string(),
            field: Some("feedback".to_string()),
            received: None,
            docs_hint: None,
        });
    }

    let chars = req.feedback.chars().count();
    if chars > MAX_FEEDBACK_CHARS {
        return Err(AppError::Validation {
            message: format!(
                "feedback length {} exceeds maximum of {} characters",
                chars, MAX_FEEDBACK_CHARS
            ),
            field: Some("feedback".to_string()),
            received: Some(serde_json::json!(chars)),
            docs_hint: None,
        });
    }

    Ok(())
}

/// Answer a chat turn
///
/// Runs the full turn: safety gate, retrieval, synthesis, and the audit
/// write. Queries the gate flags as sensitive get the fixed refusal with
/// no sources.
#[utoipa::path(
    post,
    path = "/api/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Completed turn", body = ChatResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 503, description = "Provider unavailable", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    validate_query(&req.query, state.config.max_input_chars)?;

    let response = state.chat.answer(req.query, req.chat_id).await?;
    Ok(Json(response))
}

/// Answer a chat turn as a server-sent event stream
///
/// Emits one `metadata` event, the answer as `chunk` events, then `done`
/// with the turn latency. Gate and retrieval failures happen before the
/// stream opens and surface as plain HTTP errors.
#[utoipa::path(
    post,
    path = "/api/chat/stream",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Event stream for the turn", body = StreamEvent,
         content_type = "text/event-stream"),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 503, description = "Provider unavailable", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    validate_query(&req.query, state.config.max_input_chars)?;

    let events = state.chat.answer_stream(req.query, req.chat_id).await?;
    let stream = events.map(|event| Event::default().json_data(&event));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Attach feedback to a conversation
///
/// Lands on the most recent turn of the conversation; submitting again
/// overwrites. Never creates an audit row.
#[utoipa::path(
    post,
    path = "/api/chat/{chat_id}/feedback",
    params(("chat_id" = Uuid, Path, description = "Conversation id")),
    request_body = FeedbackRequest,
    responses(
        (status = 200, description = "Feedback recorded", body = FeedbackResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "Unknown conversation", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn submit_feedback(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, AppError> {
    validate_feedback(&req)?;

    let audit_id = state.ledger.add_feedback(chat_id, &req.feedback).await?;
    Ok(Json(FeedbackResponse { audit_id, chat_id }))
}
