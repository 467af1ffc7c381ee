use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A chat turn request. `chat_id` groups turns into a conversation;
/// when absent the server starts a new one.
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<Uuid>,
}

/// A knowledge record that grounded an answer, with its similarity score.
/// Order matters: sources are listed in retrieval rank order.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SourceRef {
    pub document_id: Uuid,
    pub score: f64,
}

/// A completed chat turn
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    pub chat_id: Uuid,
    pub answer: String,
    /// True when the safety gate rejected the query. Rejected turns carry
    /// no sources and a fixed refusal answer.
    pub sensitive: bool,
    pub sources: Vec<SourceRef>,
    /// Wall time from query receipt to answer completion
    pub latency_ms: i64,
    /// True when the turn succeeded but its audit record could not be written
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// Server-sent events emitted by the streaming chat endpoint, in order:
/// one `metadata`, zero or more `chunk`s, one `done` (or `error`).
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Metadata {
        chat_id: Uuid,
        sensitive: bool,
        sources: Vec<SourceRef>,
    },
    Chunk {
        text: String,
    },
    Done {
        latency_ms: i64,
    },
    Error {
        message: String,
    },
}

/// Free-text feedback on a conversation's most recent turn
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct FeedbackRequest {
    pub feedback: String,
}

/// Acknowledgement of a recorded feedback update
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FeedbackResponse {
    /// The audit record the feedback landed on
    pub audit_id: Uuid,
    pub chat_id: Uuid,
}
