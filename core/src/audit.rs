use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::SourceRef;

/// How a chat turn ended. Stored as text in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Safety gate passed, an answer was synthesized
    Answered,
    /// Safety gate flagged the query; the fixed refusal was returned
    Rejected,
    /// A provider or internal failure aborted the turn
    Failed,
    /// The client disconnected mid-stream; the partial answer was kept
    Truncated,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Answered => "answered",
            TurnOutcome::Rejected => "rejected",
            TurnOutcome::Failed => "failed",
            TurnOutcome::Truncated => "truncated",
        }
    }
}

impl fmt::Display for TurnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger row with an outcome label this build does not know.
#[derive(Debug, thiserror::Error)]
#[error("unknown turn outcome: {0}")]
pub struct UnknownOutcome(pub String);

impl FromStr for TurnOutcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "answered" => Ok(TurnOutcome::Answered),
            "rejected" => Ok(TurnOutcome::Rejected),
            "failed" => Ok(TurnOutcome::Failed),
            "truncated" => Ok(TurnOutcome::Truncated),
            other => Err(UnknownOutcome(other.to_string())),
        }
    }
}

/// One row of the audit ledger. Append-only: every completed chat turn adds
/// exactly one record, including rejected and failed turns. Only `feedback`
/// is ever updated after the fact.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Conversation this turn belongs to
    pub chat_id: Uuid,
    pub question: String,
    pub response: String,
    /// Sources in retrieval rank order. Empty for rejected and failed turns.
    pub retrieved_docs: Vec<SourceRef>,
    /// Wall time from query receipt to answer completion, never negative
    pub latency_ms: i64,
    pub outcome: TurnOutcome,
    pub created_at: DateTime<Utc>,
    /// Free-text feedback, last write wins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Aggregate view over the whole ledger
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuditStats {
    pub total_turns: i64,
    pub answered: i64,
    pub rejected: i64,
    pub failed: i64,
    pub truncated: i64,
    /// Mean latency across all turns, 0.0 when the ledger is empty
    pub avg_latency_ms: f64,
    /// 95th percentile latency, 0 when the ledger is empty
    pub p95_latency_ms: i64,
    /// Turns that received feedback
    pub feedback_count: i64,
}

/// Cursor-based pagination
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    /// Cursor for the next page. None if this is the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether there are more results after this page
    pub has_more: bool,
}
