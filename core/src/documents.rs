use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A stored knowledge record. One record per chunk: ingestion splits source
/// documents, so several records usually share the same `source` metadata.
///
/// The embedding itself never crosses the wire: it is large, opaque to
/// clients, and only meaningful to the similarity index.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Document {
    /// Unique record ID (UUIDv7, time-sortable)
    pub id: Uuid,
    /// The chunk text
    pub content: String,
    /// Open metadata map (source, chunk position, tags, ...)
    pub metadata: serde_json::Value,
    /// When the record was first stored. Immutable.
    pub created_at: DateTime<Utc>,
    /// Bumped on every content or metadata update
    pub updated_at: DateTime<Utc>,
}

/// Listing view of a record; content is summarized, not shipped in full.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DocumentSummary {
    pub id: Uuid,
    /// First characters of the content, for display
    pub preview: String,
    /// Full content length in characters
    pub content_chars: i64,
    /// Whether the record is searchable yet (embedding present)
    pub indexed: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One source document to ingest. It will be chunked and embedded;
/// every resulting record inherits this metadata.
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct IngestDocument {
    pub content: String,
    /// Metadata applied to every chunk of this document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Request to ingest a batch of source documents
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct IngestRequest {
    pub documents: Vec<IngestDocument>,
}

/// Result of an ingestion batch
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngestResponse {
    /// IDs of the stored records, in chunk order
    pub document_ids: Vec<Uuid>,
    /// Number of source documents that were split
    pub documents_ingested: usize,
}

/// Partial update of a stored record. Omitted fields stay untouched;
/// a content change re-embeds the record.
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct UpdateDocumentRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A record matched by similarity search
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ScoredDocument {
    pub id: Uuid,
    pub content: String,
    /// Cosine similarity against the query, in [-1.0, 1.0]. Higher is closer.
    pub score: f64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Response for knowledge search
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SearchResponse {
    pub query: String,
    /// Matches ordered by descending score
    pub results: Vec<ScoredDocument>,
    pub count: usize,
}
