use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use lore_core::documents::{
    Document, DocumentSummary, IngestRequest, IngestResponse, SearchResponse,
    UpdateDocumentRequest,
};
use lore_core::error::ApiError;

use crate::error::AppError;
use crate::state::AppState;

const MAX_BATCH_DOCUMENTS: usize = 100;
const MAX_SEARCH_K: i64 = 20;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/knowledge",
            get(list_documents).post(ingest_documents),
        )
        .route("/api/knowledge/search", get(search_documents))
        .route(
            "/api/knowledge/{id}",
            get(get_document)
                .patch(update_document)
                .delete(delete_document),
        )
}

fn validate_ingest(req: &IngestRequest) -> Result<(), AppError> {
    if req.documents.is_empty() {
        return Err(AppError::Validation {
            message: "documents array must not be empty".to_string(),
            field: Some("documents".to_string()),
            received: None,
            docs_hint: Some("Provide at least one document to ingest".to_string()),
        });
    }

    if req.documents.len() > MAX_BATCH_DOCUMENTS {
        return Err(AppError::Validation {
            message: format!(
                "Batch size {} exceeds maximum of {}",
                req.documents.len(),
                MAX_BATCH_DOCUMENTS
            ),
            field: Some("documents".to_string()),
            received: Some(serde_json::json!(req.documents.len())),
            docs_hint: Some("Split large batches into smaller requests".to_string()),
        });
    }

    for (i, document) in req.documents.iter().enumerate() {
        if document.content.trim().is_empty() {
            return Err(AppError::Validation {
                message: format!("documents[{}]: content must not be empty", i),
                field: Some(format!("documents[{}].content", i)),
                received: None,
                docs_hint: None,
            });
        }
    }

    Ok(())
}

fn validate_update(req: &UpdateDocumentRequest) -> Result<(), AppError> {
    if req.content.is_none() && req.metadata.is_none() {
        return Err(AppError::Validation {
            message: "update must supply content and/or metadata".to_string(),
            field: None,
            received: None,
            docs_hint: Some(
                "Send `content` to re-embed the record, `metadata` to replace its metadata, \
                 or both"
                    .to_string(),
            ),
        });
    }

    if let Some(content) = &req.content {
        if content.trim().is_empty() {
            return Err(AppError::Validation {
                message: "content must not be empty".to_string(),
                field: Some("content".to_string()),
                received: None,
                docs_hint: Some("Use DELETE to remove a record".to_string()),
            });
        }
    }

    Ok(())
}

/// Shared by search and chat: queries are embedded, so an empty or oversize
/// one is rejected before any provider call.
pub(crate) fn validate_query(query: &str, max_chars: usize) -> Result<(), AppError> {
    if query.trim().is_empty() {
        return Err(AppError::Validation {
            message: "query must not be empty".to_string(),
            field: Some("query".to_string()),
            received: None,
            docs_hint: None,
        });
    }

    let chars = query.chars().count();
    if chars > max_chars {
        return Err(AppError::Validation {
            message: format!("query length {} exceeds maximum of {} characters", chars, max_chars),
            field: Some("query".to_string()),
            received: Some(serde_json::json!(chars)),
            docs_hint: Some("Shorten the query or raise MAX_INPUT_CHARS".to_string()),
        });
    }

    Ok(())
}

fn validate_search(params: &SearchParams, max_chars: usize) -> Result<(), AppError> {
    validate_query(&params.query, max_chars)?;

    if let Some(k) = params.k {
        if !(1..=MAX_SEARCH_K).contains(&k) {
            return Err(AppError::Validation {
                message: format!("k must be between 1 and {}", MAX_SEARCH_K),
                field: Some("k".to_string()),
                received: Some(serde_json::json!(k)),
                docs_hint: None,
            });
        }
    }

    if let Some(min_score) = params.min_score {
        if !(-1.0..=1.0).contains(&min_score) {
            return Err(AppError::Validation {
                message: "min_score must be a cosine similarity between -1 and 1".to_string(),
                field: Some("min_score".to_string()),
                received: Some(serde_json::json!(min_score)),
                docs_hint: None,
            });
        }
    }

    Ok(())
}

/// Ingest documents into the knowledge base
///
/// Each document is split into chunks, every chunk is embedded, and the
/// whole batch is written in one transaction. Returns the stored chunk ids
/// in order.
#[utoipa::path(
    post,
    path = "/api/knowledge",
    request_body = IngestRequest,
    responses(
        (status = 201, description = "Documents ingested", body = IngestResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 503, description = "Embedding provider unavailable", body = ApiError)
    ),
    tag = "knowledge"
)]
pub async fn ingest_documents(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_ingest(&req)?;

    let document_ids = state.store.ingest(&req.documents).await?;
    let response = IngestResponse {
        documents_ingested: req.documents.len(),
        document_ids,
    };

    Ok((StatusCode::CREATED, Json(response)))
}

/// Query parameters for listing documents
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListParams {
    /// Maximum number of records to return (default 50, max 200)
    #[serde(default)]
    pub limit: Option<i64>,
}

/// List stored records, newest first
#[utoipa::path(
    get,
    path = "/api/knowledge",
    params(ListParams),
    responses(
        (status = 200, description = "Record summaries", body = Vec<DocumentSummary>)
    ),
    tag = "knowledge"
)]
pub async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DocumentSummary>>, AppError> {
    let limit = params.limit.unwrap_or(50).min(200).max(1);
    let summaries = state.store.list(limit).await?;
    Ok(Json(summaries))
}

/// Query parameters for similarity search
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct SearchParams {
    /// Natural-language query to embed and match
    pub query: String,
    /// Result count (default from configuration, max 20)
    #[serde(default)]
    pub k: Option<i64>,
    /// Similarity floor; results must score strictly above it
    #[serde(default)]
    pub min_score: Option<f64>,
}

/// Similarity search over the knowledge base
///
/// Embeds the query and ranks indexed records by cosine similarity.
/// Records still awaiting an embedding never appear.
#[utoipa::path(
    get,
    path = "/api/knowledge/search",
    params(SearchParams),
    responses(
        (status = 200, description = "Ranked matches", body = SearchResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 503, description = "Embedding provider unavailable", body = ApiError)
    ),
    tag = "knowledge"
)]
pub async fn search_documents(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    validate_search(&params, state.config.max_input_chars)?;

    let k = params.k.unwrap_or(state.config.retrieval_top_k as i64);
    let min_score = params.min_score.unwrap_or(state.config.min_similarity);

    let embedding = state.provider.embed(&params.query).await?;
    let results = state
        .store
        .search(&embedding, k, Some(min_score), None)
        .await?;

    Ok(Json(SearchResponse {
        query: params.query,
        count: results.len(),
        results,
    }))
}

/// Fetch one stored record
#[utoipa::path(
    get,
    path = "/api/knowledge/{id}",
    params(("id" = Uuid, Path, description = "Record id")),
    responses(
        (status = 200, description = "The record", body = Document),
        (status = 404, description = "No such record", body = ApiError)
    ),
    tag = "knowledge"
)]
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Document>, AppError> {
    let document = state.store.get(id).await?;
    Ok(Json(document))
}

/// Update a stored record
///
/// New content triggers re-embedding before the row is replaced; the record
/// never holds content and an embedding that disagree.
#[utoipa::path(
    patch,
    path = "/api/knowledge/{id}",
    params(("id" = Uuid, Path, description = "Record id")),
    request_body = UpdateDocumentRequest,
    responses(
        (status = 200, description = "Updated record", body = Document),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 404, description = "No such record", body = ApiError),
        (status = 503, description = "Embedding provider unavailable", body = ApiError)
    ),
    tag = "knowledge"
)]
pub async fn update_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateDocumentRequest>,
) -> Result<Json<Document>, AppError> {
    validate_update(&req)?;

    let document = state
        .store
        .update(id, req.content.as_deref(), req.metadata.as_ref())
        .await?;

    Ok(Json(document))
}

/// Delete a stored record
#[utoipa::path(
    delete,
    path = "/api/knowledge/{id}",
    params(("id" = Uuid, Path, description = "Record id")),
    responses(
        (status = 204, description = "Record deleted"),
        (status = 404, description = "No such record", body = ApiError)
    ),
    tag = "knowledge"
)]
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.store.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use lore_core::documents::IngestDocument;

    use super::*;

    fn ingest_request(contents: &[&str]) -> IngestRequest {
        IngestRequest {
            documents: contents
                .iter()
                .map(|content| IngestDocument {
                    content: content.to_string(),
                    metadata: None,
                })
                .collect(),
        }
    }

    #[test]
    fn empty_batch_is_rejected() {
        let err = validate_ingest(&ingest_request(&[])).unwrap_err();
        match err {
            AppError::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("documents"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let contents: Vec<String> = (0..101).map(|i| format!("doc {i}")).collect();
        let refs: Vec<&str> = contents.iter().map(String::as_str).collect();

        assert!(validate_ingest(&ingest_request(&refs)).is_err());
        assert!(validate_ingest(&ingest_request(&refs[..100])).is_ok());
    }

    #[test]
    fn blank_document_is_rejected_with_its_index() {
        let err = validate_ingest(&ingest_request(&["fine", "   "])).unwrap_err();
        match err {
            AppError::Validation { message, field, .. } => {
                assert_eq!(message, "documents[1]: content must not be empty");
                assert_eq!(field.as_deref(), Some("documents[1].content"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn update_with_no_fields_is_rejected() {
        let req = UpdateDocumentRequest {
            content: None,
            metadata: None,
        };
        assert!(validate_update(&req).is_err());

        let req = UpdateDocumentRequest {
            content: None,
            metadata: Some(serde_json::json!({"source": "geo"})),
        };
        assert!(validate_update(&req).is_ok());
    }

    #[test]
    fn update_cannot_blank_content() {
        let req = UpdateDocumentRequest {
            content: Some("  ".to_string()),
            metadata: None,
        };
        assert!(validate_update(&req).is_err());
    }

    #[test]
    fn queries_are_bounded() {
        assert!(validate_query("what is this?", 100).is_ok());
        assert!(validate_query("", 100).is_err());
        assert!(validate_query("   ", 100).is_err());
        assert!(validate_query(&"x".repeat(101), 100).is_err());
        assert!(validate_query(&"x".repeat(100), 100).is_ok());
    }

    #[test]
    fn search_k_and_min_score_are_bounded() {
        let base = SearchParams {
            query: "anything".to_string(),
            k: None,
            min_score: None,
        };

        assert!(validate_search(&base, 100).is_ok());
        assert!(
            validate_search(
                &SearchParams {
                    k: Some(0),
                    query: base.query.clone(),
                    min_score: None,
                },
                100
            )
            .is_err()
        );
        assert!(
            validate_search(
                &SearchParams {
                    k: Some(21),
                    query: base.query.clone(),
                    min_score: None,
                },
                100
            )
            .is_err()
        );
        assert!(
            validate_search(
                &SearchParams {
                    k: Some(20),
                    query: base.query.clone(),
                    min_score: Some(1.5),
                },
                100
            )
            .is_err()
        );
        assert!(
            validate_search(
                &SearchParams {
                    k: Some(20),
                    query: base.query,
                    min_score: Some(0.5),
                },
                100
            )
            .is_ok()
        );
    }
}
