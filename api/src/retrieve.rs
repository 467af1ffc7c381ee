use std::sync::Arc;

use async_trait::async_trait;
use lore_core::chat::SourceRef;
use uuid::Uuid;

use crate::documents::DocumentStore;
use crate::error::AppError;
use crate::provider::GenerativeProvider;

/// One chunk pulled back for a query, in rank order, ready to be cited.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub document_id: Uuid,
    pub content: String,
    pub score: f64,
    pub metadata: serde_json::Value,
}

impl RetrievedChunk {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            document_id: self.document_id,
            score: self.score,
        }
    }
}

/// Supplies grounding context for a query. The chat pipeline depends on this
/// seam rather than the store directly, which keeps turn logic testable
/// without a database.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        min_score: f64,
    ) -> Result<Vec<RetrievedChunk>, AppError>;
}

/// Embeds the query and ranks stored chunks against it.
#[derive(Clone)]
pub struct Retriever {
    provider: Arc<dyn GenerativeProvider>,
    store: DocumentStore,
}

impl Retriever {
    pub fn new(provider: Arc<dyn GenerativeProvider>, store: DocumentStore) -> Self {
        Self { provider, store }
    }
}

#[async_trait]
impl ContextSource for Retriever {
    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        min_score: f64,
    ) -> Result<Vec<RetrievedChunk>, AppError> {
        let embedding = self.provider.embed(query).await?;
        let results = self
            .store
            .search(&embedding, k as i64, Some(min_score), None)
            .await?;

        Ok(results
            .into_iter()
            .map(|doc| RetrievedChunk {
                document_id: doc.id,
                content: doc.content,
                score: doc.score,
                metadata: doc.metadata,
            })
            .collect())
    }
}
