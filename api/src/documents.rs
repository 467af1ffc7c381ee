use std::sync::Arc;

use chrono::{DateTime, Utc};
use lore_core::documents::{Document, DocumentSummary, IngestDocument, ScoredDocument};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::chunker::TextChunker;
use crate::error::AppError;
use crate::provider::{self, GenerativeProvider};

const PREVIEW_CHARS: usize = 160;

/// Persistence layer for document chunks and their embeddings.
///
/// Ingest splits incoming documents into chunks, embeds every chunk up front,
/// and writes the batch in a single transaction. The embedding column is
/// nullable in the schema, but every row this store writes carries one;
/// similarity search filters on `embedding IS NOT NULL`, so a pending row
/// never ranks.
#[derive(Clone)]
pub struct DocumentStore {
    pool: PgPool,
    provider: Arc<dyn GenerativeProvider>,
    chunker: TextChunker,
    embed_concurrency: usize,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    content: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn into_document(self) -> Document {
        Document {
            id: self.id,
            content: self.content,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: Uuid,
    content: String,
    indexed: bool,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SummaryRow {
    fn into_summary(self) -> DocumentSummary {
        DocumentSummary {
            id: self.id,
            content_chars: self.content.chars().count() as i64,
            preview: preview_of(&self.content),
            indexed: self.indexed,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScoredRow {
    id: Uuid,
    content: String,
    score: f64,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl ScoredRow {
    fn into_scored(self) -> ScoredDocument {
        ScoredDocument {
            id: self.id,
            content: self.content,
            score: self.score,
            metadata: self.metadata,
            created_at: self.created_at,
        }
    }
}

impl DocumentStore {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn GenerativeProvider>,
        chunker: TextChunker,
        embed_concurrency: usize,
    ) -> Self {
        Self {
            pool,
            provider,
            chunker,
            embed_concurrency,
        }
    }

    /// Chunk, embed, and store a batch of documents. Returns the ids of the
    /// stored chunks in input order. All chunks land or none do.
    pub async fn ingest(&self, documents: &[IngestDocument]) -> Result<Vec<Uuid>, AppError> {
        let mut chunks = Vec::new();
        for doc in documents {
            let pieces = self.chunker.split(&doc.content);
            let total = pieces.len();
            let doc_chars = doc.content.chars().count();
            for (index, content) in pieces.into_iter().enumerate() {
                let metadata = chunk_metadata(doc.metadata.as_ref(), index, total, doc_chars);
                chunks.push((content, metadata));
            }
        }

        let texts: Vec<String> = chunks.iter().map(|(content, _)| content.clone()).collect();
        let embeddings =
            provider::embed_batch(self.provider.as_ref(), &texts, self.embed_concurrency).await?;

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(chunks.len());
        for ((content, metadata), embedding) in chunks.into_iter().zip(embeddings) {
            let id = Uuid::now_v7();
            sqlx::query(
                "INSERT INTO documents (id, content, embedding, metadata, created_at, updated_at)
                 VALUES ($1, $2, $3::vector, $4, $5, $5)",
            )
            .bind(id)
            .bind(&content)
            .bind(vector_literal(&embedding))
            .bind(&metadata)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;

        tracing::info!(
            documents = documents.len(),
            chunks = ids.len(),
            "Ingested documents"
        );
        Ok(ids)
    }

    pub async fn get(&self, id: Uuid) -> Result<Document, AppError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, content, metadata, created_at, updated_at FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_document)
            .ok_or_else(|| not_found(id))
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<DocumentSummary>, AppError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, content, embedding IS NOT NULL AS indexed, metadata, created_at, updated_at
             FROM documents
             ORDER BY created_at DESC, id DESC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SummaryRow::into_summary).collect())
    }

    /// Update content and/or metadata. A content change re-embeds before the
    /// row is touched, so content, embedding, and updated_at change together
    /// in one statement or not at all.
    pub async fn update(
        &self,
        id: Uuid,
        content: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Document, AppError> {
        let Some(content) = content else {
            let row = sqlx::query_as::<_, DocumentRow>(
                "UPDATE documents SET metadata = COALESCE($2, metadata), updated_at = $3
                 WHERE id = $1
                 RETURNING id, content, metadata, created_at, updated_at",
            )
            .bind(id)
            .bind(metadata)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
            return row.map(DocumentRow::into_document).ok_or_else(|| not_found(id));
        };

        let embedding = self.provider.embed(content).await?;
        let row = sqlx::query_as::<_, DocumentRow>(
            "UPDATE documents
             SET content = $2, embedding = $3::vector, metadata = COALESCE($4, metadata), updated_at = $5
             WHERE id = $1
             RETURNING id, content, metadata, created_at, updated_at",
        )
        .bind(id)
        .bind(content)
        .bind(vector_literal(&embedding))
        .bind(metadata)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_document).ok_or_else(|| not_found(id))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Rank stored chunks by cosine similarity to the query vector,
    /// descending, with recency breaking ties. `min_score` keeps only results
    /// strictly above the floor; `filter` restricts to chunks whose metadata
    /// contains the given document.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        k: i64,
        min_score: Option<f64>,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<ScoredDocument>, AppError> {
        let rows = sqlx::query_as::<_, ScoredRow>(
            "SELECT id, content, metadata, created_at,
                    1 - (embedding <=> $1::vector) AS score
             FROM documents
             WHERE embedding IS NOT NULL
               AND ($3::jsonb IS NULL OR metadata @> $3)
               AND ($4::float8 IS NULL OR 1 - (embedding <=> $1::vector) > $4)
             ORDER BY embedding <=> $1::vector ASC, created_at DESC, id DESC
             LIMIT $2",
        )
        .bind(vector_literal(query_embedding))
        .bind(k)
        .bind(filter)
        .bind(min_score)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ScoredRow::into_scored).collect())
    }
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound {
        resource: format!("document {id}"),
    }
}

/// pgvector accepts the `[x,y,z]` text form cast with `::vector`, which keeps
/// the wire format independent of any client-side vector type.
fn vector_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(|value| value.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Chunk rows inherit the parent document's metadata plus position fields, so
/// a filter written against the source document still matches every chunk.
fn chunk_metadata(
    base: Option<&serde_json::Value>,
    index: usize,
    total: usize,
    doc_chars: usize,
) -> serde_json::Value {
    let mut map = match base {
        Some(serde_json::Value::Object(object)) => object.clone(),
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
        None => serde_json::Map::new(),
    };
    map.insert("chunk_index".to_string(), json!(index));
    map.insert("total_chunks".to_string(), json!(total));
    map.insert("original_doc_length".to_string(), json!(doc_chars));
    serde_json::Value::Object(map)
}

fn preview_of(content: &str) -> String {
    let mut preview: String = content.chars().take(PREVIEW_CHARS).collect();
    if content.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::provider::{ProviderError, TokenStream};

    #[test]
    fn vector_literal_uses_bracketed_form() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn chunk_metadata_merges_object_bases() {
        let base = json!({"source": "wiki", "lang": "en"});
        let metadata = chunk_metadata(Some(&base), 1, 3, 2500);

        assert_eq!(metadata["source"], "wiki");
        assert_eq!(metadata["lang"], "en");
        assert_eq!(metadata["chunk_index"], 1);
        assert_eq!(metadata["total_chunks"], 3);
        assert_eq!(metadata["original_doc_length"], 2500);
    }

    #[test]
    fn chunk_metadata_wraps_scalar_bases() {
        let base = json!("just a tag");
        let metadata = chunk_metadata(Some(&base), 0, 1, 10);
        assert_eq!(metadata["value"], "just a tag");
        assert_eq!(metadata["chunk_index"], 0);
    }

    #[test]
    fn previews_are_capped_with_an_ellipsis() {
        assert_eq!(preview_of("short"), "short");

        let long = "x".repeat(PREVIEW_CHARS + 40);
        let preview = preview_of(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
    }

    /// Deterministic embedder for database tests: same text, same vector.
    struct HashEmbedder;

    #[async_trait::async_trait]
    impl GenerativeProvider for HashEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            let mut values = vec![0.0f32; 768];
            for (position, byte) in text.bytes().enumerate() {
                values[(byte as usize * 31 + position) % 768] += 1.0;
            }
            let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt().max(1.0e-6);
            Ok(values.into_iter().map(|v| v / norm).collect())
        }

        async fn generate(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            Ok("unused".to_string())
        }

        async fn generate_stream(
            &self,
            _system: &str,
            _prompt: &str,
        ) -> Result<TokenStream, ProviderError> {
            Ok(futures::stream::iter(vec![Ok("unused".to_string())]).boxed())
        }
    }

    async fn store_if_available() -> Option<DocumentStore> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return None;
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()?;
        sqlx::migrate!("../migrations").run(&pool).await.ok()?;
        Some(DocumentStore::new(
            pool,
            Arc::new(HashEmbedder),
            TextChunker::new(400, 80),
            2,
        ))
    }

    fn marked(content: &str, run_id: Uuid) -> IngestDocument {
        IngestDocument {
            content: content.to_string(),
            metadata: Some(json!({ "test_run": run_id })),
        }
    }

    #[tokio::test]
    async fn ingest_then_search_ranks_exact_content_first() {
        let Some(store) = store_if_available().await else {
            return;
        };
        let run_id = Uuid::now_v7();
        let marker = json!({ "test_run": run_id });

        store
            .ingest(&[
                marked("Paris is the capital of France.", run_id),
                marked("Berlin is the capital of Germany.", run_id),
            ])
            .await
            .unwrap();

        let query = HashEmbedder
            .embed("Paris is the capital of France.")
            .await
            .unwrap();
        let results = store.search(&query, 5, None, Some(&marker)).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].content.contains("Paris"));
        assert!(results[0].score >= 0.999, "score was {}", results[0].score);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn update_reembeds_and_bumps_updated_at() {
        let Some(store) = store_if_available().await else {
            return;
        };
        let run_id = Uuid::now_v7();
        let marker = json!({ "test_run": run_id });

        let ids = store
            .ingest(&[marked("The first version of this note.", run_id)])
            .await
            .unwrap();
        let before = store.get(ids[0]).await.unwrap();

        let updated = store
            .update(ids[0], Some("A completely rewritten note."), None)
            .await
            .unwrap();
        assert_eq!(updated.content, "A completely rewritten note.");
        assert!(updated.updated_at > before.updated_at);

        let query = HashEmbedder
            .embed("A completely rewritten note.")
            .await
            .unwrap();
        let results = store.search(&query, 1, None, Some(&marker)).await.unwrap();
        assert_eq!(results[0].id, ids[0]);
        assert!(results[0].score >= 0.999);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let Some(store) = store_if_available().await else {
            return;
        };
        let run_id = Uuid::now_v7();

        let ids = store
            .ingest(&[marked("Soon to be removed.", run_id)])
            .await
            .unwrap();
        store.delete(ids[0]).await.unwrap();

        assert!(matches!(
            store.get(ids[0]).await,
            Err(AppError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete(ids[0]).await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn search_honors_k_and_metadata_filter() {
        let Some(store) = store_if_available().await else {
            return;
        };
        let run_id = Uuid::now_v7();
        let marker = json!({ "test_run": run_id });

        store
            .ingest(&[
                marked("Alpha fact about storage.", run_id),
                marked("Beta fact about storage.", run_id),
                marked("Gamma fact about storage.", run_id),
            ])
            .await
            .unwrap();

        let query = HashEmbedder.embed("storage facts").await.unwrap();
        let capped = store.search(&query, 2, None, Some(&marker)).await.unwrap();
        assert!(capped.len() <= 2);

        let other_marker = json!({ "test_run": Uuid::now_v7() });
        let unmatched = store
            .search(&query, 5, None, Some(&other_marker))
            .await
            .unwrap();
        assert!(unmatched.is_empty());
    }

    #[tokio::test]
    async fn rows_without_embeddings_never_rank() {
        let Some(store) = store_if_available().await else {
            return;
        };
        let run_id = Uuid::now_v7();
        let marker = json!({ "test_run": run_id });

        let pending_id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO documents (id, content, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, now(), now())",
        )
        .bind(pending_id)
        .bind("A row that was never embedded.")
        .bind(&marker)
        .execute(&store.pool)
        .await
        .unwrap();

        let query = HashEmbedder
            .embed("A row that was never embedded.")
            .await
            .unwrap();
        let results = store.search(&query, 10, None, Some(&marker)).await.unwrap();
        assert!(results.iter().all(|doc| doc.id != pending_id));
    }
}
