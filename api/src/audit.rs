use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use lore_core::audit::{AuditRecord, AuditStats, PaginatedResponse, TurnOutcome};
use lore_core::chat::SourceRef;

use crate::error::AppError;

/// Everything one chat turn leaves behind. The ledger assigns the row id
/// and creation timestamp on insert.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub chat_id: Uuid,
    pub question: String,
    pub response: String,
    /// Rank order preserved as JSON array order
    pub retrieved_docs: Vec<SourceRef>,
    pub latency_ms: i64,
    pub outcome: TurnOutcome,
}

/// Audit writes go through this seam so the chat service can be exercised
/// without Postgres.
#[async_trait]
pub trait TurnRecorder: Send + Sync {
    async fn record(&self, entry: NewAuditEntry) -> Result<Uuid, AppError>;
}

/// Append-only turn ledger over `audit_logs`. Every completed chat turn
/// inserts exactly one row, including rejected and failed turns; only the
/// `feedback` column is ever updated afterwards.
#[derive(Clone)]
pub struct AuditLedger {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    chat_id: Uuid,
    question: String,
    response: String,
    retrieved_docs: serde_json::Value,
    latency_ms: i64,
    outcome: String,
    created_at: DateTime<Utc>,
    feedback: Option<String>,
}

impl AuditRow {
    fn into_record(self) -> AuditRecord {
        AuditRecord {
            id: self.id,
            chat_id: self.chat_id,
            question: self.question,
            response: self.response,
            retrieved_docs: serde_json::from_value(self.retrieved_docs).unwrap_or_default(),
            // The schema CHECK keeps outcome labels known; anything else
            // reads as a failed turn rather than poisoning the listing.
            outcome: self.outcome.parse().unwrap_or(TurnOutcome::Failed),
            latency_ms: self.latency_ms,
            created_at: self.created_at,
            feedback: self.feedback,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    total_turns: i64,
    answered: i64,
    rejected: i64,
    failed: i64,
    truncated: i64,
    avg_latency_ms: f64,
    p95_latency_ms: i64,
    feedback_count: i64,
}

impl StatsRow {
    fn into_stats(self) -> AuditStats {
        AuditStats {
            total_turns: self.total_turns,
            answered: self.answered,
            rejected: self.rejected,
            failed: self.failed,
            truncated: self.truncated,
            avg_latency_ms: self.avg_latency_ms,
            p95_latency_ms: self.p95_latency_ms,
            feedback_count: self.feedback_count,
        }
    }
}

impl AuditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attach feedback to the most recent turn of a conversation.
    /// Last write wins; never creates a row.
    pub async fn add_feedback(&self, chat_id: Uuid, feedback: &str) -> Result<Uuid, AppError> {
        let updated = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE audit_logs
            SET feedback = $2
            WHERE id = (
                SELECT id FROM audit_logs
                WHERE chat_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT 1
            )
            RETURNING id
            "#,
        )
        .bind(chat_id)
        .bind(feedback)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or_else(|| AppError::NotFound {
            resource: format!("audit trail for chat {}", chat_id),
        })
    }

    /// Most recent turn of a conversation, newest by (created_at, id).
    pub async fn latest_for_chat(&self, chat_id: Uuid) -> Result<AuditRecord, AppError> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, chat_id, question, response, retrieved_docs,
                   latency_ms, outcome, created_at, feedback
            FROM audit_logs
            WHERE chat_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AuditRow::into_record)
            .ok_or_else(|| AppError::NotFound {
                resource: format!("audit trail for chat {}", chat_id),
            })
    }

    /// List the ledger newest first with cursor pagination. Ordered by
    /// (created_at DESC, id DESC) so the cursor stays stable while new
    /// turns append.
    pub async fn list(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<AuditRecord>, AppError> {
        // Fetch one extra to determine has_more
        let fetch_limit = limit + 1;

        let rows = if let Some(cursor) = cursor {
            let cursor = decode_cursor(cursor)?;
            sqlx::query_as::<_, AuditRow>(
                r#"
                SELECT id, chat_id, question, response, retrieved_docs,
                       latency_ms, outcome, created_at, feedback
                FROM audit_logs
                WHERE (created_at, id) < ($1, $2)
                ORDER BY created_at DESC, id DESC
                LIMIT $3
                "#,
            )
            .bind(cursor.created_at)
            .bind(cursor.id)
            .bind(fetch_limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, AuditRow>(
                r#"
                SELECT id, chat_id, question, response, retrieved_docs,
                       latency_ms, outcome, created_at, feedback
                FROM audit_logs
                ORDER BY created_at DESC, id DESC
                LIMIT $1
                "#,
            )
            .bind(fetch_limit)
            .fetch_all(&self.pool)
            .await?
        };

        let has_more = rows.len() as i64 > limit;
        let records: Vec<AuditRecord> = rows
            .into_iter()
            .take(limit as usize)
            .map(AuditRow::into_record)
            .collect();

        let next_cursor = if has_more {
            records.last().map(|r| encode_cursor(&r.created_at, &r.id))
        } else {
            None
        };

        Ok(PaginatedResponse {
            data: records,
            next_cursor,
            has_more,
        })
    }

    /// Aggregate view over the whole ledger in a single query.
    pub async fn stats(&self) -> Result<AuditStats, AppError> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                COUNT(*) AS total_turns,
                COUNT(*) FILTER (WHERE outcome = 'answered') AS answered,
                COUNT(*) FILTER (WHERE outcome = 'rejected') AS rejected,
                COUNT(*) FILTER (WHERE outcome = 'failed') AS failed,
                COUNT(*) FILTER (WHERE outcome = 'truncated') AS truncated,
                COALESCE(AVG(latency_ms), 0)::float8 AS avg_latency_ms,
                COALESCE(
                    PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY latency_ms), 0
                )::bigint AS p95_latency_ms,
                COUNT(feedback) AS feedback_count
            FROM audit_logs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_stats())
    }
}

#[async_trait]
impl TurnRecorder for AuditLedger {
    async fn record(&self, entry: NewAuditEntry) -> Result<Uuid, AppError> {
        let id = Uuid::now_v7();
        let retrieved_docs = serde_json::to_value(&entry.retrieved_docs)
            .map_err(|e| AppError::Internal(format!("Failed to serialize sources: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (id, chat_id, question, response, retrieved_docs, latency_ms, outcome, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(entry.chat_id)
        .bind(&entry.question)
        .bind(&entry.response)
        .bind(&retrieved_docs)
        .bind(entry.latency_ms)
        .bind(entry.outcome.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }
}

/// Cursors encode "created_at\0id" in URL-safe base64, opaque to the client.
fn encode_cursor(created_at: &DateTime<Utc>, id: &Uuid) -> String {
    use base64::Engine;
    let raw = format!("{}\0{}", created_at.to_rfc3339(), id);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

#[derive(Debug)]
struct CursorData {
    created_at: DateTime<Utc>,
    id: Uuid,
}

fn decode_cursor(cursor: &str) -> Result<CursorData, AppError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| AppError::Validation {
            message: "Invalid cursor format".to_string(),
            field: Some("cursor".to_string()),
            received: Some(serde_json::Value::String(cursor.to_string())),
            docs_hint: Some("Use the next_cursor value from a previous response".to_string()),
        })?;

    let s = String::from_utf8(bytes).map_err(|_| AppError::Validation {
        message: "Invalid cursor encoding".to_string(),
        field: Some("cursor".to_string()),
        received: None,
        docs_hint: None,
    })?;

    let parts: Vec<&str> = s.splitn(2, '\0').collect();
    if parts.len() != 2 {
        return Err(AppError::Validation {
            message: "Invalid cursor structure".to_string(),
            field: Some("cursor".to_string()),
            received: None,
            docs_hint: Some("Use the next_cursor value from a previous response".to_string()),
        });
    }

    let created_at = DateTime::parse_from_rfc3339(parts[0])
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| AppError::Validation {
            message: "Invalid cursor timestamp".to_string(),
            field: Some("cursor".to_string()),
            received: None,
            docs_hint: None,
        })?;

    let id = Uuid::parse_str(parts[1]).map_err(|_| AppError::Validation {
        message: "Invalid cursor id".to_string(),
        field: Some("cursor".to_string()),
        received: None,
        docs_hint: None,
    })?;

    Ok(CursorData { created_at, id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let created_at = Utc::now();
        let id = Uuid::now_v7();

        let decoded = decode_cursor(&encode_cursor(&created_at, &id)).unwrap();

        assert_eq!(decoded.created_at, created_at);
        assert_eq!(decoded.id, id);
    }

    #[test]
    fn garbage_cursor_is_a_validation_error() {
        let err = decode_cursor("not/valid/base64!").unwrap_err();
        match err {
            AppError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("cursor")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn cursor_without_separator_is_rejected() {
        use base64::Engine;
        let cursor = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"no-separator");

        let err = decode_cursor(&cursor).unwrap_err();
        match err {
            AppError::Validation { message, .. } => {
                assert_eq!(message, "Invalid cursor structure");
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_outcome_rows_read_as_failed() {
        let row = AuditRow {
            id: Uuid::now_v7(),
            chat_id: Uuid::now_v7(),
            question: "q".to_string(),
            response: "a".to_string(),
            retrieved_docs: serde_json::json!([]),
            latency_ms: 10,
            outcome: "exploded".to_string(),
            created_at: Utc::now(),
            feedback: None,
        };

        assert_eq!(row.into_record().outcome, TurnOutcome::Failed);
    }

    // The tests below exercise the real ledger and are skipped unless
    // DATABASE_URL points at a migrated Postgres with pgvector.

    async fn ledger_if_available() -> Option<AuditLedger> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return None;
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()?;
        sqlx::migrate!("../migrations").run(&pool).await.ok()?;
        Some(AuditLedger::new(pool))
    }

    fn entry(chat_id: Uuid, question: &str, outcome: TurnOutcome) -> NewAuditEntry {
        NewAuditEntry {
            chat_id,
            question: question.to_string(),
            response: format!("answer to {question}"),
            retrieved_docs: vec![SourceRef {
                document_id: Uuid::now_v7(),
                score: 0.9,
            }],
            latency_ms: 42,
            outcome,
        }
    }

    #[tokio::test]
    async fn record_then_latest_round_trips() {
        let Some(ledger) = ledger_if_available().await else {
            return;
        };
        let chat_id = Uuid::now_v7();

        ledger
            .record(entry(chat_id, "first", TurnOutcome::Answered))
            .await
            .unwrap();
        let second = entry(chat_id, "second", TurnOutcome::Answered);
        let second_id = ledger.record(second.clone()).await.unwrap();

        let latest = ledger.latest_for_chat(chat_id).await.unwrap();
        assert_eq!(latest.id, second_id);
        assert_eq!(latest.question, "second");
        assert_eq!(latest.outcome, TurnOutcome::Answered);
        assert_eq!(latest.latency_ms, 42);
        assert_eq!(latest.retrieved_docs.len(), 1);
        assert_eq!(
            latest.retrieved_docs[0].document_id,
            second.retrieved_docs[0].document_id
        );
        assert!(latest.feedback.is_none());

        let missing = ledger.latest_for_chat(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(missing, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn feedback_updates_the_latest_turn_and_last_write_wins() {
        let Some(ledger) = ledger_if_available().await else {
            return;
        };
        let chat_id = Uuid::now_v7();

        ledger
            .record(entry(chat_id, "older", TurnOutcome::Answered))
            .await
            .unwrap();
        let newest_id = ledger
            .record(entry(chat_id, "newer", TurnOutcome::Rejected))
            .await
            .unwrap();

        let first = ledger.add_feedback(chat_id, "too vague").await.unwrap();
        let second = ledger.add_feedback(chat_id, "much better").await.unwrap();
        assert_eq!(first, newest_id);
        assert_eq!(second, newest_id);

        let latest = ledger.latest_for_chat(chat_id).await.unwrap();
        assert_eq!(latest.feedback.as_deref(), Some("much better"));

        let missing = ledger
            .add_feedback(Uuid::now_v7(), "nobody home")
            .await
            .unwrap_err();
        assert!(matches!(missing, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_walks_pages_with_the_cursor() {
        let Some(ledger) = ledger_if_available().await else {
            return;
        };
        let chat_id = Uuid::now_v7();

        let mut expected = Vec::new();
        for i in 0..3 {
            let id = ledger
                .record(entry(chat_id, &format!("question {i}"), TurnOutcome::Answered))
                .await
                .unwrap();
            expected.push(id);
        }

        // The ledger is shared, so walk pages until all three marked rows
        // have been seen rather than asserting exact page contents.
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..50 {
            let page = ledger.list(2, cursor.as_deref()).await.unwrap();
            assert!(page.data.len() <= 2);
            seen.extend(
                page.data
                    .iter()
                    .filter(|r| r.chat_id == chat_id)
                    .map(|r| r.id),
            );
            if seen.len() == expected.len() || !page.has_more {
                break;
            }
            assert!(page.next_cursor.is_some());
            cursor = page.next_cursor;
        }

        expected.reverse(); // listing is newest first
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn stats_reflect_recorded_turns() {
        let Some(ledger) = ledger_if_available().await else {
            return;
        };
        let before = ledger.stats().await.unwrap();

        let chat_id = Uuid::now_v7();
        ledger
            .record(entry(chat_id, "fine", TurnOutcome::Answered))
            .await
            .unwrap();
        ledger
            .record(entry(chat_id, "not fine", TurnOutcome::Rejected))
            .await
            .unwrap();
        ledger.add_feedback(chat_id, "noted").await.unwrap();

        let after = ledger.stats().await.unwrap();
        assert!(after.total_turns >= before.total_turns + 2);
        assert!(after.answered >= before.answered + 1);
        assert!(after.rejected >= before.rejected + 1);
        assert!(after.feedback_count >= before.feedback_count + 1);
        assert!(after.avg_latency_ms >= 0.0);
        assert!(after.p95_latency_ms >= 0);
    }
}
