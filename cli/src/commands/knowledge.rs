use clap::{Args, Subcommand};
use serde_json::json;
use uuid::Uuid;

use crate::util::{api_request, exit_error, read_json_from_file};

#[derive(Subcommand)]
pub enum KnowledgeCommands {
    /// Ingest one or more documents into the knowledge base
    Add(KnowledgeAddArgs),
    /// List stored documents (newest first)
    List {
        /// Max items to return (default: 50)
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Similarity search over the knowledge base
    Search {
        /// Search query text
        query: String,
        /// Number of results to return
        #[arg(long)]
        k: Option<i64>,
        /// Minimum cosine similarity to include (-1 to 1)
        #[arg(long)]
        min_score: Option<f64>,
    },
    /// Show one document
    Get {
        /// Document id
        id: Uuid,
    },
    /// Update a document's content and/or metadata (re-embeds on content change)
    Update {
        /// Document id
        id: Uuid,
        /// Replacement content
        #[arg(long)]
        content: Option<String>,
        /// Replacement metadata as JSON string
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Delete a document
    Delete {
        /// Document id
        id: Uuid,
    },
}

#[derive(Args)]
pub struct KnowledgeAddArgs {
    /// Document content to ingest
    #[arg(long, required_unless_present = "file")]
    pub content: Option<String>,
    /// Document metadata as JSON string
    #[arg(long)]
    pub metadata: Option<String>,
    /// Read documents from a JSON file (use '-' for stdin)
    #[arg(long, short = 'f', conflicts_with = "content")]
    pub file: Option<String>,
}

pub async fn run(api_url: &str, command: KnowledgeCommands) -> i32 {
    match command {
        KnowledgeCommands::Add(args) => add(api_url, args).await,
        KnowledgeCommands::List { limit } => list(api_url, limit).await,
        KnowledgeCommands::Search {
            query,
            k,
            min_score,
        } => search(api_url, &query, k, min_score).await,
        KnowledgeCommands::Get { id } => get(api_url, id).await,
        KnowledgeCommands::Update {
            id,
            content,
            metadata,
        } => update(api_url, id, content, metadata).await,
        KnowledgeCommands::Delete { id } => delete(api_url, id).await,
    }
}

fn parse_metadata(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        exit_error(
            &format!("Invalid JSON in --metadata: {e}"),
            Some("Provide valid JSON for --metadata"),
        )
    })
}

/// Accepts either the request shape (`{"documents": [...]}`) or a bare array
/// of documents, which gets wrapped.
fn documents_body(value: serde_json::Value) -> serde_json::Value {
    if value.is_array() {
        return json!({ "documents": value });
    }
    if value.get("documents").is_some() {
        return value;
    }
    exit_error(
        "JSON must be an array of documents or an object with a \"documents\" field",
        Some(r#"Each document is {"content": "...", "metadata": {...}}"#),
    );
}

async fn add(api_url: &str, args: KnowledgeAddArgs) -> i32 {
    let body = if let Some(path) = args.file.as_deref() {
        let value = read_json_from_file(path).unwrap_or_else(|e| {
            exit_error(
                &e,
                Some("Provide a valid JSON file for --file (or '-' for stdin)"),
            )
        });
        documents_body(value)
    } else {
        let mut document = json!({
            "content": args.content,
        });
        if let Some(metadata) = args.metadata.as_deref() {
            document["metadata"] = parse_metadata(metadata);
        }
        json!({ "documents": [document] })
    };
    api_request(
        api_url,
        reqwest::Method::POST,
        "/api/knowledge",
        Some(body),
        &[],
    )
    .await
}

async fn list(api_url: &str, limit: Option<i64>) -> i32 {
    let mut query = Vec::new();
    if let Some(limit) = limit {
        query.push(("limit".to_string(), limit.to_string()));
    }
    api_request(api_url, reqwest::Method::GET, "/api/knowledge", None, &query).await
}

async fn search(api_url: &str, text: &str, k: Option<i64>, min_score: Option<f64>) -> i32 {
    let mut query = vec![("query".to_string(), text.to_string())];
    if let Some(k) = k {
        query.push(("k".to_string(), k.to_string()));
    }
    if let Some(min_score) = min_score {
        query.push(("min_score".to_string(), min_score.to_string()));
    }
    api_request(
        api_url,
        reqwest::Method::GET,
        "/api/knowledge/search",
        None,
        &query,
    )
    .await
}

async fn get(api_url: &str, id: Uuid) -> i32 {
    let path = format!("/api/knowledge/{id}");
    api_request(api_url, reqwest::Method::GET, &path, None, &[]).await
}

async fn update(
    api_url: &str,
    id: Uuid,
    content: Option<String>,
    metadata: Option<String>,
) -> i32 {
    if content.is_none() && metadata.is_none() {
        exit_error(
            "Either --content or --metadata is required",
            Some("Provide the fields to update."),
        );
    }
    let mut body = json!({});
    if let Some(content) = content {
        body["content"] = json!(content);
    }
    if let Some(metadata) = metadata.as_deref() {
        body["metadata"] = parse_metadata(metadata);
    }
    let path = format!("/api/knowledge/{id}");
    api_request(api_url, reqwest::Method::PATCH, &path, Some(body), &[]).await
}

async fn delete(api_url: &str, id: Uuid) -> i32 {
    let path = format!("/api/knowledge/{id}");
    api_request(api_url, reqwest::Method::DELETE, &path, None, &[]).await
}

#[cfg(test)]
mod tests {
    use super::{documents_body, parse_metadata};
    use serde_json::json;

    #[test]
    fn parse_metadata_accepts_inline_json() {
        let metadata = parse_metadata(r#"{"source": "handbook", "page": 12}"#);
        assert_eq!(metadata, json!({"source": "handbook", "page": 12}));
    }

    #[test]
    fn documents_body_wraps_a_bare_array() {
        let body = documents_body(json!([{"content": "a"}, {"content": "b"}]));
        assert_eq!(body["documents"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn documents_body_passes_the_request_shape_through() {
        let body = documents_body(json!({"documents": [{"content": "a"}]}));
        assert_eq!(body["documents"].as_array().map(Vec::len), Some(1));
    }
}
