use clap::Subcommand;
use uuid::Uuid;

use crate::util::api_request;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show the latest audit record for a conversation
    Get {
        /// Conversation id
        chat_id: Uuid,
    },
    /// List audit records (newest first)
    List {
        /// Max items per page (default: 50)
        #[arg(long)]
        limit: Option<i64>,
        /// Resume from a previous response's next_cursor
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Aggregate turn counts and latency percentiles
    Stats,
}

pub async fn run(api_url: &str, command: AuditCommands) -> i32 {
    match command {
        AuditCommands::Get { chat_id } => {
            let path = format!("/api/audit/{chat_id}");
            api_request(api_url, reqwest::Method::GET, &path, None, &[]).await
        }
        AuditCommands::List { limit, cursor } => {
            let mut query = Vec::new();
            if let Some(limit) = limit {
                query.push(("limit".to_string(), limit.to_string()));
            }
            if let Some(cursor) = cursor {
                query.push(("cursor".to_string(), cursor));
            }
            api_request(api_url, reqwest::Method::GET, "/api/audit", None, &query).await
        }
        AuditCommands::Stats => {
            api_request(api_url, reqwest::Method::GET, "/api/audit/stats", None, &[]).await
        }
    }
}
