use clap::{Parser, Subcommand};
use uuid::Uuid;

mod commands;
mod util;

#[derive(Parser)]
#[command(
    name = "lore",
    version,
    about = "Lorekeeper CLI for the knowledge base, chat, and the audit ledger"
)]
struct Cli {
    /// API base URL
    #[arg(long, env = "LORE_API_URL", default_value = "http://localhost:8000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Knowledge base operations
    Knowledge {
        #[command(subcommand)]
        command: commands::knowledge::KnowledgeCommands,
    },
    /// Ask a question
    Chat {
        /// The question to ask
        query: String,
        /// Continue an existing conversation
        #[arg(long)]
        chat_id: Option<Uuid>,
        /// Stream the answer as it is generated
        #[arg(long)]
        stream: bool,
    },
    /// Attach feedback to a conversation's latest turn
    Feedback {
        /// Conversation id (from a chat response's chat_id)
        chat_id: Uuid,
        /// Free-text feedback
        text: String,
    },
    /// Audit ledger operations
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Health => commands::health::run(&cli.api_url).await,
        Commands::Knowledge { command } => commands::knowledge::run(&cli.api_url, command).await,
        Commands::Chat {
            query,
            chat_id,
            stream,
        } => commands::chat::run(&cli.api_url, &query, chat_id, stream).await,
        Commands::Feedback { chat_id, text } => {
            commands::chat::feedback(&cli.api_url, chat_id, &text).await
        }
        Commands::Audit { command } => commands::audit::run(&cli.api_url, command).await,
    };

    std::process::exit(code);
}
