use std::sync::Arc;

use sqlx::PgPool;

use crate::audit::AuditLedger;
use crate::chat::ChatService;
use crate::chunker::TextChunker;
use crate::config::AppConfig;
use crate::documents::DocumentStore;
use crate::provider::GenerativeProvider;
use crate::retrieve::Retriever;
use crate::workflow::TurnSettings;

/// Shared handles for the request path. Everything here is cheap to clone;
/// the provider is held behind `dyn` so tests can swap in fakes.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub provider: Arc<dyn GenerativeProvider>,
    pub store: DocumentStore,
    pub ledger: AuditLedger,
    pub chat: ChatService,
}

impl AppState {
    pub fn new(db: PgPool, config: AppConfig, provider: Arc<dyn GenerativeProvider>) -> Self {
        let chunker = TextChunker::new(config.chunk_size, config.chunk_overlap);
        let store = DocumentStore::new(
            db.clone(),
            provider.clone(),
            chunker,
            config.embed_concurrency,
        );
        let ledger = AuditLedger::new(db.clone());
        let retriever = Retriever::new(provider.clone(), store.clone());
        let chat = ChatService::new(
            provider.clone(),
            Arc::new(retriever),
            Arc::new(ledger.clone()),
            TurnSettings {
                retrieval_top_k: config.retrieval_top_k,
                min_similarity: config.min_similarity,
                max_turn_latency_ms: config.max_turn_latency_ms,
            },
        );

        Self {
            db,
            config: Arc::new(config),
            provider,
            store,
            ledger,
            chat,
        }
    }
}
