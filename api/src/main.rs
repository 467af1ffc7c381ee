use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod audit;
mod chat;
mod chunker;
mod config;
mod documents;
mod error;
mod provider;
mod retrieve;
mod routes;
mod safety;
mod state;
mod synthesis;
mod workflow;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Lorekeeper API",
        version = "0.1.0",
        description = "Grounded question answering over an ingested knowledge base, with a \
                       content-safety gate and a per-turn audit ledger."
    ),
    paths(
        routes::health::health_check,
        routes::knowledge::ingest_documents,
        routes::knowledge::list_documents,
        routes::knowledge::search_documents,
        routes::knowledge::get_document,
        routes::knowledge::update_document,
        routes::knowledge::delete_document,
        routes::chat::chat,
        routes::chat::chat_stream,
        routes::chat::submit_feedback,
        routes::audit::list_audit,
        routes::audit::audit_stats,
        routes::audit::get_audit,
    ),
    components(schemas(
        HealthResponse,
        lore_core::error::ApiError,
        lore_core::documents::Document,
        lore_core::documents::DocumentSummary,
        lore_core::documents::IngestDocument,
        lore_core::documents::IngestRequest,
        lore_core::documents::IngestResponse,
        lore_core::documents::UpdateDocumentRequest,
        lore_core::documents::ScoredDocument,
        lore_core::documents::SearchResponse,
        lore_core::chat::ChatRequest,
        lore_core::chat::ChatResponse,
        lore_core::chat::SourceRef,
        lore_core::chat::StreamEvent,
        lore_core::chat::FeedbackRequest,
        lore_core::chat::FeedbackResponse,
        lore_core::audit::TurnOutcome,
        lore_core::audit::AuditRecord,
        lore_core::audit::AuditStats,
        lore_core::audit::PaginatedResponse<lore_core::audit::AuditRecord>,
    ))
)]
struct ApiDoc;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lore_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let app_config = config::AppConfig::from_env().expect("Invalid configuration");

    let pool = PgPoolOptions::new()
        .max_connections(app_config.db_max_connections)
        .connect(&app_config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let gemini =
        provider::gemini::GeminiClient::new(&app_config).expect("Failed to build Gemini client");

    let app_state = state::AppState::new(pool, app_config, Arc::new(gemini));

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::knowledge::router())
        .merge(routes::chat::router())
        .merge(routes::audit::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], app_state.config.port));
    tracing::info!("{} listening on {}", app_state.config.app_name, addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
