use std::str::FromStr;

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Runtime configuration, read from the environment once at startup and
/// carried in `AppState`. Nothing outside `main` touches the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub embedding_model: String,
    pub generation_model: String,
    /// Must match the dimension of the `documents.embedding` column
    pub vector_dimension: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub retrieval_top_k: usize,
    /// Minimum cosine similarity for a chunk to enter a chat turn's context
    pub min_similarity: f64,
    /// Upper bound on query length, checked before any provider call
    pub max_input_chars: usize,
    /// Wall-clock budget for one chat turn, gate to final payload
    pub max_turn_latency_ms: u64,
    pub provider_timeout_secs: u64,
    /// How many embedding calls one ingestion batch may have in flight
    pub embed_concurrency: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            app_name: env_or("APP_NAME", "Lorekeeper"),
            port: parse_env("APP_PORT", 8000)?,
            database_url: require_env("DATABASE_URL")?,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 10)?,
            gemini_api_key: require_env("GEMINI_API_KEY")?,
            gemini_base_url: env_or("GEMINI_BASE_URL", DEFAULT_GEMINI_BASE_URL),
            embedding_model: env_or("EMBEDDING_MODEL", "text-embedding-004"),
            generation_model: env_or("GENERATION_MODEL", "gemini-2.5-flash"),
            vector_dimension: parse_env("VECTOR_DIMENSION", 768)?,
            chunk_size: parse_env("CHUNK_SIZE", 1000)?,
            chunk_overlap: parse_env("CHUNK_OVERLAP", 200)?,
            retrieval_top_k: parse_env("RETRIEVAL_TOP_K", 5)?,
            min_similarity: parse_env("MIN_SIMILARITY", 0.5)?,
            max_input_chars: parse_env("MAX_INPUT_CHARS", 2000)?,
            max_turn_latency_ms: parse_env("MAX_TURN_LATENCY_MS", 30_000)?,
            provider_timeout_secs: parse_env("PROVIDER_TIMEOUT_SECS", 30)?,
            embed_concurrency: parse_env("EMBED_CONCURRENCY", 4)?,
        };
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.vector_dimension == 0 {
            return Err(invalid("VECTOR_DIMENSION", self.vector_dimension, "must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("CHUNK_SIZE", self.chunk_size, "must be positive"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(invalid(
                "CHUNK_OVERLAP",
                self.chunk_overlap,
                "must be smaller than CHUNK_SIZE",
            ));
        }
        if self.retrieval_top_k == 0 {
            return Err(invalid("RETRIEVAL_TOP_K", self.retrieval_top_k, "must be positive"));
        }
        if self.embed_concurrency == 0 {
            return Err(invalid("EMBED_CONCURRENCY", self.embed_concurrency, "must be positive"));
        }
        if self.max_turn_latency_ms == 0 {
            return Err(invalid(
                "MAX_TURN_LATENCY_MS",
                self.max_turn_latency_ms,
                "must be positive",
            ));
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(invalid(
                "MIN_SIMILARITY",
                self.min_similarity,
                "must be within [-1.0, 1.0]",
            ));
        }
        Ok(self)
    }
}

fn invalid(name: &'static str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing { name })
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: err.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl AppConfig {
    /// Baseline settings for tests that need a config without touching env.
    pub(crate) fn test_defaults() -> Self {
        Self {
            app_name: "Lorekeeper".to_string(),
            port: 0,
            database_url: String::new(),
            db_max_connections: 1,
            gemini_api_key: "test-key".to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            embedding_model: "text-embedding-004".to_string(),
            generation_model: "gemini-2.5-flash".to_string(),
            vector_dimension: 768,
            chunk_size: 1000,
            chunk_overlap: 200,
            retrieval_top_k: 5,
            min_similarity: 0.5,
            max_input_chars: 2000,
            max_turn_latency_ms: 30_000,
            provider_timeout_secs: 30,
            embed_concurrency: 4,
        }
    }
}
