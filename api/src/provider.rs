use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

pub mod gemini;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 250;

/// Failures of the external language model provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider rate limit exhausted")]
    RateLimited,
    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("provider response could not be parsed: {0}")]
    InvalidResponse(String),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl ProviderError {
    /// Transient failures are worth another attempt. Rate limits and other
    /// 4xx responses are not: retrying burns quota without changing the answer.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Lazily produced response fragments from a streaming generation call.
pub type TokenStream = BoxStream<'static, Result<String, ProviderError>>;

/// The two capabilities the pipeline needs from a language model provider.
/// Dyn-safe so tests can substitute scripted implementations.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// Embed one text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Produce a complete response for `prompt` under `system` instructions.
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, ProviderError>;

    /// Like `generate`, but yields the response as it is produced.
    async fn generate_stream(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<TokenStream, ProviderError>;
}

/// Embed a batch with bounded concurrency. Output order matches input order.
pub async fn embed_batch(
    provider: &dyn GenerativeProvider,
    texts: &[String],
    concurrency: usize,
) -> Result<Vec<Vec<f32>>, ProviderError> {
    // Collected eagerly: the boxed futures are inert until polled, and the
    // intermediate closure otherwise trips rustc's higher-ranked lifetime
    // check when callers' futures are proven `Send` (rust-lang/rust#102211).
    let embeds: Vec<_> = texts.iter().map(|text| provider.embed(text)).collect();
    stream::iter(embeds)
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// Run `op` with bounded retries on transient failures. Backoff doubles per
/// attempt starting at 250ms; permanent failures propagate immediately.
pub(crate) async fn with_retries<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let backoff = INITIAL_BACKOFF_MS * (1 << attempt);
                tracing::warn!(
                    error = %err,
                    attempt = attempt + 1,
                    backoff_ms = backoff,
                    "{op_name} failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn transport_and_timeout_failures_are_transient() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::Transport("connection reset".to_string()).is_transient());
        assert!(
            ProviderError::Api {
                status: 503,
                message: "overloaded".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn quota_and_client_failures_are_permanent() {
        assert!(!ProviderError::RateLimited.is_transient());
        assert!(
            !ProviderError::Api {
                status: 400,
                message: "bad request".to_string()
            }
            .is_transient()
        );
        assert!(!ProviderError::InvalidResponse("garbage".to_string()).is_transient());
    }

    #[tokio::test]
    async fn retries_recover_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test call", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Timeout)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("test call", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::RateLimited) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("test call", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Timeout) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
