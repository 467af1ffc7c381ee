use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use serde::Deserialize;
use serde_json::json;

use crate::config::AppConfig;
use crate::provider::{GenerativeProvider, ProviderError, TokenStream, with_retries};

const API_KEY_HEADER: &str = "x-goog-api-key";
const EMBED_TASK_TYPE: &str = "SEMANTIC_SIMILARITY";
const GENERATION_TEMPERATURE: f64 = 0.2;
const MAX_ERROR_BODY_CHARS: usize = 300;

/// REST client for the Gemini generative language API.
///
/// Authenticates with the `x-goog-api-key` header. Embeddings go through
/// `embedContent`, full responses through `generateContent`, and streaming
/// responses through `streamGenerateContent` with `alt=sse`, parsed
/// incrementally as server-sent events.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    embedding_model: String,
    generation_model: String,
    vector_dimension: usize,
    timeout: Duration,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(config: &AppConfig) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.provider_timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.gemini_base_url.trim_end_matches('/').to_string(),
            api_key: config.gemini_api_key.clone(),
            embedding_model: config.embedding_model.clone(),
            generation_model: config.generation_model.clone(),
            vector_dimension: config.vector_dimension,
            timeout,
        })
    }

    fn model_url(&self, model: &str, action: &str) -> String {
        format!("{}/v1beta/models/{model}:{action}", self.base_url)
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        check_status(response).await
    }

    /// Like `post_json`, but without an overall request timeout: the response
    /// body streams for as long as generation runs. The connect timeout from
    /// the client still applies.
    async fn post_sse(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        check_status(response).await
    }
}

#[async_trait::async_trait]
impl GenerativeProvider for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = self.model_url(&self.embedding_model, "embedContent");
        let body = embed_body(text);
        let response = with_retries("gemini embed", || self.post_json(&url, &body)).await?;

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if parsed.embedding.values.len() != self.vector_dimension {
            return Err(ProviderError::DimensionMismatch {
                expected: self.vector_dimension,
                got: parsed.embedding.values.len(),
            });
        }
        Ok(parsed.embedding.values)
    }

    async fn generate(&self, system: &str, prompt: &str) -> Result<String, ProviderError> {
        let url = self.model_url(&self.generation_model, "generateContent");
        let body = generate_body(system, prompt);
        let response = with_retries("gemini generate", || self.post_json(&url, &body)).await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        extract_text(parsed)
    }

    async fn generate_stream(
        &self,
        system: &str,
        prompt: &str,
    ) -> Result<TokenStream, ProviderError> {
        let url = format!(
            "{}?alt=sse",
            self.model_url(&self.generation_model, "streamGenerateContent")
        );
        let body = generate_body(system, prompt);
        // Retries cover the connection attempt only. Once bytes flow, a broken
        // stream surfaces as an error item so the caller can decide.
        let response = with_retries("gemini stream", || self.post_sse(&url, &body)).await?;

        let tokens = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_reqwest_error))
            .scan(Vec::<u8>::new(), |buffer, chunk| {
                let out: Vec<Result<String, ProviderError>> = match chunk {
                    Ok(bytes) => {
                        push_normalized(buffer, &bytes);
                        drain_sse_events(buffer)
                            .iter()
                            .filter_map(|event| token_from_event(event))
                            .map(Ok)
                            .collect()
                    }
                    Err(err) => vec![Err(err)],
                };
                futures::future::ready(Some(stream::iter(out)))
            })
            .flatten();

        Ok(tokens.boxed())
    }
}

fn embed_body(text: &str) -> serde_json::Value {
    json!({
        "content": { "parts": [{ "text": text }] },
        "taskType": EMBED_TASK_TYPE,
    })
}

fn generate_body(system: &str, prompt: &str) -> serde_json::Value {
    json!({
        "systemInstruction": { "parts": [{ "text": system }] },
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": { "temperature": GENERATION_TEMPERATURE },
    })
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        message: truncate_message(&body),
    })
}

fn classify_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

fn extract_text(response: GenerateResponse) -> Result<String, ProviderError> {
    let text = collected_text(response);
    if text.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "response contained no candidate text".to_string(),
        ));
    }
    Ok(text)
}

fn collected_text(response: GenerateResponse) -> String {
    response
        .candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .map(|part| part.text)
        .collect()
}

/// Buffer incoming bytes, dropping carriage returns so CRLF framing collapses
/// to the LF framing the event splitter expects.
fn push_normalized(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend(bytes.iter().filter(|byte| **byte != b'\r'));
}

/// Pull complete events out of the buffer, leaving any trailing partial event
/// in place for the next read. Events are separated by a blank line; only
/// `data:` lines carry payload.
fn drain_sse_events(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(boundary) = find_event_boundary(buffer) {
        let event: Vec<u8> = buffer.drain(..boundary + 2).collect();
        let Ok(event) = std::str::from_utf8(&event[..boundary]) else {
            continue;
        };
        let data = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|payload| payload.strip_prefix(' ').unwrap_or(payload))
            .collect::<Vec<_>>()
            .join("\n");
        if !data.is_empty() {
            events.push(data);
        }
    }
    events
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Extract candidate text from one event payload. Malformed or textless
/// events are skipped rather than failing the whole stream.
fn token_from_event(event: &str) -> Option<String> {
    let response: GenerateResponse = serde_json::from_str(event).ok()?;
    let text = collected_text(response);
    if text.is_empty() { None } else { Some(text) }
}

/// Cap upstream error bodies so they stay loggable.
fn truncate_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{cut}...")
}
