use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use lore_core::audit::TurnOutcome;
use lore_core::chat::{ChatResponse, StreamEvent};

use crate::audit::{NewAuditEntry, TurnRecorder};
use crate::error::{AppError, PROVIDER_UNAVAILABLE_MESSAGE};
use crate::provider::{GenerativeProvider, ProviderError, TokenStream};
use crate::retrieve::ContextSource;
use crate::synthesis;
use crate::workflow::{self, TurnPhase, TurnSettings, TurnState};

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Events delivered to a streaming chat client, failures already folded
/// into the `error` variant.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Drives complete chat turns: wall-clock accounting around the turn
/// runner, exactly one audit row per turn, and the streaming pump.
///
/// Audit writes fail open. A turn that produced an answer is never failed
/// by its ledger write; the write failure is logged and the response is
/// flagged as degraded instead.
#[derive(Clone)]
pub struct ChatService {
    provider: Arc<dyn GenerativeProvider>,
    context: Arc<dyn ContextSource>,
    recorder: Arc<dyn TurnRecorder>,
    settings: TurnSettings,
}

impl ChatService {
    pub fn new(
        provider: Arc<dyn GenerativeProvider>,
        context: Arc<dyn ContextSource>,
        recorder: Arc<dyn TurnRecorder>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            provider,
            context,
            recorder,
            settings,
        }
    }

    /// Answer one turn synchronously. The whole turn runs under the
    /// configured wall-clock budget; blowing the budget surfaces like a
    /// provider timeout.
    pub async fn answer(
        &self,
        query: String,
        chat_id: Option<Uuid>,
    ) -> Result<ChatResponse, AppError> {
        let chat_id = chat_id.unwrap_or_else(Uuid::now_v7);
        let started = Instant::now();
        let mut state = TurnState::new(chat_id, query);

        let run = tokio::time::timeout(
            self.turn_budget(),
            workflow::run_turn(
                self.provider.as_ref(),
                self.context.as_ref(),
                &self.settings,
                &mut state,
            ),
        )
        .await;

        let output = match run {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                self.record_failure(&state, elapsed_ms(started)).await;
                return Err(err);
            }
            Err(_) => {
                self.record_failure(&state, elapsed_ms(started)).await;
                return Err(AppError::Provider(ProviderError::Timeout));
            }
        };

        let latency_ms = elapsed_ms(started);
        let outcome = if output.sensitive {
            TurnOutcome::Rejected
        } else {
            TurnOutcome::Answered
        };
        let degraded = !self
            .record_outcome(&state, output.answer.clone(), latency_ms, outcome)
            .await;

        Ok(ChatResponse {
            chat_id,
            answer: output.answer,
            sensitive: output.sensitive,
            sources: output.sources,
            latency_ms,
            degraded,
        })
    }

    /// Answer one turn as an event stream: one `metadata`, the answer in
    /// `chunk` fragments, then `done` with the turn latency.
    ///
    /// The gate and retrieval run before the first event, under the turn
    /// budget; failures there surface as plain errors, not stream events.
    /// Once tokens flow, the pump task owns the turn, so a client gone
    /// mid-answer still leaves a `truncated` ledger row. Latency counts to
    /// stream completion, not first token.
    pub async fn answer_stream(
        &self,
        query: String,
        chat_id: Option<Uuid>,
    ) -> Result<EventStream, AppError> {
        let chat_id = chat_id.unwrap_or_else(Uuid::now_v7);
        let started = Instant::now();
        let mut state = TurnState::new(chat_id, query);

        let prelude = tokio::time::timeout(
            self.turn_budget(),
            workflow::run_turn_prelude(
                self.provider.as_ref(),
                self.context.as_ref(),
                &self.settings,
                &mut state,
            ),
        )
        .await;

        let phase = match prelude {
            Ok(Ok(phase)) => phase,
            Ok(Err(err)) => {
                self.record_failure(&state, elapsed_ms(started)).await;
                return Err(err);
            }
            Err(_) => {
                self.record_failure(&state, elapsed_ms(started)).await;
                return Err(AppError::Provider(ProviderError::Timeout));
            }
        };

        if phase == TurnPhase::Reject {
            let output = match workflow::complete_turn(&mut state, phase, None) {
                Ok(output) => output,
                Err(err) => {
                    self.record_failure(&state, elapsed_ms(started)).await;
                    return Err(err);
                }
            };
            let latency_ms = elapsed_ms(started);
            self.record_outcome(&state, output.answer.clone(), latency_ms, TurnOutcome::Rejected)
                .await;

            let events = vec![
                StreamEvent::Metadata {
                    chat_id: output.chat_id,
                    sensitive: true,
                    sources: Vec::new(),
                },
                StreamEvent::Chunk {
                    text: output.answer,
                },
                StreamEvent::Done { latency_ms },
            ];
            return Ok(stream::iter(events).boxed());
        }

        let tokens = match synthesis::synthesize_stream(
            self.provider.as_ref(),
            &state.query,
            &state.retrieved,
        )
        .await
        {
            Ok(tokens) => tokens,
            Err(err) => {
                self.record_failure(&state, elapsed_ms(started)).await;
                return Err(AppError::Provider(err));
            }
        };

        let (tx, rx) = mpsc::channel::<StreamEvent>(STREAM_CHANNEL_CAPACITY);
        let service = self.clone();
        tokio::spawn(async move {
            service.pump_answer(state, started, tokens, tx).await;
        });

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }

    /// Forward synthesis output as client events and write the audit row
    /// once the stream settles. Runs detached from the response body: a
    /// send failure means the client is gone, which stops generation by
    /// dropping the token stream and records the partial answer.
    async fn pump_answer(
        self,
        mut state: TurnState,
        started: Instant,
        mut tokens: TokenStream,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let metadata = StreamEvent::Metadata {
            chat_id: state.chat_id,
            sensitive: false,
            sources: state.sources(),
        };
        if tx.send(metadata).await.is_err() {
            self.record_outcome(&state, String::new(), elapsed_ms(started), TurnOutcome::Truncated)
                .await;
            return;
        }

        let mut answer = String::new();
        while let Some(token) = tokens.next().await {
            match token {
                Ok(text) => {
                    answer.push_str(&text);
                    if tx.send(StreamEvent::Chunk { text }).await.is_err() {
                        drop(tokens);
                        self.record_outcome(
                            &state,
                            answer,
                            elapsed_ms(started),
                            TurnOutcome::Truncated,
                        )
                        .await;
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!("Synthesis stream failed mid-turn: {:?}", err);
                    self.record_outcome(&state, answer, elapsed_ms(started), TurnOutcome::Failed)
                        .await;
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: PROVIDER_UNAVAILABLE_MESSAGE.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }

        let output = match workflow::complete_turn(&mut state, TurnPhase::Answer, Some(answer)) {
            Ok(output) => output,
            Err(err) => {
                tracing::error!("Turn completion failed after streaming: {:?}", err);
                self.record_failure(&state, elapsed_ms(started)).await;
                let _ = tx
                    .send(StreamEvent::Error {
                        message: PROVIDER_UNAVAILABLE_MESSAGE.to_string(),
                    })
                    .await;
                return;
            }
        };

        let latency_ms = elapsed_ms(started);
        self.record_outcome(&state, output.answer, latency_ms, TurnOutcome::Answered)
            .await;
        let _ = tx.send(StreamEvent::Done { latency_ms }).await;
    }

    /// Write the turn's ledger row. Returns false when the write was lost;
    /// the turn itself is never failed here.
    async fn record_outcome(
        &self,
        state: &TurnState,
        response: String,
        latency_ms: i64,
        outcome: TurnOutcome,
    ) -> bool {
        let entry = NewAuditEntry {
            chat_id: state.chat_id,
            question: state.query.clone(),
            response,
            retrieved_docs: state.sources(),
            latency_ms,
            outcome,
        };
        match self.recorder.record(entry).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("Audit write failed, serving the turn degraded: {:?}", err);
                false
            }
        }
    }

    async fn record_failure(&self, state: &TurnState, latency_ms: i64) {
        let response = state.answer.clone().unwrap_or_default();
        self.record_outcome(state, response, latency_ms, TurnOutcome::Failed)
            .await;
    }

    fn turn_budget(&self) -> Duration {
        Duration::from_millis(self.settings.max_turn_latency_ms)
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
