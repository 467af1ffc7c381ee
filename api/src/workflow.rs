use lore_core::chat::SourceRef;
use uuid::Uuid;

use crate::error::AppError;
use crate::provider::GenerativeProvider;
use crate::retrieve::{ContextSource, RetrievedChunk};
use crate::safety::{self, REJECTION_MESSAGE, SafetyVerdict};
use crate::synthesis;

/// Phases of one chat turn. The machine is linear with a single branch at the
/// safety gate; there are no cycles and no phase-level retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Start,
    SafetyCheck,
    /// Safe path: retrieval, then synthesis over the retrieved context.
    Answer,
    /// Sensitive path: a fixed rejection, no retrieval, no synthesis.
    Reject,
    Postprocess,
    End,
}

/// What just happened; drives the next phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    QueryAccepted,
    ClassifiedSafe,
    ClassifiedSensitive,
    AnswerProduced,
    RejectionProduced,
    Finalized,
}

/// Pure transition function. Returns None for pairs the machine does not
/// define, which callers treat as a bug rather than a recoverable state.
pub fn advance(phase: TurnPhase, event: TurnEvent) -> Option<TurnPhase> {
    match (phase, event) {
        (TurnPhase::Start, TurnEvent::QueryAccepted) => Some(TurnPhase::SafetyCheck),
        (TurnPhase::SafetyCheck, TurnEvent::ClassifiedSafe) => Some(TurnPhase::Answer),
        (TurnPhase::SafetyCheck, TurnEvent::ClassifiedSensitive) => Some(TurnPhase::Reject),
        (TurnPhase::Answer, TurnEvent::AnswerProduced) => Some(TurnPhase::Postprocess),
        (TurnPhase::Reject, TurnEvent::RejectionProduced) => Some(TurnPhase::Postprocess),
        (TurnPhase::Postprocess, TurnEvent::Finalized) => Some(TurnPhase::End),
        _ => None,
    }
}

fn step(phase: TurnPhase, event: TurnEvent) -> Result<TurnPhase, AppError> {
    advance(phase, event).ok_or_else(|| {
        AppError::Internal(format!("illegal turn transition: {phase:?} on {event:?}"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Per-request state for one turn. Owned by exactly one in-flight request and
/// discarded once the turn completes.
#[derive(Debug)]
pub struct TurnState {
    pub chat_id: Uuid,
    pub query: String,
    /// Unset until the safety gate has run.
    pub verdict: Option<SafetyVerdict>,
    /// Populated on the safe path only; stays empty on rejection.
    pub retrieved: Vec<RetrievedChunk>,
    /// Conversation history, append-only within the turn.
    pub messages: Vec<ChatMessage>,
    pub answer: Option<String>,
}

impl TurnState {
    pub fn new(chat_id: Uuid, query: impl Into<String>) -> Self {
        let query = query.into();
        let messages = vec![ChatMessage {
            role: MessageRole::User,
            content: query.clone(),
        }];
        Self {
            chat_id,
            query,
            verdict: None,
            retrieved: Vec::new(),
            messages,
            answer: None,
        }
    }

    pub fn is_sensitive(&self) -> bool {
        self.verdict == Some(SafetyVerdict::Sensitive)
    }

    /// Retrieved documents in rank order, as citable references.
    pub fn sources(&self) -> Vec<SourceRef> {
        self.retrieved
            .iter()
            .map(RetrievedChunk::source_ref)
            .collect()
    }
}

/// Final payload of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub chat_id: Uuid,
    pub answer: String,
    pub sensitive: bool,
    pub sources: Vec<SourceRef>,
}

/// Knobs the turn runner takes from configuration.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub retrieval_top_k: usize,
    pub min_similarity: f64,
    /// Wall-clock budget for a whole turn, gate to final payload.
    pub max_turn_latency_ms: u64,
}

/// Run the gate and, on the safe path, retrieval. Returns the phase the turn
/// is in afterwards: `Answer` with context loaded into the state, or `Reject`
/// with the rejection message already set.
pub async fn run_turn_prelude(
    provider: &dyn GenerativeProvider,
    context: &dyn ContextSource,
    settings: &TurnSettings,
    state: &mut TurnState,
) -> Result<TurnPhase, AppError> {
    let phase = step(TurnPhase::Start, TurnEvent::QueryAccepted)?;

    let verdict = safety::classify(provider, &state.query).await?;
    state.verdict = Some(verdict);

    match verdict {
        SafetyVerdict::Safe => {
            let phase = step(phase, TurnEvent::ClassifiedSafe)?;
            state.retrieved = context
                .retrieve(
                    &state.query,
                    settings.retrieval_top_k,
                    settings.min_similarity,
                )
                .await?;
            Ok(phase)
        }
        SafetyVerdict::Sensitive => {
            let phase = step(phase, TurnEvent::ClassifiedSensitive)?;
            state.answer = Some(REJECTION_MESSAGE.to_string());
            Ok(phase)
        }
    }
}

/// Finish a turn from the phase the prelude reached. `produced` carries the
/// synthesized answer on the safe path; the rejection path already set its
/// message. Appends the assistant message and assembles the final payload.
pub fn complete_turn(
    state: &mut TurnState,
    phase: TurnPhase,
    produced: Option<String>,
) -> Result<TurnOutput, AppError> {
    let event = match phase {
        TurnPhase::Answer => {
            if produced.is_some() {
                state.answer = produced;
            }
            TurnEvent::AnswerProduced
        }
        TurnPhase::Reject => TurnEvent::RejectionProduced,
        other => {
            return Err(AppError::Internal(format!(
                "turn cannot complete from phase {other:?}"
            )));
        }
    };
    let phase = step(phase, event)?;

    let answer = state
        .answer
        .clone()
        .ok_or_else(|| AppError::Internal("turn completed without a response".to_string()))?;
    state.messages.push(ChatMessage {
        role: MessageRole::Assistant,
        content: answer.clone(),
    });

    let output = TurnOutput {
        chat_id: state.chat_id,
        answer,
        sensitive: state.is_sensitive(),
        sources: state.sources(),
    };
    step(phase, TurnEvent::Finalized)?;
    Ok(output)
}

/// Drive one full turn: gate, then either retrieval and synthesis or the
/// fixed rejection, then assembly of the final payload.
pub async fn run_turn(
    provider: &dyn GenerativeProvider,
    context: &dyn ContextSource,
    settings: &TurnSettings,
    state: &mut TurnState,
) -> Result<TurnOutput, AppError> {
    let phase = run_turn_prelude(provider, context, settings, state).await?;
    let produced = match phase {
        TurnPhase::Answer => {
            Some(synthesis::synthesize(provider, &state.query, &state.retrieved).await?)
        }
        _ => None,
    };
    complete_turn(state, phase, produced)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::provider::{ProviderError, TokenStream};

    fn settings() -> TurnSettings {
        TurnSettings {
            retrieval_top_k: 5,
            min_similarity: 0.5,
            max_turn_latency_ms: 30_000,
        }
    }

    fn chunk(content: &str) -> RetrievedChunk {
        RetrievedChunk {
            document_id: Uuid::now_v7(),
            content: content.to_string(),
            score: 0.85,
            metadata: json!({}),
        }
    }

    /// Answers the moderation call with a scripted verdict and every other
    /// generation call with a scripted answer, counting the latter.
    struct ScriptedProvider {
        verdict: &'static str,
        answer: &'static str,
        synthesis_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(verdict: &'static str, answer: &'static str) -> Self {
            Self {
                verdict,
                answer,
                synthesis_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl GenerativeProvider for ScriptedProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::InvalidResponse("embed not scripted".to_string()))
        }

        async fn generate(&self, system: &str, _prompt: &str) -> Result<String, ProviderError> {
            if system == safety::MODERATION_SYSTEM {
                return Ok(self.verdict.to_string());
            }
            self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.to_string())
        }

        async fn generate_stream(
            &self,
            system: &str,
            prompt: &str,
        ) -> Result<TokenStream, ProviderError> {
            let text = self.generate(system, prompt).await?;
            Ok(futures::stream::iter(vec![Ok(text)]).boxed())
        }
    }

    /// Provider whose every call fails, for gate-failure paths.
    struct DownProvider;

    #[async_trait::async_trait]
    impl GenerativeProvider for DownProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::Timeout)
        }

        async fn generate(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            Err(ProviderError::Timeout)
        }

        async fn generate_stream(
            &self,
            _system: &str,
            _prompt: &str,
        ) -> Result<TokenStream, ProviderError> {
            Err(ProviderError::Timeout)
        }
    }

    struct MockContext {
        chunks: Vec<RetrievedChunk>,
        calls: AtomicUsize,
    }

    impl MockContext {
        fn with_chunks(chunks: Vec<RetrievedChunk>) -> Self {
            Self {
                chunks,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ContextSource for MockContext {
        async fn retrieve(
            &self,
            _query: &str,
            k: usize,
            _min_score: f64,
        ) -> Result<Vec<RetrievedChunk>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.chunks.iter().take(k).cloned().collect())
        }
    }

    #[test]
    fn legal_transitions_walk_both_paths() {
        use TurnEvent::*;
        use TurnPhase::*;

        assert_eq!(advance(Start, QueryAccepted), Some(SafetyCheck));
        assert_eq!(advance(SafetyCheck, ClassifiedSafe), Some(Answer));
        assert_eq!(advance(SafetyCheck, ClassifiedSensitive), Some(Reject));
        assert_eq!(advance(Answer, AnswerProduced), Some(Postprocess));
        assert_eq!(advance(Reject, RejectionProduced), Some(Postprocess));
        assert_eq!(advance(Postprocess, Finalized), Some(End));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use TurnEvent::*;
        use TurnPhase::*;

        assert_eq!(advance(Start, Finalized), None);
        assert_eq!(advance(End, QueryAccepted), None);
        assert_eq!(advance(Answer, RejectionProduced), None);
        assert_eq!(advance(Reject, AnswerProduced), None);
        assert_eq!(advance(SafetyCheck, QueryAccepted), None);
    }

    #[test]
    fn turn_state_seeds_history_with_the_user_message() {
        let state = TurnState::new(Uuid::now_v7(), "hello there");
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, MessageRole::User);
        assert_eq!(state.messages[0].content, "hello there");
        assert!(state.verdict.is_none());
    }

    #[tokio::test]
    async fn safe_turn_retrieves_then_synthesizes() {
        let provider = ScriptedProvider::new("SAFE", "Grounded answer.");
        let context =
            MockContext::with_chunks(vec![chunk("fact one"), chunk("fact two")]);
        let mut state = TurnState::new(Uuid::now_v7(), "tell me about facts");

        let output = run_turn(&provider, &context, &settings(), &mut state)
            .await
            .unwrap();

        assert_eq!(output.answer, "Grounded answer.");
        assert!(!output.sensitive);
        assert_eq!(output.sources.len(), 2);
        assert_eq!(context.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.synthesis_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.messages.last().unwrap().role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn sensitive_turn_skips_retrieval_and_synthesis() {
        let provider = ScriptedProvider::new("SENSITIVE", "should never appear");
        let context = MockContext::with_chunks(vec![chunk("unused")]);
        let mut state = TurnState::new(Uuid::now_v7(), "something inappropriate");

        let output = run_turn(&provider, &context, &settings(), &mut state)
            .await
            .unwrap();

        assert_eq!(output.answer, REJECTION_MESSAGE);
        assert!(output.sensitive);
        assert!(output.sources.is_empty());
        assert!(state.retrieved.is_empty());
        assert_eq!(context.calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.synthesis_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            state.messages.last().unwrap().content,
            REJECTION_MESSAGE
        );
    }

    #[tokio::test]
    async fn gate_failure_aborts_before_retrieval() {
        let context = MockContext::with_chunks(vec![chunk("unused")]);
        let mut state = TurnState::new(Uuid::now_v7(), "anything");

        let result = run_turn(&DownProvider, &context, &settings(), &mut state).await;

        assert!(matches!(result, Err(AppError::Provider(_))));
        assert_eq!(context.calls.load(Ordering::SeqCst), 0);
        assert!(state.verdict.is_none());
    }

    #[tokio::test]
    async fn completing_from_a_wrong_phase_is_an_internal_error() {
        let mut state = TurnState::new(Uuid::now_v7(), "anything");
        let result = complete_turn(&mut state, TurnPhase::Start, None);
        assert!(matches!(result, Err(AppError::Internal(_))));
    }
}
