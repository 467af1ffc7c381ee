use futures::StreamExt;

use crate::provider::{GenerativeProvider, ProviderError, TokenStream};
use crate::retrieve::RetrievedChunk;

pub(crate) const ANSWER_SYSTEM: &str = "You are a helpful assistant.";

/// Returned when retrieval produced nothing to ground an answer on. The
/// synthesis stage still completes the turn; it says so instead of inventing
/// sources.
pub const NO_CONTEXT_MESSAGE: &str = "I couldn't find relevant information to answer your \
     question. Please try rephrasing your query or provide more context.";

fn build_prompt(query: &str, context: &[RetrievedChunk]) -> String {
    let blocks: Vec<String> = context
        .iter()
        .enumerate()
        .map(|(index, chunk)| format!("Document {}:\n{}", index + 1, chunk.content))
        .collect();

    format!(
        "Answer the following question based on the provided context. If the context doesn't \
         contain enough information to answer the question, say so and provide your best \
         general knowledge response.\n\n\
         Context:\n{}\n\n\
         Question: {}\n\n\
         Please provide a helpful and accurate response based on the context above.",
        blocks.join("\n\n"),
        query
    )
}

/// Produce a complete grounded answer for the query.
pub async fn synthesize(
    provider: &dyn GenerativeProvider,
    query: &str,
    context: &[RetrievedChunk],
) -> Result<String, ProviderError> {
    if context.is_empty() {
        return Ok(NO_CONTEXT_MESSAGE.to_string());
    }
    provider
        .generate(ANSWER_SYSTEM, &build_prompt(query, context))
        .await
}

/// Streaming variant of `synthesize`. With no context the fixed message is
/// delivered as a single fragment.
pub async fn synthesize_stream(
    provider: &dyn GenerativeProvider,
    query: &str,
    context: &[RetrievedChunk],
) -> Result<TokenStream, ProviderError> {
    if context.is_empty() {
        return Ok(futures::stream::iter(vec![Ok(NO_CONTEXT_MESSAGE.to_string())]).boxed());
    }
    provider
        .generate_stream(ANSWER_SYSTEM, &build_prompt(query, context))
        .await
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn chunk(content: &str) -> RetrievedChunk {
        RetrievedChunk {
            document_id: Uuid::now_v7(),
            content: content.to_string(),
            score: 0.9,
            metadata: serde_json::json!({}),
        }
    }

    /// Any call to this provider is a test failure waiting to be asserted.
    struct UnreachableProvider;

    #[async_trait::async_trait]
    impl GenerativeProvider for UnreachableProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Err(ProviderError::RateLimited)
        }

        async fn generate(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            Err(ProviderError::RateLimited)
        }

        async fn generate_stream(
            &self,
            _system: &str,
            _prompt: &str,
        ) -> Result<TokenStream, ProviderError> {
            Err(ProviderError::RateLimited)
        }
    }

    #[test]
    fn prompt_numbers_context_blocks_in_rank_order() {
        let context = vec![chunk("Paris is the capital."), chunk("It sits on the Seine.")];
        let prompt = build_prompt("where is Paris?", &context);

        assert!(prompt.contains("Document 1:\nParis is the capital."));
        assert!(prompt.contains("Document 2:\nIt sits on the Seine."));
        assert!(prompt.contains("Question: where is Paris?"));
    }

    #[tokio::test]
    async fn empty_context_short_circuits_without_a_provider_call() {
        let answer = synthesize(&UnreachableProvider, "anything", &[])
            .await
            .unwrap();
        assert_eq!(answer, NO_CONTEXT_MESSAGE);
    }

    #[tokio::test]
    async fn empty_context_streams_the_fixed_message() {
        let stream = synthesize_stream(&UnreachableProvider, "anything", &[])
            .await
            .unwrap();
        let fragments: Vec<String> = stream.map(|fragment| fragment.unwrap()).collect().await;
        assert_eq!(fragments.concat(), NO_CONTEXT_MESSAGE);
    }
}
