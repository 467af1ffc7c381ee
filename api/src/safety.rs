use crate::provider::{GenerativeProvider, ProviderError};

pub(crate) const MODERATION_SYSTEM: &str = "You are a content moderator.";

const VERDICT_SENSITIVE: &str = "SENSITIVE";

/// Canned response for turns the gate rejects. Returned verbatim so clients
/// can match on it.
pub const REJECTION_MESSAGE: &str = "I apologize, but I cannot provide information on political \
     or sexual topics. Please ask about other subjects.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Sensitive,
}

fn moderation_prompt(query: &str) -> String {
    format!(
        "Analyze the following query and determine if it contains:\n\
         1. Political content (discussions about politics, political figures, government policies, etc.)\n\
         2. Sexual content (explicit sexual topics, adult content, etc.)\n\
         \n\
         Query: \"{query}\"\n\
         \n\
         Respond with only \"SENSITIVE\" if the query contains political or sexual content, \
         or \"SAFE\" if it doesn't."
    )
}

/// Classify a query before any retrieval happens. A provider failure here is
/// the caller's problem: the turn cannot proceed without a verdict.
pub async fn classify(
    provider: &dyn GenerativeProvider,
    query: &str,
) -> Result<SafetyVerdict, ProviderError> {
    let verdict = provider
        .generate(MODERATION_SYSTEM, &moderation_prompt(query))
        .await?;
    Ok(parse_verdict(&verdict))
}

/// Only an explicit SENSITIVE verdict blocks the turn. Anything else, from a
/// plain SAFE to an off-script essay, passes: an unusual classifier reply
/// must not silently censor.
fn parse_verdict(raw: &str) -> SafetyVerdict {
    let first: String = raw
        .split_whitespace()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect();
    if first.eq_ignore_ascii_case(VERDICT_SENSITIVE) {
        SafetyVerdict::Sensitive
    } else {
        SafetyVerdict::Safe
    }
}
