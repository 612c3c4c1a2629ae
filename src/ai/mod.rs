//! AI text generation collaborator
//!
//! Scripts never call this directly: the room loop runs requests off-tick
//! and hands the text back at the next tick boundary.

pub mod gemini;

pub use gemini::GeminiClient;

use futures::future::{BoxFuture, FutureExt};

/// AI errors. These become a failed callback in the script, never a crash.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("AI service unavailable: {0}")]
    Unavailable(String),

    #[error("AI request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected AI response: {0}")]
    Parse(String),
}

pub trait AiClient: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str, model: &'a str) -> BoxFuture<'a, Result<String, AiError>>;
}

/// Used when no AI key is configured
#[derive(Debug, Default, Clone)]
pub struct DisabledAi;

impl AiClient for DisabledAi {
    fn generate<'a>(&'a self, _prompt: &'a str, _model: &'a str) -> BoxFuture<'a, Result<String, AiError>> {
        async { Err(AiError::Unavailable("no AI service configured".into())) }.boxed()
    }
}

/// Text handed to the script callback when generation failed
pub fn fallback_text(error: &AiError) -> String {
    match error {
        AiError::Unavailable(_) => "AI is unavailable right now.".to_string(),
        _ => "AI request failed.".to_string(),
    }
}

/// Strip a surrounding Markdown code fence (```json ... ```), if any
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n[1, 2]\n```  "), "[1, 2]");
        assert_eq!(strip_code_fences("  {\"plain\": true} "), "{\"plain\": true}");
    }

    #[tokio::test]
    async fn disabled_ai_reports_unavailable() {
        let err = DisabledAi.generate("hi", "any").await.unwrap_err();
        assert!(matches!(err, AiError::Unavailable(_)));
        assert_eq!(fallback_text(&err), "AI is unavailable right now.");
    }
}
