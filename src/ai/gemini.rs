//! Gemini `generateContent` client

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{AiClient, AiError};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
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
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: BASE_URL.to_string(),
        }
    }

    async fn request(&self, prompt: &str, model: &str) -> Result<String, AiError> {
        let url = format!("{}/{}:generateContent", self.base_url, model);
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AiError::Unavailable(format!("status {}", status.as_u16())));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Parse(format!("status {}: {}", status.as_u16(), body)));
        }

        let parsed: GenerateResponse = response.json().await?;
        extract_text(parsed)
    }
}

/// Connection and timeout failures mean the service could not be reached
fn send_error(e: reqwest::Error) -> AiError {
    if e.is_connect() || e.is_timeout() {
        AiError::Unavailable(e.to_string())
    } else {
        AiError::Request(e)
    }
}

fn extract_text(response: GenerateResponse) -> Result<String, AiError> {
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.is_empty() {
        return Err(AiError::Parse("response carried no text".into()));
    }
    Ok(text)
}

impl AiClient for GeminiClient {
    fn generate<'a>(&'a self, prompt: &'a str, model: &'a str) -> BoxFuture<'a, Result<String, AiError>> {
        self.request(prompt, model).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_parts_are_joined() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "Hello, "}, {"text": "world"}]}}]
        }))
        .unwrap();
        assert_eq!(extract_text(response).unwrap(), "Hello, world");
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let client = GeminiClient {
            base_url: "http://127.0.0.1:9".to_string(),
            ..GeminiClient::new("key")
        };
        let err = client.generate("hi", "gemini-test").await.unwrap_err();
        assert!(matches!(err, AiError::Unavailable(_)), "got {err:?}");
        assert_eq!(crate::ai::fallback_text(&err), "AI is unavailable right now.");
    }

    #[test]
    fn empty_candidates_are_a_parse_error() {
        let response: GenerateResponse =
            serde_json::from_value(serde_json::json!({"candidates": []})).unwrap();
        assert!(matches!(extract_text(response), Err(AiError::Parse(_))));
    }
}
