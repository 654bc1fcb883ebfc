//! Text-generation API client
//!
//! HTTP client for the external large-language-model endpoint used by the
//! AI risk analyst. One user-role prompt in, generated text out.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::AiConfig;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum AiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited")]
    RateLimited,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Empty completion")]
    EmptyCompletion,

    #[error("AI analysis disabled")]
    Disabled,
}

/// Something that turns a prompt into text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// `schema_hint` describes the JSON shape the caller will parse.
    async fn generate(&self, prompt: &str, schema_hint: &str) -> Result<String, AiError>;
}

/// Client for a messages-style completion API
pub struct TextGenerationClient {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl TextGenerationClient {
    pub fn new(config: &AiConfig) -> Result<Self, AiError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_request<'a>(&'a self, content: &'a str) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content,
            }],
        }
    }
}

#[async_trait]
impl TextGenerator for TextGenerationClient {
    async fn generate(&self, prompt: &str, schema_hint: &str) -> Result<String, AiError> {
        let content = with_schema_hint(prompt, schema_hint);
        let request = self.build_request(&content);

        debug!(model = %self.model, prompt_len = content.len(), "Requesting completion");

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        match response.status() {
            status if status.is_success() => {
                let body: MessagesResponse = response.json().await.map_err(map_transport_error)?;
                body.text().ok_or(AiError::EmptyCompletion)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AiError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => Err(AiError::RateLimited),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(AiError::Api {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

/// Stand-in when no API key is configured; every call fails so the
/// analyst falls back to its rule-weighted default.
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    async fn generate(&self, _prompt: &str, _schema_hint: &str) -> Result<String, AiError> {
        Err(AiError::Disabled)
    }
}

fn map_transport_error(err: reqwest::Error) -> AiError {
    if err.is_timeout() {
        AiError::Timeout
    } else {
        AiError::Http(err)
    }
}

fn with_schema_hint(prompt: &str, schema_hint: &str) -> String {
    if schema_hint.is_empty() {
        return prompt.to_string();
    }
    format!(
        "{}\n\nRespond with a single JSON object only, no prose, matching:\n{}",
        prompt, schema_hint
    )
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessagesResponse {
    fn text(self) -> Option<String> {
        let text: String = self
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let client = TextGenerationClient::new(&AiConfig {
            api_key: "test-key".into(),
            max_tokens: 512,
            ..AiConfig::default()
        })
        .unwrap();
        let body = serde_json::to_value(client.build_request("score this")).unwrap();
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "score this");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_response_text_joins_text_blocks() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "{\"confidence\":"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": " 42}"}
            ]
        }))
        .unwrap();
        assert_eq!(response.text().as_deref(), Some("{\"confidence\": 42}"));
    }

    #[test]
    fn test_empty_response_has_no_text() {
        let response: MessagesResponse = serde_json::from_value(json!({"content": []})).unwrap();
        assert!(response.text().is_none());
    }

    #[test]
    fn test_schema_hint_appended() {
        let content = with_schema_hint("prompt", "{\"confidence\": number}");
        assert!(content.starts_with("prompt"));
        assert!(content.ends_with("{\"confidence\": number}"));
        assert_eq!(with_schema_hint("prompt", ""), "prompt");
    }

    #[tokio::test]
    async fn test_disabled_generator_errors() {
        let result = DisabledGenerator.generate("p", "").await;
        assert!(matches!(result, Err(AiError::Disabled)));
    }
}
