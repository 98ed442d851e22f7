//! OpenAI-compatible provider implementation
//!
//! Streams chat completions over server-sent events and answers one-shot
//! summarization requests with a regular completion call.

use super::base::{ChatStream, ModelProvider, StreamRequest, Summarizer};
use super::sse::decode_event_stream;
use crate::config::OpenAiConfig;
use crate::error::{ChatflowError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenAI-compatible HTTP provider
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    /// Create a new provider
    ///
    /// The API key is read from the environment variable named by
    /// `config.api_key_env`. A missing key is allowed so that local
    /// gateways without authentication keep working.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                "{} is not set; requests will be sent without authorization",
                config.api_key_env
            );
        }
        Self::with_api_key(config, api_key)
    }

    /// Create a provider with an explicit API key
    pub fn with_api_key(config: OpenAiConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("chatflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChatflowError::Provider(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            "Initialized OpenAI-compatible provider: api_base={}, model={}",
            config.api_base,
            config.model
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Model used when a request does not name one
    pub fn default_model(&self) -> &str {
        &self.config.model
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        )
    }

    fn post(&self, body: &CompletionRequest<'_>) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.completions_url()).json(body);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            tracing::error!("Provider request failed: {}", e);
            ChatflowError::Transport(format!("Provider request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!("Provider returned error {}: {}", status, error_text);
            return Err(ChatflowError::Provider(format!(
                "Provider returned error {}: {}",
                status, error_text
            ))
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn open_stream(&self, request: StreamRequest) -> Result<ChatStream> {
        let mut messages: Vec<WireMessage<'_>> = request
            .history
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();
        messages.push(WireMessage {
            role: "user",
            content: &request.input,
        });

        let body = CompletionRequest {
            model: &request.model,
            messages,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        tracing::debug!(
            session_id = %request.session_id,
            "Opening stream: {} history messages, model={}",
            request.history.len(),
            request.model
        );

        let response = self.send(self.post(&body)).await?;
        Ok(decode_event_stream(response.bytes_stream()))
    }
}

#[async_trait]
impl Summarizer for OpenAiProvider {
    async fn summarize(&self, instruction: &str, text: &str) -> Result<String> {
        let body = CompletionRequest {
            model: &self.config.title_model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: instruction,
                },
                WireMessage {
                    role: "user",
                    content: text,
                },
            ],
            stream: false,
            stream_options: None,
        };

        let request = self
            .post(&body)
            .timeout(Duration::from_secs(self.config.request_timeout_seconds));
        let response: CompletionResponse = self.send(request).await?.json().await.map_err(|e| {
            tracing::error!("Failed to parse completion response: {}", e);
            ChatflowError::Provider(format!("Failed to parse completion response: {}", e))
        })?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ChatflowError::Provider("Completion returned no content".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{HistoryMessage, StreamEvent};
    use crate::storage::Role;
    use futures::StreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> OpenAiConfig {
        OpenAiConfig {
            api_base: format!("{}/v1", server.uri()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_stream_sends_history_and_decodes_events() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-test",
                "stream": true,
                "messages": [
                    {"role": "user", "content": "before"},
                    {"role": "assistant", "content": "reply"},
                    {"role": "user", "content": "now"}
                ]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            OpenAiProvider::with_api_key(config_for(&server), Some("sk-test".to_string()))
                .expect("provider");
        let stream = provider
            .open_stream(StreamRequest {
                history: vec![
                    HistoryMessage::new(Role::User, "before"),
                    HistoryMessage::new(Role::Assistant, "reply"),
                ],
                input: "now".to_string(),
                model: "gpt-test".to_string(),
                session_id: "s1".to_string(),
            })
            .await
            .expect("open stream");

        let events: Vec<StreamEvent> = stream.map(|e| e.expect("event")).collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hi".to_string()),
                StreamEvent::Delta(" there".to_string()),
                StreamEvent::Usage(crate::providers::TokenUsage::new(4, 2)),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_open_stream_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::with_api_key(config_for(&server), None).expect("provider");
        let result = provider
            .open_stream(StreamRequest {
                history: vec![],
                input: "hi".to_string(),
                model: "m".to_string(),
                session_id: "s".to_string(),
            })
            .await;
        let err = result.err().expect("error status should fail");
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_summarize_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "\"Rust Ownership Basics\""}}]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::with_api_key(config_for(&server), None).expect("provider");
        let out = provider
            .summarize("make a title", "explain ownership")
            .await
            .expect("summarize");
        assert_eq!(out, "\"Rust Ownership Basics\"");
    }

    #[tokio::test]
    async fn test_summarize_empty_content_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "   "}}]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::with_api_key(config_for(&server), None).expect("provider");
        assert!(provider.summarize("title", "x").await.is_err());
    }
}
