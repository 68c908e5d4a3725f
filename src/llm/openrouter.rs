//! OpenRouter chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, LlmError, LlmErrorKind};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter API client.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL, Duration::from_secs(300))
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    model: Option<String>,
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
    code: Option<serde_json::Value>,
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let body = ChatApiRequest {
            model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        tracing::debug!(model = %model, messages = messages.len(), "Sending chat completion");

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::new(
                classify_http_status(status.as_u16()),
                format!("OpenRouter returned {}: {}", status, text),
            ));
        }

        let parsed: ChatApiResponse = response.json().await?;

        if let Some(err) = parsed.error {
            let kind = err
                .code
                .as_ref()
                .and_then(|c| c.as_u64())
                .and_then(|c| u16::try_from(c).ok())
                .map(classify_http_status)
                .unwrap_or(LlmErrorKind::Transient);
            return Err(LlmError::new(kind, err.message));
        }

        let choice = parsed
            .choices
            .and_then(|choices| choices.into_iter().next())
            .ok_or_else(|| LlmError::new(LlmErrorKind::MalformedResponse, "No choices in response"))?;

        Ok(ChatResponse {
            content: choice.message.and_then(|m| m.content),
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model,
        })
    }
}
