//! OpenAI-compatible chat-completions client, reused for OpenAI itself
//! and any self-hosted endpoint speaking the same wire format.

use async_trait::async_trait;
use query_core::{ClassifiedError, GenerationResult, ModelOptions, ProviderClient};
use query_core::error::Layer;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub struct OpenAiCompatibleClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    name: String,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            name: name.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: Option<u32>,
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    async fn generate(
        &self,
        ctx: CancellationToken,
        prompt: &str,
        options: &ModelOptions,
        system_prompt: Option<&str>,
    ) -> Result<GenerationResult, ClassifiedError> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage { role: "system".to_string(), content: system.to_string() });
        }
        messages.push(ChatMessage { role: "user".to_string(), content: prompt.to_string() });

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: options.max_output_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send();

        let response = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(ClassifiedError::cancelled(Layer::ApiClient, self.name.clone()).with_model(self.model.clone()));
            }
            result = send => result.map_err(|e| {
                ClassifiedError::new(query_core::Category::Network, Layer::ApiClient, self.name.clone(), e.to_string())
                    .with_model(self.model.clone())
            })?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(
                ClassifiedError::from_status(status, Layer::ApiClient, self.name.clone(), format!("HTTP {status}: {body}"))
                    .with_model(self.model.clone()),
            );
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            ClassifiedError::new(query_core::Category::Unknown, Layer::ApiClient, self.name.clone(), format!("decoding response: {e}"))
                .with_model(self.model.clone())
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            ClassifiedError::new(query_core::Category::Server, Layer::ApiClient, self.name.clone(), "response had no choices")
                .with_model(self.model.clone())
        })?;

        Ok(GenerationResult {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.clone(),
            token_count: parsed.usage.and_then(|u| u.total_tokens),
            truncated: choice.finish_reason.as_deref() == Some("length"),
            safety_evaluations: Vec::new(),
        })
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}
