//! Anthropic Messages API client.

use async_trait::async_trait;
use query_core::{ClassifiedError, GenerationResult, ModelOptions, ProviderClient};
use query_core::error::Layer;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    name: String,
}

impl AnthropicClient {
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
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Serialize)]
struct MessageContent {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    output_tokens: Option<u32>,
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    async fn generate(
        &self,
        ctx: CancellationToken,
        prompt: &str,
        options: &ModelOptions,
        system_prompt: Option<&str>,
    ) -> Result<GenerationResult, ClassifiedError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: options.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![MessageContent { role: "user".to_string(), content: prompt.to_string() }],
            system: system_prompt.map(|s| s.to_string()),
            temperature: options.temperature,
            top_p: options.top_p,
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        let send = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            ClassifiedError::new(query_core::Category::Unknown, Layer::ApiClient, self.name.clone(), format!("decoding response: {e}"))
                .with_model(self.model.clone())
        })?;

        let content = parsed
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(GenerationResult {
            content,
            finish_reason: parsed.stop_reason.clone(),
            token_count: parsed.usage.and_then(|u| u.output_tokens),
            truncated: parsed.stop_reason.as_deref() == Some("max_tokens"),
            safety_evaluations: Vec::new(),
        })
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}
