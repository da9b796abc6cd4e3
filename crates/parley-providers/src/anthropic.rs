use async_trait::async_trait;
use parley_core::config::AppConfig;
use parley_core::error::{ApiError, Failure, RawFailure, TransportCode};
use parley_core::message::{Message, MessageRole};
use parley_core::model::ModelId;
use parley_core::provider::{Provider, ProviderResponse};
use parley_core::usage::TokenUsage;
use reqwest::{Client, StatusCode};
use std::time::Duration;

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: ModelId,
    base_url: String,
    api_version: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: ModelId, config: &AppConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn send(&self, messages: &[Message]) -> Result<ProviderResponse, Failure> {
        let body = build_request_body(&self.model, self.max_tokens, messages);
        tracing::debug!(model = %self.model, messages = messages.len(), "POST /v1/messages");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_failure)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), "API error body: {text}");
            return Err(RawFailure::status(status.as_u16())
                .with_message(error_message(status, &text))
                .into());
        }

        let json: serde_json::Value = resp.json().await.map_err(transport_failure)?;
        parse_response(&json)
    }

    fn model(&self) -> &ModelId {
        &self.model
    }
}

/// System turns go into the top-level `system` field; the rest keep order.
fn build_request_body(model: &ModelId, max_tokens: u32, messages: &[Message]) -> serde_json::Value {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();

    let turns: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| {
            serde_json::json!({
                "role": m.role.to_string(),
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model.0,
        "max_tokens": max_tokens,
        "messages": turns,
    });
    if !system.is_empty() {
        body["system"] = serde_json::Value::String(system.join("\n\n"));
    }
    body
}

fn parse_response(json: &serde_json::Value) -> Result<ProviderResponse, Failure> {
    let parts = json["content"].as_array().ok_or_else(|| {
        Failure::from(ApiError::UnknownFailure {
            message: "Malformed response: missing content".into(),
        })
    })?;

    let content = parts
        .iter()
        .filter(|p| p["type"].as_str() == Some("text"))
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    let usage = TokenUsage {
        input_tokens: json["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: json["usage"]["output_tokens"].as_u64().unwrap_or(0),
    };

    Ok(ProviderResponse {
        content,
        usage,
        stop_reason: json["stop_reason"].as_str().map(str::to_string),
    })
}

/// Prefer the API's own `error.message`, then the raw body, then the
/// status reason.
fn error_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    if let Some(message) = parsed
        .as_ref()
        .and_then(|v| v["error"]["message"].as_str())
        .filter(|m| !m.is_empty())
    {
        return message.to_string();
    }
    if !body.trim().is_empty() {
        return body.trim().to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

fn transport_failure(e: reqwest::Error) -> Failure {
    let raw = if e.is_timeout() {
        RawFailure::transport(TransportCode::TimedOut)
    } else if e.is_connect() {
        RawFailure::transport(TransportCode::ConnectionRefused)
    } else if let Some(status) = e.status() {
        RawFailure::status(status.as_u16())
    } else {
        RawFailure::default()
    };
    raw.with_message(e.to_string()).into()
}
