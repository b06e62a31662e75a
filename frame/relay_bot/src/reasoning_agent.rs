use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::relay_config::LlmConfig;

/// Fixed system role of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persona {
    pub name: &'static str,
    pub system_message: &'static str,
    /// The stage must answer with a `{score, reason, reply}` object.
    pub structured_decision: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("reasoning request failed: {0}")]
    Request(String),
    #[error("reasoning api error [{status}]: {message}")]
    Api { status: u16, message: String },
    #[error("reasoning agent {0} returned no text")]
    EmptyOutput(String),
}

#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    async fn run_stage(&self, persona: &Persona, input: &str) -> std::result::Result<String, AgentError>;
}

/// Runs each stage as one OpenAI-compatible chat completion.
#[derive(Debug, Clone)]
pub struct OpenAIStageAgent {
    client: Client,
    api_token: String,
    base_url: String,
    model: String,
    reply_model: String,
}

impl OpenAIStageAgent {
    pub fn new(cfg: &LlmConfig, api_token: String) -> Result<Self> {
        let mut builder = Client::builder();
        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        let client = builder
            .build()
            .context("failed to build reqwest client for reasoning agent")?;

        info!(
            "reasoning agent ready: base_url={}, model={}, reply_model={:?}",
            cfg.base_url, cfg.model, cfg.reply_model
        );
        Ok(Self {
            client,
            api_token,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            reply_model: cfg.reply_model.clone().unwrap_or_else(|| cfg.model.clone()),
        })
    }

    fn model_for(&self, persona: &Persona) -> &str {
        if persona.structured_decision {
            self.reply_model.as_str()
        } else {
            self.model.as_str()
        }
    }

    fn build_request(model: &str, persona: &Persona, input: &str) -> Value {
        let mut request = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": persona.system_message },
                { "role": "user", "content": input },
            ],
        });
        if persona.structured_decision {
            request["response_format"] = decision_response_format();
        }
        request
    }

    fn extract_text_content(choice_message: &Value) -> Option<String> {
        let content = choice_message.get("content")?;
        if let Some(text) = content.as_str() {
            return Some(text.to_string());
        }

        let joined = content
            .as_array()?
            .iter()
            .filter(|segment| segment.get("type").and_then(|value| value.as_str()) == Some("text"))
            .filter_map(|segment| segment.get("text").and_then(|value| value.as_str()))
            .collect::<Vec<_>>()
            .join("\n");

        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    fn api_error(status: StatusCode, body: &Value) -> AgentError {
        let message = body
            .pointer("/error/message")
            .and_then(|value| value.as_str())
            .unwrap_or("reasoning api returned non-success status")
            .to_string();
        AgentError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

fn decision_response_format() -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "reply_decision",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "score": {
                        "type": "integer",
                        "description": "1 when no human needs to step in, 10 when a founder must reply",
                    },
                    "reason": { "type": "string" },
                    "reply": { "type": "string" },
                },
                "required": ["score", "reason", "reply"],
                "additionalProperties": false,
            },
        },
    })
}

#[async_trait]
impl ReasoningAgent for OpenAIStageAgent {
    async fn run_stage(&self, persona: &Persona, input: &str) -> std::result::Result<String, AgentError> {
        let model = self.model_for(persona);
        let request = Self::build_request(model, persona, input);
        debug!(
            "reasoning stage {} via {}, input_len={}",
            persona.name,
            model,
            input.len()
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_token.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|err| AgentError::Request(err.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|err| {
            AgentError::Request(format!("failed to parse reasoning response body: {}", err))
        })?;
        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        let message = body
            .pointer("/choices/0/message")
            .cloned()
            .unwrap_or(Value::Null);
        Self::extract_text_content(&message)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| AgentError::EmptyOutput(persona.name.to_string()))
    }
}
