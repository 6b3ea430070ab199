//! Chat completion backends.
//!
//! [`HttpChatModel`] speaks the OpenAI-compatible `/chat/completions` API.
//! [`EchoChatModel`] answers locally and is used when no API key is set.

use super::{ChatModel, EngineError};
use crate::config::ChatConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatReply>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

pub struct HttpChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpChatModel {
    pub fn new(config: &ChatConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn reply(&self, system_prompt: &str, user_text: &str) -> Result<String, EngineError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_text },
            ],
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "Chat completion rejected");
            return Err(EngineError::Request(format!("chat endpoint returned {}", status)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Request(format!("invalid chat response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| EngineError::Request("chat endpoint returned an empty reply".to_string()))?;

        debug!(model = %self.model, chars = content.len(), "Chat completion received");
        Ok(content)
    }
}

/// Offline stand-in that repeats the user's words back.
#[derive(Debug, Default)]
pub struct EchoChatModel;

#[async_trait]
impl ChatModel for EchoChatModel {
    async fn reply(&self, _system_prompt: &str, user_text: &str) -> Result<String, EngineError> {
        Ok(format!("You said: {}", user_text.trim()))
    }
}

/// Pick the chat backend for the configured credentials.
pub fn build_chat_model(config: &ChatConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    match config.api_key.as_deref().map(str::trim).filter(|key| !key.is_empty()) {
        Some(key) => {
            info!(base_url = %config.base_url, model = %config.model, "Using HTTP chat model");
            Ok(Arc::new(HttpChatModel::new(config, key.to_string())?))
        }
        None => {
            info!("No chat API key configured, using local echo model");
            Ok(Arc::new(EchoChatModel))
        }
    }
}
