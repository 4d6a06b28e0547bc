pub mod openai;

pub use openai::OpenAiBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message of a chat-completion prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmBackend: Send + Sync + 'static {
    /// Opens a streaming chat completion. Tokens arrive on the returned
    /// receiver as the vendor produces them; the channel closes at end of
    /// stream. A mid-stream vendor failure is delivered as an `Err` item.
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<Result<String, ProviderError>>, ProviderError>;

    /// Vendor name for usage events.
    fn service(&self) -> &str;

    /// Model identifier for usage events.
    fn model(&self) -> &str;

    /// Rough token count of prompt text for usage metering.
    ///
    /// Approximates BPE at four characters per token.
    fn estimate_tokens(&self, text: &str) -> u32 {
        (text.len() / 4) as u32
    }
}

/// Wire payload selecting an LLM service and its nested config.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfigPayload {
    #[serde(rename = "LLMServiceName")]
    pub service_name: String,
    #[serde(rename = "LLMConfig")]
    pub config: serde_json::Value,
}

/// Builds an LLM backend from a config payload.
///
/// `fallback_api_key` is used when the payload does not carry its own key.
pub fn parse_llm_config(
    payload: &LlmConfigPayload,
    fallback_api_key: &str,
) -> Result<Arc<dyn LlmBackend>, ProviderError> {
    match payload.service_name.as_str() {
        "openai" => {
            let config: openai::OpenAiConfig = serde_json::from_value(payload.config.clone())
                .map_err(|e| ProviderError::Config(e.to_string()))?;
            Ok(Arc::new(OpenAiBackend::new(config, fallback_api_key)))
        }
        other => Err(ProviderError::UnknownService(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_llm_config_selects_openai() {
        let payload = LlmConfigPayload {
            service_name: "openai".into(),
            config: serde_json::json!({ "Model": "gpt-4o" }),
        };
        let backend = parse_llm_config(&payload, "sk-fallback").unwrap();
        assert_eq!(backend.service(), "openai");
        assert_eq!(backend.model(), "gpt-4o");
    }

    #[test]
    fn parse_llm_config_rejects_unknown_service() {
        let payload = LlmConfigPayload {
            service_name: "acme".into(),
            config: serde_json::Value::Null,
        };
        assert!(matches!(
            parse_llm_config(&payload, ""),
            Err(ProviderError::UnknownService(_))
        ));
    }
}
