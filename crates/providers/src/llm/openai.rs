use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChatMessage, LlmBackend};
use crate::ProviderError;

const COMPLETIONS_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(rename = "ApiKey", default)]
    pub api_key: Option<String>,
    #[serde(rename = "Model")]
    pub model: String,
}

pub struct OpenAiBackend {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig, fallback_api_key: &str) -> Self {
        Self {
            api_key: config
                .api_key
                .unwrap_or_else(|| fallback_api_key.to_string()),
            model: config.model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LlmBackend for OpenAiBackend {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    ) -> Result<mpsc::Receiver<Result<String, ProviderError>>, ProviderError> {
        let body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": messages,
            "stream": true,
        });

        let response = self
            .client
            .post(COMPLETIONS_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "chat completion returned {}",
                response.status()
            )));
        }

        let (tokens_tx, tokens_rx) = mpsc::channel::<Result<String, ProviderError>>(64);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tokens_tx
                            .send(Err(ProviderError::Stream(e.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // The stream is SSE-framed: one `data: {json}` line per delta.
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    match parse_delta(payload) {
                        Some(token) if !token.is_empty() => {
                            if tokens_tx.send(Ok(token)).await.is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => warn!("Unparseable completion chunk"),
                    }
                }
            }
            debug!("Completion stream ended without DONE marker");
        });

        Ok(tokens_rx)
    }

    fn service(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn parse_delta(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    Some(
        value
            .pointer("/choices/0/delta/content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_content() {
        let payload = r#"{"choices":[{"delta":{"content":" sunny"},"index":0}]}"#;
        assert_eq!(parse_delta(payload).unwrap(), " sunny");
    }

    #[test]
    fn tolerates_role_only_deltas() {
        let payload = r#"{"choices":[{"delta":{"role":"assistant"},"index":0}]}"#;
        assert_eq!(parse_delta(payload).unwrap(), "");
    }
}
