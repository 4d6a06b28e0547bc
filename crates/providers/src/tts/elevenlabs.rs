use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use super::{AudioStream, TtsBackend};
use crate::ProviderError;

#[derive(Debug, Clone, Deserialize)]
pub struct ElevenLabsConfig {
    #[serde(rename = "ModelID")]
    pub model_id: String,
    #[serde(rename = "VoiceID")]
    pub voice_id: String,
    #[serde(rename = "Stability", default = "default_stability")]
    pub stability: f64,
    #[serde(rename = "SimilarityBoost", default = "default_similarity_boost")]
    pub similarity_boost: f64,
    #[serde(rename = "OptimizeStreamingLatency", default)]
    pub optimize_streaming_latency: u8,
}

fn default_stability() -> f64 {
    0.5
}

fn default_similarity_boost() -> f64 {
    0.75
}

pub struct ElevenLabsBackend {
    config: ElevenLabsConfig,
    api_key: String,
    client: reqwest::Client,
}

impl ElevenLabsBackend {
    pub fn new(config: ElevenLabsConfig, api_key: &str) -> Self {
        Self {
            config,
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl TtsBackend for ElevenLabsBackend {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream?optimize_streaming_latency={}",
            self.config.voice_id, self.config.optimize_streaming_latency,
        );

        let body = json!({
            "text": text,
            "model_id": self.config.model_id,
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
            },
        });

        let response = self
            .client
            .post(url)
            .header("xi-api-key", &self.api_key)
            .header("accept", "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "synthesis returned {}",
                response.status()
            )));
        }

        let (chunks_tx, chunks_rx) = mpsc::channel::<Result<Bytes, ProviderError>>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let item = chunk.map_err(|e| ProviderError::Stream(e.to_string()));
                let failed = item.is_err();
                if chunks_tx.send(item).await.is_err() || failed {
                    return;
                }
            }
            debug!("ElevenLabs synthesis stream finished");
        });

        Ok(AudioStream { chunks: chunks_rx })
    }

    fn service(&self) -> &str {
        "elevenlabs"
    }

    fn model(&self) -> &str {
        &self.config.model_id
    }

    fn prelude_bytes(&self) -> usize {
        0
    }
}
