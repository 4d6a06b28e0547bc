pub mod azure;
pub mod elevenlabs;

pub use azure::AzureBackend;
pub use elevenlabs::ElevenLabsBackend;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::ProviderError;

/// A synthesized audio byte stream.
///
/// Chunks arrive as the vendor produces them; the channel closes at end of
/// stream. A mid-stream failure is delivered as an `Err` item.
pub struct AudioStream {
    pub chunks: mpsc::Receiver<Result<Bytes, ProviderError>>,
}

#[async_trait]
pub trait TtsBackend: Send + Sync + 'static {
    /// Synthesizes one sentence into a streamed audio body.
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError>;

    /// Vendor name for usage events.
    fn service(&self) -> &str;

    /// Model identifier for usage events.
    fn model(&self) -> &str;

    /// Container prelude bytes the player should discard before playback.
    fn prelude_bytes(&self) -> usize;
}

/// Wire payload selecting a TTS service and its nested config.
#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfigPayload {
    #[serde(rename = "TTSServiceName")]
    pub service_name: String,
    #[serde(rename = "TTSConfig")]
    pub config: serde_json::Value,
}

/// Builds a TTS backend from a config payload.
///
/// `fallback_api_key` is used when the payload does not carry its own key.
pub fn parse_tts_config(
    payload: &TtsConfigPayload,
    fallback_api_key: &str,
) -> Result<Arc<dyn TtsBackend>, ProviderError> {
    match payload.service_name.as_str() {
        "azure" => {
            let config: azure::AzureConfig = serde_json::from_value(payload.config.clone())
                .map_err(|e| ProviderError::Config(e.to_string()))?;
            Ok(Arc::new(AzureBackend::new(config, fallback_api_key)))
        }
        "elevenlabs" => {
            let config: elevenlabs::ElevenLabsConfig =
                serde_json::from_value(payload.config.clone())
                    .map_err(|e| ProviderError::Config(e.to_string()))?;
            Ok(Arc::new(ElevenLabsBackend::new(config, fallback_api_key)))
        }
        other => Err(ProviderError::UnknownService(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tts_config_selects_azure() {
        let payload = TtsConfigPayload {
            service_name: "azure".into(),
            config: serde_json::json!({
                "Model": "neural",
                "VoiceID": "en-US-JennyNeural",
                "Language": "en-US",
                "Gender": "Female",
            }),
        };
        let backend = parse_tts_config(&payload, "key").unwrap();
        assert_eq!(backend.service(), "azure");
        assert_eq!(backend.prelude_bytes(), 1700);
    }

    #[test]
    fn parse_tts_config_rejects_bad_nested_config() {
        let payload = TtsConfigPayload {
            service_name: "azure".into(),
            config: serde_json::json!({ "Model": "neural" }),
        };
        assert!(matches!(
            parse_tts_config(&payload, "key"),
            Err(ProviderError::Config(_))
        ));
    }
}
