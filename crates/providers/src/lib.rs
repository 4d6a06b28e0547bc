pub mod llm;
pub mod stt;
pub mod tts;

pub use llm::{parse_llm_config, ChatMessage, LlmBackend, LlmConfigPayload, MessageRole};
pub use stt::{SearchHit, SttBackend, SttEvent, SttSession, SttStreamConfig};
pub use tts::{parse_tts_config, AudioStream, TtsBackend, TtsConfigPayload};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown service: {0}")]
    UnknownService(String),
    #[error("Invalid service config: {0}")]
    Config(String),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Stream error: {0}")]
    Stream(String),
}
