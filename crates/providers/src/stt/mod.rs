pub mod deepgram;

pub use deepgram::DeepgramBackend;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ProviderError;

/// Options for one live transcription session.
///
/// `search_terms` are matched against the audio with per-hit confidence
/// (used for wake-word detection); `keywords` bias recognition towards
/// expected vocabulary.
#[derive(Debug, Clone, Default)]
pub struct SttStreamConfig {
    pub keywords: Vec<String>,
    pub search_terms: Vec<String>,
    /// Vendor model tier. `None` selects the vendor default.
    pub model: Option<String>,
}

/// A confidence-scored match of one search term inside a final chunk.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub query: String,
    pub confidence: f64,
}

/// Events produced by a live transcription session.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// A non-final partial result arrived. Text may still change.
    Interim { text: String },
    /// The vendor marked the chunk final.
    Final {
        text: String,
        search_hits: Vec<SearchHit>,
        /// Audio seconds covered by this chunk, for usage metering.
        duration_secs: f64,
    },
    /// The session closed. `code` carries the websocket close code when known.
    Closed { code: Option<u16> },
}

/// A live transcription session.
///
/// Send compressed audio via `audio_tx`; drop it to signal end of audio.
/// Events arrive on `events_rx` until `Closed` is delivered.
pub struct SttSession {
    pub audio_tx: mpsc::Sender<Bytes>,
    pub events_rx: mpsc::Receiver<SttEvent>,
}

#[async_trait]
pub trait SttBackend: Send + Sync + 'static {
    /// Opens a streaming recognition session.
    async fn start_stream(&self, config: SttStreamConfig) -> Result<SttSession, ProviderError>;

    /// Vendor name for usage events.
    fn service(&self) -> &str;

    /// Model identifier for usage events.
    fn model(&self) -> &str;
}
