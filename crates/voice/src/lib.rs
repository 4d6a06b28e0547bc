#[cfg(feature = "discord")]
pub mod discord;
pub mod transport;

pub use transport::VoiceTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Duration of one Opus frame at the channel's native cadence.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// The Opus silence frame.
pub const SILENT_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// How long a speaking-flag toggle may take before being abandoned.
pub const SPEAKING_TOGGLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a voice-channel join may take.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("Voice join failed: {0}")]
    Join(String),
    #[error("Voice write failed: {0}")]
    Write(String),
    #[error("Voice connection closed")]
    Closed,
    #[error("No voice backend compiled in")]
    NoBackend,
}

/// One compressed audio packet received from a remote speaker.
#[derive(Debug, Clone)]
pub struct VoicePacket {
    pub user_id: u64,
    pub payload: Bytes,
}

/// The seam to a live voice-channel connection.
///
/// Exactly one task writes frames (the transport's pacer); reads are
/// likewise single-consumer. Implementations provide interior mutability.
#[async_trait]
pub trait VoiceConnection: Send + Sync + 'static {
    /// Writes one outbound audio frame.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), VoiceError>;

    /// Receives the next inbound packet. `None` means the connection closed
    /// for good.
    async fn read_packet(&self) -> Option<VoicePacket>;

    /// Toggles the channel speaking indicator. Idempotent.
    async fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError>;

    /// Tears the connection down. Safe to call more than once.
    async fn close(&self);
}
