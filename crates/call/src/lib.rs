pub mod auto;
pub mod config;
pub mod prompt;
pub mod responder;
pub mod session;
pub mod speakers;
pub mod splitter;
pub mod tools;
pub mod transcriber;
pub mod transcript;
pub mod usage;

mod player;

pub use config::{CallConfig, ConfigUpdate, SpeakingMode, TranscriberConfig, TranscriptConfig, VoiceUxConfig};
pub use prompt::{Document, PromptContents, Task, Tool};
pub use responder::Responder;
pub use session::{Call, CallRegistry, JoinArgs, ProviderFactory, ProviderKeys, VendorProviders};
pub use transcript::{LineKind, Transcript, TranscriptLine};
pub use usage::{UsageEvent, UsageMeter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("Call not found")]
    NotFound,
    #[error("Already in a voice call for this bot and guild")]
    AlreadyJoined,
    #[error("Invalid config: {0}")]
    BadConfig(String),
    #[error(transparent)]
    Provider(#[from] parley_providers::ProviderError),
    #[error(transparent)]
    Voice(#[from] parley_voice::VoiceError),
}
