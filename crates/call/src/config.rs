use serde::{Deserialize, Serialize};

use parley_providers::{LlmConfigPayload, TtsConfigPayload};

use crate::prompt::PromptContents;
use crate::CallError;

/// When the bot chooses to respond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeakingMode {
    /// Listen and transcribe, never respond.
    NeverSpeak,
    /// Stay asleep until woken by name.
    AlwaysSleep,
    /// Respond while engaged; drift asleep after enough unanswered lines.
    AutoSleep,
    /// Respond to every utterance.
    AlwaysSpeak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceUxConfig {
    #[serde(rename = "SpeakingMode")]
    pub speaking_mode: SpeakingMode,
    #[serde(rename = "LinesBeforeSleep", default)]
    pub lines_before_sleep: u32,
    #[serde(rename = "BotNameConfidenceThreshold", default)]
    pub bot_name_confidence_threshold: f64,
    /// Seconds between auto-response attempts while tasks are pending.
    /// Zero disables the auto-responder.
    #[serde(rename = "AutoRespondIntervalSeconds", default)]
    pub auto_respond_interval_seconds: u64,
}

impl VoiceUxConfig {
    pub fn validate(&self) -> Result<(), CallError> {
        if !(0.0..=1.0).contains(&self.bot_name_confidence_threshold) {
            return Err(CallError::BadConfig(
                "BotNameConfidenceThreshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriberConfig {
    #[serde(rename = "Keywords", default)]
    pub keywords: Vec<String>,
    /// User ids whose audio is never transcribed.
    #[serde(rename = "IgnoredUsers", default)]
    pub ignored_users: Vec<String>,
    /// Vendor model tier; `None` selects the vendor default.
    #[serde(rename = "Model", default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptConfig {
    #[serde(rename = "NumberOfTranscriptLines")]
    pub max_lines: usize,
}

impl TranscriptConfig {
    pub fn validate(&self) -> Result<(), CallError> {
        if self.max_lines == 0 {
            return Err(CallError::BadConfig(
                "NumberOfTranscriptLines must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Full per-call configuration, as carried by a join request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallConfig {
    #[serde(rename = "BotName")]
    pub bot_name: String,
    #[serde(rename = "PromptContents")]
    pub prompt_contents: PromptContents,
    #[serde(rename = "VoiceUXConfig")]
    pub voice_ux: VoiceUxConfig,
    #[serde(rename = "LLMConfig")]
    pub llm: LlmConfigPayload,
    #[serde(rename = "TTSConfig")]
    pub tts: TtsConfigPayload,
    #[serde(rename = "TranscriptConfig")]
    pub transcript: TranscriptConfig,
    #[serde(rename = "TranscriberConfig")]
    pub transcriber: TranscriberConfig,
}

impl CallConfig {
    pub fn validate(&self) -> Result<(), CallError> {
        if self.bot_name.trim().is_empty() {
            return Err(CallError::BadConfig("BotName must not be empty".into()));
        }
        self.prompt_contents.validate()?;
        self.voice_ux.validate()?;
        self.transcript.validate()?;
        Ok(())
    }
}

/// Partial configuration for a live update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    #[serde(rename = "BotName", default)]
    pub bot_name: Option<String>,
    #[serde(rename = "PromptContents", default)]
    pub prompt_contents: Option<PromptContents>,
    #[serde(rename = "VoiceUXConfig", default)]
    pub voice_ux: Option<VoiceUxConfig>,
    #[serde(rename = "LLMConfig", default)]
    pub llm: Option<LlmConfigPayload>,
    #[serde(rename = "TTSConfig", default)]
    pub tts: Option<TtsConfigPayload>,
    #[serde(rename = "TranscriptConfig", default)]
    pub transcript: Option<TranscriptConfig>,
    #[serde(rename = "TranscriberConfig", default)]
    pub transcriber: Option<TranscriberConfig>,
}
