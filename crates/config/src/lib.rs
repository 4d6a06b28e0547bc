use std::env;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid value for {0}: {1}")]
    InvalidVar(&'static str, String),
}

/// Process-level settings, loaded once at startup.
///
/// Per-call vendor configuration (models, voices, prompts) arrives with the
/// join request; only credentials and the listen address live here.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Default Discord bot token (join requests may carry their own).
    pub discord_token: String,
    /// Azure Cognitive Services subscription key.
    pub azure_token: String,
    /// ElevenLabs API key.
    pub elevenlabs_token: String,
    /// OpenAI API key.
    pub openai_token: String,
    /// Deepgram API key.
    pub deepgram_token: String,
    /// Shared bearer key protecting the control-plane API.
    pub api_key: String,
    /// Redis connection URL for optional transcript persistence.
    pub redis_url: String,
    /// HTTP listen port.
    pub port: u16,
}

impl Settings {
    /// Loads settings from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if dotenvy::dotenv().is_err() {
            info!("No .env file found, reading from process environment");
        }

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidVar("PORT", raw))?,
            Err(_) => 8080,
        };

        Ok(Self {
            discord_token: required("DISCORD_TOKEN")?,
            azure_token: required("AZURE_TOKEN")?,
            elevenlabs_token: required("ELEVENLABS_TOKEN")?,
            openai_token: required("OPENAI_TOKEN")?,
            deepgram_token: required("DEEPGRAM_TOKEN")?,
            api_key: required("API_KEY")?,
            redis_url: required("REDIS")?,
            port,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}
