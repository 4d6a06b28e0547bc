use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use parley_call::speakers::NameResolver;
use parley_call::{CallConfig, ConfigUpdate, JoinArgs};
use parley_voice::VoiceConnection;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinRequest {
    #[serde(rename = "BotID")]
    pub bot_id: String,
    #[serde(rename = "BotToken")]
    pub bot_token: String,
    #[serde(rename = "GuildID")]
    pub guild_id: String,
    #[serde(rename = "ChannelID")]
    pub channel_id: String,
    #[serde(rename = "RedisTranscriptKey", default)]
    pub redis_transcript_key: Option<String>,
    #[serde(rename = "Config")]
    pub config: CallConfig,
}

pub async fn join(
    State(state): State<AppState>,
    Json(body): Json<JoinRequest>,
) -> Result<String, ApiError> {
    body.bot_id
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest("Invalid Bot ID".to_string()))?;
    let guild_id = body
        .guild_id
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest("Invalid Guild ID".to_string()))?;
    let channel_id = body
        .channel_id
        .parse::<u64>()
        .map_err(|_| ApiError::BadRequest("Invalid Channel ID".to_string()))?;

    let conn = connect_voice(&body.bot_token, guild_id, channel_id).await?;
    let resolver = name_resolver(&body.bot_token);

    state
        .registry
        .join(JoinArgs {
            bot_id: body.bot_id.clone(),
            guild_id: body.guild_id.clone(),
            config: body.config,
            redis_transcript_key: body.redis_transcript_key,
            conn,
            resolver,
        })
        .await?;

    info!(bot_id = %body.bot_id, guild_id = %body.guild_id, "Joined voice channel");
    Ok("Joined voice channel".to_string())
}

pub async fn leave(
    State(state): State<AppState>,
    Path((bot_id, guild_id)): Path<(String, String)>,
) -> String {
    if state.registry.leave(&bot_id, &guild_id) {
        "Left voice call".to_string()
    } else {
        "Not in voice call".to_string()
    }
}

pub async fn update_config(
    State(state): State<AppState>,
    Path((bot_id, guild_id)): Path<(String, String)>,
    Json(update): Json<ConfigUpdate>,
) -> Result<(), ApiError> {
    state.registry.update_config(&bot_id, &guild_id, update)?;
    Ok(())
}

#[cfg(feature = "discord")]
async fn connect_voice(
    bot_token: &str,
    guild_id: u64,
    channel_id: u64,
) -> Result<Arc<dyn VoiceConnection>, ApiError> {
    let joined = tokio::time::timeout(
        parley_voice::JOIN_TIMEOUT,
        parley_voice::discord::DiscordVoice::connect(bot_token, guild_id, channel_id),
    )
    .await
    .map_err(|_| ApiError::BadRequest("Timeout joining voice call".to_string()))?;
    let conn: Arc<dyn VoiceConnection> = joined
        .map_err(|e| ApiError::BadRequest(format!("Could not join voice call: {e}")))?;
    Ok(conn)
}

#[cfg(not(feature = "discord"))]
async fn connect_voice(
    _bot_token: &str,
    _guild_id: u64,
    _channel_id: u64,
) -> Result<Arc<dyn VoiceConnection>, ApiError> {
    Err(ApiError::BadRequest(
        parley_voice::VoiceError::NoBackend.to_string(),
    ))
}

#[cfg(feature = "discord")]
fn name_resolver(bot_token: &str) -> Arc<dyn NameResolver> {
    Arc::new(DiscordNames {
        http: Arc::new(serenity::http::Http::new(bot_token)),
    })
}

#[cfg(not(feature = "discord"))]
fn name_resolver(_bot_token: &str) -> Arc<dyn NameResolver> {
    Arc::new(parley_call::speakers::DefaultNames)
}

/// Resolves display names through the Discord member directory.
#[cfg(feature = "discord")]
struct DiscordNames {
    http: Arc<serenity::http::Http>,
}

#[cfg(feature = "discord")]
#[async_trait::async_trait]
impl NameResolver for DiscordNames {
    async fn display_name(&self, user_id: u64) -> Option<String> {
        self.http.get_user(user_id).await.ok().map(|user| user.name)
    }
}
