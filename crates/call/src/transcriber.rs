use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_providers::{ProviderError, SttBackend, SttEvent, SttSession, SttStreamConfig};

use crate::config::TranscriberConfig;
use crate::responder::Responder;
use crate::speakers::Speaker;
use crate::usage::{UsageEvent, UsageMeter};

/// Close codes the STT vendor uses for session timeouts and oversized
/// payloads; the speaker re-initializes on its next packet.
const TRANSIENT_CLOSE_CODES: [u16; 2] = [1008, 1011];

/// Wraps the streaming STT backend, one live session per speaker.
///
/// Sessions are opened with the bot-name tokens as search terms so every
/// final chunk carries a wake-word confidence, and with the configured
/// keywords (plus the bot-name tokens) biasing recognition.
pub struct Transcriber {
    stt: Arc<dyn SttBackend>,
    bot_name: RwLock<String>,
    config: RwLock<TranscriberConfig>,
    responder: Arc<Responder>,
    usage: UsageMeter,
}

impl Transcriber {
    pub fn new(
        stt: Arc<dyn SttBackend>,
        bot_name: String,
        config: TranscriberConfig,
        responder: Arc<Responder>,
        usage: UsageMeter,
    ) -> Arc<Self> {
        Arc::new(Self {
            stt,
            bot_name: RwLock::new(bot_name),
            config: RwLock::new(config),
            responder,
            usage,
        })
    }

    pub fn config(&self) -> TranscriberConfig {
        self.config.read().unwrap().clone()
    }

    pub fn set_config(&self, config: TranscriberConfig) {
        *self.config.write().unwrap() = config;
    }

    pub fn set_bot_name(&self, name: String) {
        *self.bot_name.write().unwrap() = name;
    }

    /// Opens a live session for a speaker and spawns its event loop.
    /// Returns the audio sender; dropping it ends the session.
    pub async fn open_session(
        self: &Arc<Self>,
        speaker: Arc<Speaker>,
    ) -> Result<mpsc::Sender<Bytes>, ProviderError> {
        let bot_tokens: Vec<String> = self
            .bot_name
            .read()
            .unwrap()
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();

        let (mut keywords, model) = {
            let config = self.config.read().unwrap();
            (config.keywords.clone(), config.model.clone())
        };
        for token in &bot_tokens {
            if !keywords.contains(token) {
                keywords.push(token.clone());
            }
        }

        let SttSession {
            audio_tx,
            mut events_rx,
        } = self
            .stt
            .start_stream(SttStreamConfig {
                keywords,
                search_terms: bot_tokens.clone(),
                model,
            })
            .await?;

        let transcriber = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    SttEvent::Interim { .. } => {
                        transcriber.responder.interim_transcription();
                    }
                    SttEvent::Final {
                        text,
                        search_hits,
                        duration_secs,
                    } => {
                        let bot_name_confidence = search_hits
                            .iter()
                            .filter(|hit| {
                                bot_tokens
                                    .iter()
                                    .any(|token| hit.query.eq_ignore_ascii_case(token))
                            })
                            .map(|hit| hit.confidence)
                            .fold(0.0_f64, f64::max);

                        transcriber.responder.new_transcription(
                            &text,
                            bot_name_confidence,
                            &speaker.name,
                            &speaker.user_id.to_string(),
                        );
                        transcriber.usage.emit(UsageEvent::Stt {
                            service: transcriber.stt.service().to_string(),
                            model: transcriber.stt.model().to_string(),
                            minutes: duration_secs / 60.0,
                        });
                    }
                    SttEvent::Closed { code } => {
                        match code {
                            Some(code) if TRANSIENT_CLOSE_CODES.contains(&code) => {
                                info!(code, user_id = speaker.user_id,
                                    "Transcription session closed; speaker re-inits on next packet");
                            }
                            other => {
                                warn!(?other, user_id = speaker.user_id,
                                    "Transcription session closed unexpectedly");
                            }
                        }
                        break;
                    }
                }
            }
            speaker.deactivate();
        });

        Ok(audio_tx)
    }
}
