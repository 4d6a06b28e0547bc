use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use parley_providers::{
    parse_llm_config, parse_tts_config, LlmBackend, LlmConfigPayload, ProviderError, SttBackend,
    TtsBackend, TtsConfigPayload,
};
use parley_voice::transport::toggle_speaking;
use parley_voice::{VoiceConnection, VoiceTransport, SILENT_FRAME};

use crate::auto::run_auto_responder;
use crate::config::{CallConfig, ConfigUpdate};
use crate::responder::{Responder, ResponderArgs};
use crate::speakers::{NameResolver, SpeakerRegistry};
use crate::transcriber::Transcriber;
use crate::transcript::Transcript;
use crate::usage::UsageMeter;
use crate::CallError;

/// How long voice-channel teardown may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Config updates that grow the task list only nudge the bot once the call
/// has settled past its join burst.
const TASK_NUDGE_MIN_AGE: Duration = Duration::from_secs(3);

/// Capacity of the observer feeds; laggards drop events, never back-pressure.
const SSE_CHANNEL_CAPACITY: usize = 64;

/// Credentials handed to vendor backends when a config payload carries none.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub openai: String,
    pub azure: String,
    pub elevenlabs: String,
}

impl ProviderKeys {
    pub fn tts_key(&self, service_name: &str) -> &str {
        match service_name {
            "azure" => &self.azure,
            "elevenlabs" => &self.elevenlabs,
            _ => "",
        }
    }
}

/// Builds vendor backends for new calls and live config swaps.
pub trait ProviderFactory: Send + Sync + 'static {
    fn llm(&self, payload: &LlmConfigPayload) -> Result<Arc<dyn LlmBackend>, ProviderError>;
    fn tts(&self, payload: &TtsConfigPayload) -> Result<Arc<dyn TtsBackend>, ProviderError>;
    fn stt(&self) -> Arc<dyn SttBackend>;
}

/// The production factory: config payloads select real vendor backends.
pub struct VendorProviders {
    pub keys: ProviderKeys,
    pub stt: Arc<dyn SttBackend>,
}

impl ProviderFactory for VendorProviders {
    fn llm(&self, payload: &LlmConfigPayload) -> Result<Arc<dyn LlmBackend>, ProviderError> {
        parse_llm_config(payload, &self.keys.openai)
    }

    fn tts(&self, payload: &TtsConfigPayload) -> Result<Arc<dyn TtsBackend>, ProviderError> {
        parse_tts_config(payload, self.keys.tts_key(&payload.service_name))
    }

    fn stt(&self) -> Arc<dyn SttBackend> {
        Arc::clone(&self.stt)
    }
}

pub struct JoinArgs {
    pub bot_id: String,
    pub guild_id: String,
    pub config: CallConfig,
    pub redis_transcript_key: Option<String>,
    pub conn: Arc<dyn VoiceConnection>,
    pub resolver: Arc<dyn NameResolver>,
}

/// One active voice-channel session.
pub struct Call {
    pub id: String,
    started_at: Instant,
    token: CancellationToken,
    pub(crate) responder: Arc<Responder>,
    pub(crate) transcriber: Arc<Transcriber>,
    pub(crate) transcript: Arc<Transcript>,
    transcript_tx: broadcast::Sender<String>,
    tool_messages_tx: broadcast::Sender<String>,
    usage_tx: broadcast::Sender<String>,
}

impl Call {
    pub fn subscribe_transcript(&self) -> broadcast::Receiver<String> {
        self.transcript_tx.subscribe()
    }

    pub fn subscribe_tool_messages(&self) -> broadcast::Receiver<String> {
        self.tool_messages_tx.subscribe()
    }

    pub fn subscribe_usage(&self) -> broadcast::Receiver<String> {
        self.usage_tx.subscribe()
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Signals teardown. Safe to call more than once.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn responder(&self) -> &Arc<Responder> {
        &self.responder
    }

    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }
}

/// All live calls, keyed by `"{bot_id}-{guild_id}"`.
pub struct CallRegistry {
    calls: DashMap<String, Arc<Call>>,
    providers: Arc<dyn ProviderFactory>,
    redis: Option<ConnectionManager>,
}

impl CallRegistry {
    pub fn new(providers: Arc<dyn ProviderFactory>, redis: Option<ConnectionManager>) -> Arc<Self> {
        Arc::new(Self {
            calls: DashMap::new(),
            providers,
            redis,
        })
    }

    pub fn call_id(bot_id: &str, guild_id: &str) -> String {
        format!("{bot_id}-{guild_id}")
    }

    pub fn get(&self, bot_id: &str, guild_id: &str) -> Option<Arc<Call>> {
        self.calls
            .get(&Self::call_id(bot_id, guild_id))
            .map(|entry| Arc::clone(&entry))
    }

    pub fn active_call_count(&self) -> usize {
        self.calls.len()
    }

    /// Creates a call over an already-joined voice connection and spawns its
    /// long-lived tasks.
    pub async fn join(self: &Arc<Self>, args: JoinArgs) -> Result<Arc<Call>, CallError> {
        args.config.validate()?;

        let id = Self::call_id(&args.bot_id, &args.guild_id);
        if self.calls.contains_key(&id) {
            return Err(CallError::AlreadyJoined);
        }

        let llm = self.providers.llm(&args.config.llm)?;
        let tts = self.providers.tts(&args.config.tts)?;

        let token = CancellationToken::new();
        let (transcript_tx, _) = broadcast::channel(SSE_CHANNEL_CAPACITY);
        let (tool_messages_tx, _) = broadcast::channel(SSE_CHANNEL_CAPACITY);
        let (usage_tx, _) = broadcast::channel(SSE_CHANNEL_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(8);
        let (packets_tx, mut packets_rx) = mpsc::channel(64);

        let redis_sink = match (&self.redis, &args.redis_transcript_key) {
            (Some(conn), Some(key)) if !key.is_empty() => Some((conn.clone(), key.clone())),
            _ => None,
        };

        let transcript = Arc::new(Transcript::new(
            args.config.transcript.max_lines,
            transcript_tx.clone(),
            redis_sink,
        ));
        let usage = UsageMeter::new(usage_tx.clone());

        let responder = Responder::new(ResponderArgs {
            bot_name: args.config.bot_name.clone(),
            bot_id: args.bot_id.clone(),
            transcript: Arc::clone(&transcript),
            llm,
            tts,
            voice_ux: args.config.voice_ux.clone(),
            prompt_contents: args.config.prompt_contents.clone(),
            frames_tx: frames_tx.clone(),
            conn: Arc::clone(&args.conn),
            tool_messages_tx: tool_messages_tx.clone(),
            usage: usage.clone(),
            call_token: token.clone(),
        });

        let transcriber = Transcriber::new(
            self.providers.stt(),
            args.config.bot_name.clone(),
            args.config.transcriber.clone(),
            Arc::clone(&responder),
            usage.clone(),
        );

        let bot_user_id = args.bot_id.parse::<u64>().unwrap_or_default();
        let speakers = SpeakerRegistry::new(bot_user_id, Arc::clone(&transcriber), args.resolver);

        let transport = Arc::new(VoiceTransport::new(Arc::clone(&args.conn), token.clone()));

        // Announce presence before any audio flows.
        toggle_speaking(args.conn.as_ref(), true).await;
        let _ = frames_tx.send(Bytes::from_static(&SILENT_FRAME)).await;

        let outbound = Arc::clone(&transport);
        tokio::spawn(async move { outbound.run_outbound(frames_rx).await });

        let inbound = Arc::clone(&transport);
        tokio::spawn(async move { inbound.run_inbound(packets_tx).await });

        let dispatch_speakers = Arc::clone(&speakers);
        let dispatch_token = token.clone();
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = dispatch_token.cancelled() => break,
                    packet = packets_rx.recv() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                };
                dispatch_speakers.handle_packet(packet).await;
            }
            debug!("Packet dispatcher stopped");
        });

        tokio::spawn(run_auto_responder(Arc::clone(&responder), token.clone()));

        let call = Arc::new(Call {
            id: id.clone(),
            started_at: Instant::now(),
            token: token.clone(),
            responder,
            transcriber,
            transcript,
            transcript_tx,
            tool_messages_tx,
            usage_tx,
        });
        self.calls.insert(id.clone(), Arc::clone(&call));
        info!(call_id = %id, "Call started");

        // Teardown runs exactly once, from whichever side cancels first.
        let registry = Arc::clone(self);
        let conn = args.conn;
        let teardown_speakers = speakers;
        tokio::spawn(async move {
            token.cancelled().await;
            teardown_speakers.shutdown();
            if timeout(CLOSE_TIMEOUT, conn.close()).await.is_err() {
                debug!(call_id = %id, "Voice close timed out");
            }
            registry.calls.remove(&id);
            info!(call_id = %id, "Call ended");
        });

        Ok(call)
    }

    /// Tears down a call. Returns false when no such call exists.
    pub fn leave(&self, bot_id: &str, guild_id: &str) -> bool {
        match self.calls.remove(&Self::call_id(bot_id, guild_id)) {
            Some((_, call)) => {
                call.close();
                true
            }
            None => false,
        }
    }

    /// Applies a partial config update to a live call. Every carried field
    /// is validated before anything is swapped.
    pub fn update_config(
        &self,
        bot_id: &str,
        guild_id: &str,
        update: ConfigUpdate,
    ) -> Result<(), CallError> {
        let call = self.get(bot_id, guild_id).ok_or(CallError::NotFound)?;

        if let Some(ux) = &update.voice_ux {
            ux.validate()?;
        }
        if let Some(tc) = &update.transcript {
            tc.validate()?;
        }
        if let Some(pc) = &update.prompt_contents {
            pc.validate()?;
        }
        let new_llm = match &update.llm {
            Some(payload) => Some(self.providers.llm(payload)?),
            None => None,
        };
        let new_tts = match &update.tts {
            Some(payload) => Some(self.providers.tts(payload)?),
            None => None,
        };

        if let Some(name) = update.bot_name.filter(|n| !n.trim().is_empty()) {
            call.responder.set_bot_name(name.clone());
            call.transcriber.set_bot_name(name);
        }
        if let Some(config) = update.transcriber {
            call.transcriber.set_config(config);
        }
        if let Some(ux) = update.voice_ux {
            call.responder.set_voice_ux(ux);
        }
        if let Some(contents) = update.prompt_contents {
            let previous = call.responder.set_prompt_contents(contents.clone());

            if contents.documents.len() > previous.documents.len() {
                call.transcript.add_new_document_alert();
            }

            let tasks_grew = contents.tasks.len() > previous.tasks.len();
            if tasks_grew && call.age() > TASK_NUDGE_MIN_AGE {
                let first_new = &contents.tasks[previous.tasks.len()];
                call.transcript.add_task_reminder(&first_new.name);
                call.responder.attempt_to_respond(false);
            }
        }
        if let Some(config) = update.transcript {
            call.transcript.set_max_lines(config.max_lines);
        }
        if let Some(tts) = new_tts {
            call.responder.set_tts(tts);
        }
        if let Some(llm) = new_llm {
            call.responder.set_llm(llm);
        }

        Ok(())
    }

    /// Tears down every call; used at server shutdown.
    pub fn shutdown(&self) {
        for entry in self.calls.iter() {
            entry.value().close();
        }
    }
}
