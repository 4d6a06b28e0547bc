use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use parley_voice::VoicePacket;

use crate::transcriber::Transcriber;

/// One remote human whose audio is being transcribed.
pub struct Speaker {
    pub user_id: u64,
    pub name: String,
    active: AtomicBool,
    /// Guards packet forwarding so per-speaker order is preserved, and
    /// serializes session re-initialization.
    session: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl Speaker {
    fn new(user_id: u64, name: String) -> Self {
        Self {
            user_id,
            name,
            active: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Marks the speaker's session dead; the next inbound packet re-opens it.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Resolves a user id to a display name, best effort.
#[async_trait]
pub trait NameResolver: Send + Sync + 'static {
    async fn display_name(&self, user_id: u64) -> Option<String>;
}

/// Fallback resolver when no member directory is wired up.
pub struct DefaultNames;

#[async_trait]
impl NameResolver for DefaultNames {
    async fn display_name(&self, _user_id: u64) -> Option<String> {
        None
    }
}

/// Keeps one [`Speaker`] per remote user, created lazily on first packet.
pub struct SpeakerRegistry {
    bot_id: u64,
    transcriber: Arc<Transcriber>,
    resolver: Arc<dyn NameResolver>,
    /// Serializes the creation path.
    creation: Mutex<()>,
    speakers: DashMap<u64, Arc<Speaker>>,
}

impl SpeakerRegistry {
    pub fn new(
        bot_id: u64,
        transcriber: Arc<Transcriber>,
        resolver: Arc<dyn NameResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bot_id,
            transcriber,
            resolver,
            creation: Mutex::new(()),
            speakers: DashMap::new(),
        })
    }

    /// Routes one inbound packet to its speaker's transcription session.
    pub async fn handle_packet(&self, packet: VoicePacket) {
        if packet.user_id == self.bot_id {
            return;
        }
        let id_string = packet.user_id.to_string();
        if self
            .transcriber
            .config()
            .ignored_users
            .contains(&id_string)
        {
            return;
        }

        let speaker = match self.speakers.get(&packet.user_id) {
            Some(existing) => Arc::clone(&existing),
            None => {
                let _guard = self.creation.lock().await;
                match self.speakers.get(&packet.user_id) {
                    Some(existing) => Arc::clone(&existing),
                    None => {
                        let name = self
                            .resolver
                            .display_name(packet.user_id)
                            .await
                            .unwrap_or_else(|| "User".to_string());
                        debug!(user_id = packet.user_id, %name, "New speaker");
                        let speaker = Arc::new(Speaker::new(packet.user_id, name));
                        self.speakers.insert(packet.user_id, Arc::clone(&speaker));
                        speaker
                    }
                }
            }
        };

        let mut session = speaker.session.lock().await;
        if session.is_none() || !speaker.is_active() {
            match self.transcriber.open_session(Arc::clone(&speaker)).await {
                Ok(audio_tx) => {
                    speaker.activate();
                    *session = Some(audio_tx);
                }
                Err(e) => {
                    warn!(%e, user_id = packet.user_id, "Failed to open transcription session");
                    return;
                }
            }
        }

        if let Some(audio_tx) = session.as_ref() {
            if audio_tx.send(packet.payload).await.is_err() {
                speaker.deactivate();
            }
        }
    }

    pub fn speaker_count(&self) -> usize {
        self.speakers.len()
    }

    /// Drops every speaker's session sender, ending their streams.
    pub fn shutdown(&self) {
        self.speakers.clear();
    }
}
