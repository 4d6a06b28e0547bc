//! Discord voice transport over serenity + songbird.
//!
//! Each call runs its own gateway client (join requests carry their own bot
//! token), with songbird handling the voice UDP session. Inbound packets
//! arrive as driver events with the Opus payload intact (`DecodeMode::
//! Decrypt`); outbound frames are fed to the driver through a DCA-framed
//! live source.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serenity::client::{Client, Context, EventHandler};
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::prelude::SerenityError;
use songbird::driver::DecodeMode;
use songbird::id::{ChannelId, GuildId};
use songbird::input::reader::MediaSource;
use songbird::input::{Codec, Container, Input, Reader};
use songbird::{CoreEvent, Event, EventContext, SerenityInit, Songbird};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{VoiceConnection, VoiceError, VoicePacket, JOIN_TIMEOUT};

pub struct DiscordVoice {
    manager: Arc<Songbird>,
    guild_id: GuildId,
    shard_manager: Arc<Mutex<serenity::client::bridge::gateway::ShardManager>>,
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
    packets_rx: Mutex<mpsc::UnboundedReceiver<VoicePacket>>,
    closed: AtomicBool,
}

impl DiscordVoice {
    /// Joins a voice channel with a dedicated gateway client and returns the
    /// live connection.
    pub async fn connect(
        bot_token: &str,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Arc<Self>, VoiceError> {
        let manager = Songbird::serenity();
        {
            let mut config = songbird::Config::default();
            // Keep payloads compressed; the STT vendor takes Opus directly.
            config.decode_mode = DecodeMode::Decrypt;
            manager.set_config(config);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
        let mut client = Client::builder(bot_token, intents)
            .event_handler(ReadyNotifier {
                ready_tx: StdMutex::new(Some(ready_tx)),
            })
            .register_songbird_with(manager.clone())
            .await
            .map_err(|e: SerenityError| VoiceError::Join(e.to_string()))?;

        let shard_manager = client.shard_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                warn!(%e, "Gateway client stopped");
            }
        });

        timeout(JOIN_TIMEOUT, ready_rx)
            .await
            .map_err(|_| VoiceError::Join("gateway ready timed out".into()))?
            .map_err(|_| VoiceError::Join("gateway client exited before ready".into()))?;

        let guild = GuildId::from(guild_id);
        let (call, join_result) = manager.join(guild, ChannelId::from(channel_id)).await;
        join_result.map_err(|e| VoiceError::Join(e.to_string()))?;
        info!(guild_id, channel_id, "Joined voice channel");

        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        {
            let mut handle = call.lock().await;
            let receiver = PacketReceiver {
                ssrc_to_user: Arc::new(RwLock::new(HashMap::new())),
                packets_tx,
            };
            handle.add_global_event(Event::Core(CoreEvent::SpeakingStateUpdate), receiver.clone());
            handle.add_global_event(Event::Core(CoreEvent::VoicePacket), receiver);

            let source = Input::new(
                true,
                Reader::Extension(Box::new(LiveOpusSource::new(frames_rx))),
                Codec::Opus,
                Container::Dca { first_frame: 0 },
                None,
            );
            handle.play_only_source(source);
        }

        Ok(Arc::new(Self {
            manager,
            guild_id: guild,
            shard_manager,
            frames_tx,
            packets_rx: Mutex::new(packets_rx),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl VoiceConnection for DiscordVoice {
    async fn write_frame(&self, frame: &[u8]) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VoiceError::Closed);
        }
        self.frames_tx
            .send(frame.to_vec())
            .map_err(|_| VoiceError::Closed)
    }

    async fn read_packet(&self) -> Option<VoicePacket> {
        self.packets_rx.lock().await.recv().await
    }

    async fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError> {
        // The driver raises the speaking flag while the live source plays;
        // there is nothing extra to signal on this transport.
        debug!(speaking, "Speaking flag handled by driver");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.manager.remove(self.guild_id).await {
            debug!(%e, "Voice handler already removed");
        }
        self.shard_manager.lock().await.shutdown_all().await;
        info!(guild_id = %self.guild_id.0, "Left voice channel");
    }
}

struct ReadyNotifier {
    ready_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl EventHandler for ReadyNotifier {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        debug!(user = %ready.user.name, "Gateway ready");
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// Maps driver events to per-user packets.
///
/// Users get an SSRC when they start speaking; the map is append-only, an
/// SSRC reused by a later user simply overwrites the entry.
#[derive(Clone)]
struct PacketReceiver {
    ssrc_to_user: Arc<RwLock<HashMap<u32, u64>>>,
    packets_tx: mpsc::UnboundedSender<VoicePacket>,
}

#[async_trait]
impl songbird::EventHandler for PacketReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(state) => {
                if let Some(user_id) = state.user_id {
                    self.ssrc_to_user
                        .write()
                        .unwrap()
                        .insert(state.ssrc, user_id.0);
                }
            }
            EventContext::VoicePacket(data) => {
                let user_id = {
                    let map = self.ssrc_to_user.read().unwrap();
                    map.get(&data.packet.ssrc).copied()
                };
                let Some(user_id) = user_id else {
                    return None;
                };
                let payload = &data.packet.payload;
                let start = data.payload_offset;
                let end = payload.len().saturating_sub(data.payload_end_pad);
                if start >= end {
                    return None;
                }
                let packet = VoicePacket {
                    user_id,
                    payload: Bytes::copy_from_slice(&payload[start..end]),
                };
                if self.packets_tx.send(packet).is_err() {
                    debug!("Packet consumer gone");
                }
            }
            _ => {}
        }
        None
    }
}

/// A live DCA-framed Opus source fed from a channel.
///
/// The driver's audio thread reads synchronously, so an empty buffer blocks
/// on the channel; a closed channel reads as end of stream.
struct LiveOpusSource {
    frames_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl LiveOpusSource {
    fn new(frames_rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            frames_rx,
            pending: Vec::new(),
            offset: 0,
        }
    }

    fn refill(&mut self) -> bool {
        match self.frames_rx.blocking_recv() {
            Some(frame) => {
                self.pending.clear();
                self.pending
                    .extend_from_slice(&(frame.len() as i16).to_le_bytes());
                self.pending.extend_from_slice(&frame);
                self.offset = 0;
                true
            }
            None => false,
        }
    }
}

impl Read for LiveOpusSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.pending.len() && !self.refill() {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

impl Seek for LiveOpusSource {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "live audio source",
        ))
    }
}

impl MediaSource for LiveOpusSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
