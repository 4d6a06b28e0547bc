use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{VoiceConnection, VoicePacket, FRAME_DURATION, SPEAKING_TOGGLE_TIMEOUT};

/// Pumps audio between a voice connection and the call's channels.
///
/// Outbound frames are paced to the codec cadence; inbound packets are
/// forwarded to the dispatcher. A closed read side cancels the call token,
/// tearing the whole call down.
pub struct VoiceTransport {
    conn: Arc<dyn VoiceConnection>,
    call_token: CancellationToken,
}

impl VoiceTransport {
    pub fn new(conn: Arc<dyn VoiceConnection>, call_token: CancellationToken) -> Self {
        Self { conn, call_token }
    }

    pub fn connection(&self) -> Arc<dyn VoiceConnection> {
        Arc::clone(&self.conn)
    }

    /// Runs the outbound pacer until the frame queue or the call closes.
    ///
    /// The residual of the frame duration since the previous send is slept
    /// away before each write, so wall-clock spacing between frames never
    /// drops below the codec cadence while scheduling jitter does not
    /// accumulate.
    pub async fn run_outbound(&self, mut frames_rx: mpsc::Receiver<Bytes>) {
        let mut last_sent = Instant::now() - FRAME_DURATION;
        loop {
            let frame = tokio::select! {
                _ = self.call_token.cancelled() => break,
                frame = frames_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let since_last = Instant::now().saturating_duration_since(last_sent);
            if since_last < FRAME_DURATION {
                sleep(FRAME_DURATION - since_last).await;
            }

            // Write errors are logged and dropped; the next frame is attempted.
            if let Err(e) = self.conn.write_frame(&frame).await {
                warn!(%e, "Dropping outbound frame");
            }
            last_sent = Instant::now();
        }
        debug!("Outbound frame pacer stopped");
    }

    /// Runs the inbound pump until the connection closes, forwarding each
    /// packet to `packets_tx`. A permanent close cancels the call token.
    pub async fn run_inbound(&self, packets_tx: mpsc::Sender<VoicePacket>) {
        loop {
            let packet = tokio::select! {
                _ = self.call_token.cancelled() => break,
                packet = self.conn.read_packet() => match packet {
                    Some(packet) => packet,
                    None => {
                        debug!("Voice connection closed, tearing call down");
                        self.call_token.cancel();
                        break;
                    }
                },
            };
            if packets_tx.send(packet).await.is_err() {
                break;
            }
        }
        debug!("Inbound packet pump stopped");
    }
}

/// Toggles the speaking flag, bounded by the protocol timeout. Failures are
/// logged, never propagated.
pub async fn toggle_speaking(conn: &dyn VoiceConnection, speaking: bool) {
    match timeout(SPEAKING_TOGGLE_TIMEOUT, conn.set_speaking(speaking)).await {
        Ok(Err(e)) => warn!(%e, speaking, "Failed to toggle speaking flag"),
        Err(_) => warn!(speaking, "Speaking flag toggle timed out"),
        Ok(Ok(())) => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::VoiceError;

    struct RecordingConnection {
        writes: Mutex<Vec<(Instant, Vec<u8>)>>,
        packets: tokio::sync::Mutex<mpsc::Receiver<VoicePacket>>,
    }

    impl RecordingConnection {
        fn new(packets: mpsc::Receiver<VoicePacket>) -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                packets: tokio::sync::Mutex::new(packets),
            }
        }
    }

    #[async_trait]
    impl VoiceConnection for RecordingConnection {
        async fn write_frame(&self, frame: &[u8]) -> Result<(), VoiceError> {
            self.writes
                .lock()
                .unwrap()
                .push((Instant::now(), frame.to_vec()));
            Ok(())
        }

        async fn read_packet(&self) -> Option<VoicePacket> {
            self.packets.lock().await.recv().await
        }

        async fn set_speaking(&self, _speaking: bool) -> Result<(), VoiceError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_frames_are_paced_to_the_codec_cadence() {
        let (_packets_tx, packets_rx) = mpsc::channel(1);
        let conn = Arc::new(RecordingConnection::new(packets_rx));
        let token = CancellationToken::new();
        let transport = VoiceTransport::new(conn.clone(), token.clone());

        let (frames_tx, frames_rx) = mpsc::channel(8);
        for _ in 0..3 {
            frames_tx.send(Bytes::from_static(&[0u8; 4])).await.unwrap();
        }
        drop(frames_tx);

        transport.run_outbound(frames_rx).await;

        let writes = conn.writes.lock().unwrap();
        assert_eq!(writes.len(), 3);
        for pair in writes.windows(2) {
            let spacing = pair[1].0.duration_since(pair[0].0);
            assert!(
                spacing >= FRAME_DURATION,
                "frames spaced {spacing:?}, below the codec cadence"
            );
        }
    }

    #[tokio::test]
    async fn closed_connection_cancels_the_call_token() {
        let (packets_tx, packets_rx) = mpsc::channel(1);
        let conn = Arc::new(RecordingConnection::new(packets_rx));
        let token = CancellationToken::new();
        let transport = VoiceTransport::new(conn, token.clone());

        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(4);
        packets_tx
            .send(VoicePacket {
                user_id: 7,
                payload: Bytes::from_static(b"opus"),
            })
            .await
            .unwrap();
        drop(packets_tx);

        transport.run_inbound(dispatch_tx).await;

        assert_eq!(dispatch_rx.recv().await.unwrap().user_id, 7);
        assert!(token.is_cancelled());
    }
}
