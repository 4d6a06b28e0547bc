//! Ordered playback of synthesized sentences.
//!
//! Synthesis may complete out of order; playback never does. Streams are
//! buffered by sentence index and played strictly in order, with the
//! container prelude trimmed from each and cancellation honored mid-frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use parley_voice::transport::toggle_speaking;
use parley_voice::SILENT_FRAME;

use crate::responder::{IndexedAudio, Responder};
use crate::transcript::TranscriptLine;

/// Outbound buffer size; one send to the frame queue per buffer.
const PLAYBACK_BUFFER: usize = 8192;

/// Per-read deadline while trimming the stream prelude.
const DISCARD_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Silent frames emitted when playback is cancelled mid-stream.
const CANCEL_SILENT_FRAMES: usize = 5;

/// Assumed speech rate for partial-utterance accounting.
const WORDS_PER_MINUTE: u64 = 150;

enum StreamOutcome {
    Completed(String),
    Cancelled,
    Failed,
}

impl Responder {
    pub(crate) async fn play_synthesized(
        self: Arc<Self>,
        received_at: Instant,
        token: CancellationToken,
        mut audio_rx: mpsc::Receiver<IndexedAudio>,
    ) {
        let prelude = self.tts().prelude_bytes();
        let mut pending: HashMap<u32, IndexedAudio> = HashMap::new();
        let mut next_index = 0u32;
        let mut first_stream = true;

        loop {
            let item = tokio::select! {
                _ = token.cancelled() => {
                    self.wind_down(None).await;
                    return;
                }
                item = audio_rx.recv() => item,
            };
            let Some(item) = item else { break };
            pending.insert(item.index, item);

            while let Some(stream) = pending.remove(&next_index) {
                toggle_speaking(self.conn.as_ref(), true).await;
                self.set_is_speaking(true);

                if first_stream {
                    info!(
                        latency_ms = received_at.elapsed().as_millis(),
                        "Transcription-to-response latency"
                    );
                    first_stream = false;
                }

                match self.play_stream(stream, prelude, &token).await {
                    StreamOutcome::Completed(sentence) => {
                        self.transcript.add_spoken(TranscriptLine::assistant(
                            sentence,
                            self.bot_name(),
                            self.bot_id(),
                        ));
                        self.reset_lines_counter();
                        next_index += 1;
                    }
                    StreamOutcome::Cancelled => return,
                    // Keep the order moving; later sentences must not stall
                    // behind a broken stream.
                    StreamOutcome::Failed => next_index += 1,
                }
            }

            let _ = self.frames_tx.send(Bytes::from_static(&SILENT_FRAME)).await;
            toggle_speaking(self.conn.as_ref(), false).await;
        }

        self.set_is_speaking(false);
    }

    async fn play_stream(
        &self,
        item: IndexedAudio,
        prelude: usize,
        token: &CancellationToken,
    ) -> StreamOutcome {
        let IndexedAudio {
            sentence,
            mut stream,
            ..
        } = item;
        let started = Instant::now();

        // Trim the container prelude ahead of usable audio.
        let mut to_discard = prelude;
        let mut carry: Option<Bytes> = None;
        while to_discard > 0 {
            let read = tokio::select! {
                _ = token.cancelled() => {
                    self.wind_down(Some((&sentence, started))).await;
                    return StreamOutcome::Cancelled;
                }
                read = timeout(DISCARD_READ_TIMEOUT, stream.chunks.recv()) => read,
            };
            match read {
                Err(_) => {
                    warn!("Timed out trimming synthesis prelude");
                    return StreamOutcome::Failed;
                }
                Ok(None) => {
                    warn!("Synthesis stream ended inside the prelude");
                    return StreamOutcome::Failed;
                }
                Ok(Some(Err(e))) => {
                    warn!(%e, "Synthesis stream error while trimming prelude");
                    return StreamOutcome::Failed;
                }
                Ok(Some(Ok(bytes))) => {
                    if bytes.len() > to_discard {
                        carry = Some(bytes.slice(to_discard..));
                        to_discard = 0;
                    } else {
                        to_discard -= bytes.len();
                    }
                }
            }
        }

        loop {
            if let Some(bytes) = carry.take() {
                for buffer in bytes.chunks(PLAYBACK_BUFFER) {
                    let frame = Bytes::copy_from_slice(buffer);
                    tokio::select! {
                        _ = token.cancelled() => {
                            self.wind_down(Some((&sentence, started))).await;
                            return StreamOutcome::Cancelled;
                        }
                        sent = self.frames_tx.send(frame) => {
                            if sent.is_err() {
                                return StreamOutcome::Failed;
                            }
                        }
                    }
                }
            }

            let read = tokio::select! {
                _ = token.cancelled() => {
                    self.wind_down(Some((&sentence, started))).await;
                    return StreamOutcome::Cancelled;
                }
                read = stream.chunks.recv() => read,
            };
            match read {
                None => break,
                Some(Ok(bytes)) => carry = Some(bytes),
                Some(Err(e)) => {
                    // Play what arrived; the sentence still counts as spoken.
                    warn!(%e, "Synthesis stream error mid-playback");
                    break;
                }
            }
        }

        StreamOutcome::Completed(sentence)
    }

    /// Cancellation epilogue: flush silence, drop the speaking flag, and
    /// account for the partially spoken sentence when one was mid-play.
    async fn wind_down(&self, partial: Option<(&str, Instant)>) {
        for _ in 0..CANCEL_SILENT_FRAMES {
            let _ = self.frames_tx.send(Bytes::from_static(&SILENT_FRAME)).await;
        }
        toggle_speaking(self.conn.as_ref(), false).await;
        self.set_is_speaking(false);

        if let Some((sentence, started)) = partial {
            let text = partial_utterance(sentence, started.elapsed());
            self.transcript.add_spoken(TranscriptLine::assistant(
                text,
                self.bot_name(),
                self.bot_id(),
            ));
        }
    }
}

/// Estimates how much of a sentence was heard before cancellation, assuming
/// 150 words per minute, and marks the cut-off.
fn partial_utterance(sentence: &str, elapsed: Duration) -> String {
    let ms_per_word = 60_000 / WORDS_PER_MINUTE;
    let elapsed_ms = elapsed.as_millis() as u64;
    let spoken = (elapsed_ms.div_ceil(ms_per_word) + 1) as usize;

    let words: Vec<&str> = sentence.split_whitespace().collect();
    let heard = spoken.min(words.len());
    format!("{}...[interrupted]", words[..heard].join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_utterance_scales_with_elapsed_time() {
        let sentence = "It is sunny today in the city.";
        assert_eq!(
            partial_utterance(sentence, Duration::from_millis(100)),
            "It is...[interrupted]"
        );
        assert_eq!(
            partial_utterance(sentence, Duration::from_millis(900)),
            "It is sunny today...[interrupted]"
        );
    }

    #[test]
    fn partial_utterance_never_exceeds_the_sentence() {
        assert_eq!(
            partial_utterance("Done.", Duration::from_secs(60)),
            "Done....[interrupted]"
        );
    }
}
