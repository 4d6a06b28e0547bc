use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_providers::{AudioStream, ChatMessage, LlmBackend, TtsBackend};
use parley_voice::VoiceConnection;

use crate::config::{SpeakingMode, VoiceUxConfig};
use crate::prompt::{self, PromptContents, Tool};
use crate::splitter::{SplitAction, TokenSplitter};
use crate::tools;
use crate::transcript::{Transcript, TranscriptLine};
use crate::usage::{UsageEvent, UsageMeter};

/// Per-response cap on generated tokens.
const MAX_COMPLETION_TOKENS: u32 = 1000;

/// One synthesized sentence, tagged with its position in the response.
pub(crate) struct IndexedAudio {
    pub index: u32,
    pub sentence: String,
    pub stream: AudioStream,
}

struct ResponderState {
    awake: bool,
    user_speaking: bool,
    is_speaking: bool,
    is_responding: bool,
    lines_since_last_response: u32,
    last_response_end: Instant,
    current_response: Option<(u64, CancellationToken)>,
    next_response_id: u64,
}

pub struct ResponderArgs {
    pub bot_name: String,
    pub bot_id: String,
    pub transcript: Arc<Transcript>,
    pub llm: Arc<dyn LlmBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub voice_ux: VoiceUxConfig,
    pub prompt_contents: PromptContents,
    pub frames_tx: mpsc::Sender<Bytes>,
    pub conn: Arc<dyn VoiceConnection>,
    pub tool_messages_tx: broadcast::Sender<String>,
    pub usage: UsageMeter,
    pub call_token: CancellationToken,
}

/// The response engine for one call.
///
/// Reacts to transcription events, runs the token → sentence → synthesis →
/// playback pipeline, and owns the wake/sleep and barge-in state. At most
/// one response pipeline is in flight; starting a new one cancels its
/// predecessor through the per-response token.
pub struct Responder {
    bot_name: RwLock<String>,
    bot_id: String,
    pub(crate) transcript: Arc<Transcript>,
    llm: RwLock<Arc<dyn LlmBackend>>,
    tts: RwLock<Arc<dyn TtsBackend>>,
    voice_ux: RwLock<VoiceUxConfig>,
    prompt_contents: RwLock<PromptContents>,
    pub(crate) frames_tx: mpsc::Sender<Bytes>,
    pub(crate) conn: Arc<dyn VoiceConnection>,
    tool_messages_tx: broadcast::Sender<String>,
    usage: UsageMeter,
    call_token: CancellationToken,
    state: Mutex<ResponderState>,
}

impl Responder {
    pub fn new(args: ResponderArgs) -> Arc<Self> {
        Arc::new(Self {
            bot_name: RwLock::new(args.bot_name),
            bot_id: args.bot_id,
            transcript: args.transcript,
            llm: RwLock::new(args.llm),
            tts: RwLock::new(args.tts),
            voice_ux: RwLock::new(args.voice_ux),
            prompt_contents: RwLock::new(args.prompt_contents),
            frames_tx: args.frames_tx,
            conn: args.conn,
            tool_messages_tx: args.tool_messages_tx,
            usage: args.usage,
            call_token: args.call_token,
            state: Mutex::new(ResponderState {
                awake: true,
                user_speaking: false,
                is_speaking: false,
                is_responding: false,
                lines_since_last_response: 0,
                last_response_end: Instant::now(),
                current_response: None,
                next_response_id: 0,
            }),
        })
    }

    /// Barge-in: the user started talking over us.
    pub fn interim_transcription(&self) {
        let mut state = self.state.lock().unwrap();
        state.user_speaking = true;
        Self::cancel_current(&mut state);
    }

    /// A finalized utterance arrived from a speaker.
    pub fn new_transcription(
        self: &Arc<Self>,
        text: &str,
        bot_name_confidence: f64,
        speaker_name: &str,
        speaker_id: &str,
    ) {
        let received_at = Instant::now();
        let ux = self.voice_ux();

        let was_speaking = {
            let mut state = self.state.lock().unwrap();
            state.user_speaking = false;
            let was_speaking = state.is_speaking;
            Self::cancel_current(&mut state);
            was_speaking
        };

        self.transcript
            .add_spoken(TranscriptLine::user(text, speaker_name, speaker_id));

        let awake = {
            let mut state = self.state.lock().unwrap();
            state.lines_since_last_response += 1;
            match ux.speaking_mode {
                SpeakingMode::NeverSpeak => return,
                SpeakingMode::AlwaysSleep => state.awake = false,
                SpeakingMode::AutoSleep => {
                    if state.lines_since_last_response > ux.lines_before_sleep {
                        state.awake = false;
                    }
                    if bot_name_confidence > ux.bot_name_confidence_threshold {
                        state.awake = true;
                        state.lines_since_last_response = 0;
                    }
                }
                SpeakingMode::AlwaysSpeak => state.awake = true,
            }
            state.awake
        };

        if awake {
            if was_speaking {
                self.transcript
                    .add_interruption(speaker_name, &self.bot_name());
            }
            self.attempt_to_respond_at(true, received_at);
        }
    }

    /// Tries to start a response pipeline. Refused while the user or the bot
    /// is speaking, in `NeverSpeak` mode, or — unless `interrupt_thinking` —
    /// while another response is being thought up.
    pub fn attempt_to_respond(self: &Arc<Self>, interrupt_thinking: bool) -> bool {
        self.attempt_to_respond_at(interrupt_thinking, Instant::now())
    }

    fn attempt_to_respond_at(
        self: &Arc<Self>,
        interrupt_thinking: bool,
        received_at: Instant,
    ) -> bool {
        if self.voice_ux().speaking_mode == SpeakingMode::NeverSpeak {
            return false;
        }

        let (response_id, token) = {
            let mut state = self.state.lock().unwrap();
            if state.user_speaking || state.is_speaking {
                return false;
            }
            if !interrupt_thinking && state.is_responding {
                return false;
            }
            Self::cancel_current(&mut state);
            let token = self.call_token.child_token();
            let response_id = state.next_response_id;
            state.next_response_id += 1;
            state.current_response = Some((response_id, token.clone()));
            state.is_responding = true;
            (response_id, token)
        };

        let responder = Arc::clone(self);
        tokio::spawn(async move {
            responder.respond(received_at, response_id, token).await;
        });
        true
    }

    /// Runs one response pipeline to completion or cancellation.
    async fn respond(
        self: Arc<Self>,
        received_at: Instant,
        response_id: u64,
        token: CancellationToken,
    ) {
        let bot_name = self.bot_name();
        let contents = self.prompt_contents();
        let llm = self.llm();
        let tts = self.tts();

        let mut messages = vec![ChatMessage::system(prompt::render_system_prompt(
            &bot_name, &contents,
        ))];
        messages.extend(self.transcript.to_chat_messages());

        let (sentences_tx, sentences_rx) = mpsc::channel::<String>(16);
        let (audio_tx, audio_rx) = mpsc::channel::<IndexedAudio>(100);
        let (tool_tx, mut tool_rx) = mpsc::channel::<String>(1);

        let token_stream = tokio::spawn(Self::run_token_stream(
            llm,
            messages,
            contents.tools.clone(),
            self.usage.clone(),
            token.clone(),
            sentences_tx,
            tool_tx,
        ));
        let synthesizer = tokio::spawn(Self::run_synthesizer(
            tts,
            bot_name,
            self.usage.clone(),
            token.clone(),
            sentences_rx,
            audio_tx,
        ));
        let player = tokio::spawn(Arc::clone(&self).play_synthesized(
            received_at,
            token.clone(),
            audio_rx,
        ));

        let _ = tokio::join!(token_stream, synthesizer, player);

        if !token.is_cancelled() {
            while let Ok(tool_json) = tool_rx.try_recv() {
                self.transcript.add_tool_message(&tool_json);
                let _ = self.tool_messages_tx.send(tool_json);
            }
        }

        let mut state = self.state.lock().unwrap();
        state.last_response_end = Instant::now();
        state.is_responding = false;
        if matches!(&state.current_response, Some((id, _)) if *id == response_id) {
            state.current_response = None;
        }
    }

    /// Reads the completion stream, routing tokens into sentences and the
    /// tool-message side channel.
    async fn run_token_stream(
        llm: Arc<dyn LlmBackend>,
        messages: Vec<ChatMessage>,
        available_tools: Vec<Tool>,
        usage: UsageMeter,
        token: CancellationToken,
        sentences_tx: mpsc::Sender<String>,
        tool_tx: mpsc::Sender<String>,
    ) {
        let prompt_text: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt_tokens = llm.estimate_tokens(&prompt_text);

        let mut tokens_rx = match llm.stream_chat(messages, MAX_COMPLETION_TOKENS).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(%e, "Completion stream failed to open");
                return;
            }
        };

        let mut splitter = TokenSplitter::new();
        let mut completion_tokens: u32 = 0;

        loop {
            let item = tokio::select! {
                _ = token.cancelled() => return,
                item = tokens_rx.recv() => item,
            };
            let Some(item) = item else { break };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(%e, "Completion stream error");
                    return;
                }
            };
            completion_tokens += 1;

            match splitter.push(&chunk) {
                SplitAction::Sentence(sentence) => {
                    if sentences_tx.send(sentence).await.is_err() {
                        return;
                    }
                }
                SplitAction::Silence => {
                    debug!("Model chose silence");
                    return;
                }
                SplitAction::Buffered => {}
            }
        }

        let (remaining, tool_buffer) = splitter.finish();
        if let Some(sentence) = remaining {
            let _ = sentences_tx.send(sentence).await;
        }
        if let Some(raw) = tool_buffer {
            match tools::validate_tool_message(&raw, &available_tools) {
                Some(valid) => {
                    let _ = tool_tx.try_send(valid);
                }
                None => warn!("Invalid tool message discarded"),
            }
        }

        usage.emit(UsageEvent::Llm {
            service: llm.service().to_string(),
            model: llm.model().to_string(),
            prompt_tokens,
            completion_tokens,
        });
    }

    /// Synthesizes sentences in arrival order, tagging each audio stream
    /// with its sentence index for the player to re-order.
    async fn run_synthesizer(
        tts: Arc<dyn TtsBackend>,
        bot_name: String,
        usage: UsageMeter,
        token: CancellationToken,
        mut sentences_rx: mpsc::Receiver<String>,
        audio_tx: mpsc::Sender<IndexedAudio>,
    ) {
        let spoken_prefix = format!("{bot_name}: ");
        let mut index = 0u32;

        loop {
            let sentence = tokio::select! {
                _ = token.cancelled() => return,
                sentence = sentences_rx.recv() => match sentence {
                    Some(sentence) => sentence,
                    None => return,
                },
            };

            let speech = sentence
                .strip_prefix(&spoken_prefix)
                .unwrap_or(&sentence)
                .to_string();

            match tts.synthesize(&speech).await {
                Ok(stream) => {
                    usage.emit(UsageEvent::Tts {
                        service: tts.service().to_string(),
                        model: tts.model().to_string(),
                        characters: speech.chars().count(),
                    });
                    if audio_tx
                        .send(IndexedAudio {
                            index,
                            sentence,
                            stream,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    index += 1;
                }
                Err(e) => warn!(%e, "Speech synthesis failed"),
            }
        }
    }

    fn cancel_current(state: &mut ResponderState) {
        if let Some((_, token)) = state.current_response.take() {
            token.cancel();
        }
        // The player clears this on its cancel path too, but barge-in
        // decisions must not wait for it to wind down.
        state.is_speaking = false;
    }

    pub(crate) fn set_is_speaking(&self, speaking: bool) {
        self.state.lock().unwrap().is_speaking = speaking;
    }

    pub(crate) fn reset_lines_counter(&self) {
        self.state.lock().unwrap().lines_since_last_response = 0;
    }

    pub fn last_response_end(&self) -> Instant {
        self.state.lock().unwrap().last_response_end
    }

    pub fn is_responding(&self) -> bool {
        self.state.lock().unwrap().is_responding
    }

    pub fn bot_name(&self) -> String {
        self.bot_name.read().unwrap().clone()
    }

    pub(crate) fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn set_bot_name(&self, name: String) {
        *self.bot_name.write().unwrap() = name;
    }

    pub fn voice_ux(&self) -> VoiceUxConfig {
        self.voice_ux.read().unwrap().clone()
    }

    pub fn set_voice_ux(&self, config: VoiceUxConfig) {
        *self.voice_ux.write().unwrap() = config;
    }

    pub fn prompt_contents(&self) -> PromptContents {
        self.prompt_contents.read().unwrap().clone()
    }

    /// Swaps the prompt contents, returning the previous value.
    pub fn set_prompt_contents(&self, contents: PromptContents) -> PromptContents {
        std::mem::replace(&mut *self.prompt_contents.write().unwrap(), contents)
    }

    fn llm(&self) -> Arc<dyn LlmBackend> {
        Arc::clone(&self.llm.read().unwrap())
    }

    pub fn set_llm(&self, llm: Arc<dyn LlmBackend>) {
        *self.llm.write().unwrap() = llm;
    }

    pub(crate) fn tts(&self) -> Arc<dyn TtsBackend> {
        Arc::clone(&self.tts.read().unwrap())
    }

    pub fn set_tts(&self, tts: Arc<dyn TtsBackend>) {
        *self.tts.write().unwrap() = tts;
    }
}
