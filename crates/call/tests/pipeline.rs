//! End-to-end pipeline scenarios over synthetic vendor backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use parley_call::auto::run_auto_responder;
use parley_call::responder::{Responder, ResponderArgs};
use parley_call::session::{CallRegistry, JoinArgs, ProviderFactory};
use parley_call::speakers::DefaultNames;
use parley_call::transcript::Transcript;
use parley_call::usage::UsageMeter;
use parley_call::{
    CallConfig, ConfigUpdate, PromptContents, SpeakingMode, Task, Tool, TranscriberConfig,
    TranscriptConfig, VoiceUxConfig,
};
use parley_providers::{
    AudioStream, ChatMessage, LlmBackend, LlmConfigPayload, ProviderError, SttBackend, SttEvent,
    SttSession, SttStreamConfig, TtsBackend, TtsConfigPayload,
};
use parley_voice::{VoiceConnection, VoiceError, VoicePacket, SILENT_FRAME};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Synthetic backends
// ---------------------------------------------------------------------------

struct ScriptedLlm {
    tokens: Vec<&'static str>,
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn stream_chat(
        &self,
        _messages: Vec<ChatMessage>,
        _max_tokens: u32,
    ) -> Result<mpsc::Receiver<Result<String, ProviderError>>, ProviderError> {
        let (tx, rx) = mpsc::channel(16);
        let tokens: Vec<String> = self.tokens.iter().map(|t| t.to_string()).collect();
        tokio::spawn(async move {
            for token in tokens {
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn service(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }
}

/// Streams each sentence back as its own UTF-8 bytes, split into chunks
/// with a delay between them; sentences matching `slow_match` hold their
/// first chunk back to simulate slow synthesis.
struct ScriptedTts {
    chunks: usize,
    chunk_delay: Duration,
    slow_match: Option<&'static str>,
    slow_delay: Duration,
}

impl ScriptedTts {
    fn instant() -> Self {
        Self {
            chunks: 2,
            chunk_delay: Duration::ZERO,
            slow_match: None,
            slow_delay: Duration::ZERO,
        }
    }

    fn streaming(chunks: usize, chunk_delay: Duration) -> Self {
        Self {
            chunks,
            chunk_delay,
            slow_match: None,
            slow_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl TtsBackend for ScriptedTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        let (tx, rx) = mpsc::channel(4);
        let payload = Bytes::from(text.as_bytes().to_vec());
        let chunks = self.chunks;
        let chunk_delay = self.chunk_delay;
        let slow = self
            .slow_match
            .is_some_and(|needle| text.contains(needle))
            .then_some(self.slow_delay);
        tokio::spawn(async move {
            if let Some(delay) = slow {
                sleep(delay).await;
            }
            for _ in 0..chunks {
                if !chunk_delay.is_zero() {
                    sleep(chunk_delay).await;
                }
                if tx.send(Ok(payload.clone())).await.is_err() {
                    return;
                }
            }
        });
        Ok(AudioStream { chunks: rx })
    }

    fn service(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-voice"
    }

    fn prelude_bytes(&self) -> usize {
        0
    }
}

/// Hands the test a sender for each opened session so transcription events
/// can be injected.
#[derive(Clone, Default)]
struct MockStt {
    sessions: Arc<StdMutex<Vec<mpsc::Sender<SttEvent>>>>,
}

impl MockStt {
    async fn session(&self, index: usize) -> mpsc::Sender<SttEvent> {
        timeout(WAIT, async {
            loop {
                if let Some(tx) = self.sessions.lock().unwrap().get(index).cloned() {
                    return tx;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("transcription session never opened")
    }
}

#[async_trait]
impl SttBackend for MockStt {
    async fn start_stream(&self, _config: SttStreamConfig) -> Result<SttSession, ProviderError> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(16);
        let (events_tx, events_rx) = mpsc::channel(16);
        self.sessions.lock().unwrap().push(events_tx);
        tokio::spawn(async move { while audio_rx.recv().await.is_some() {} });
        Ok(SttSession {
            audio_tx,
            events_rx,
        })
    }

    fn service(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-stt"
    }
}

struct MockVoice {
    packets: Mutex<mpsc::Receiver<VoicePacket>>,
    closed: AtomicBool,
}

impl MockVoice {
    fn new() -> (mpsc::Sender<VoicePacket>, Arc<Self>) {
        let (tx, rx) = mpsc::channel(16);
        (
            tx,
            Arc::new(Self {
                packets: Mutex::new(rx),
                closed: AtomicBool::new(false),
            }),
        )
    }
}

#[async_trait]
impl VoiceConnection for MockVoice {
    async fn write_frame(&self, _frame: &[u8]) -> Result<(), VoiceError> {
        Ok(())
    }

    async fn read_packet(&self) -> Option<VoicePacket> {
        self.packets.lock().await.recv().await
    }

    async fn set_speaking(&self, _speaking: bool) -> Result<(), VoiceError> {
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct MockProviders {
    llm_tokens: Vec<&'static str>,
    stt: MockStt,
}

impl ProviderFactory for MockProviders {
    fn llm(&self, _payload: &LlmConfigPayload) -> Result<Arc<dyn LlmBackend>, ProviderError> {
        Ok(Arc::new(ScriptedLlm {
            tokens: self.llm_tokens.clone(),
        }))
    }

    fn tts(&self, _payload: &TtsConfigPayload) -> Result<Arc<dyn TtsBackend>, ProviderError> {
        Ok(Arc::new(ScriptedTts::instant()))
    }

    fn stt(&self) -> Arc<dyn SttBackend> {
        Arc::new(self.stt.clone())
    }
}

// ---------------------------------------------------------------------------
// Responder-level harness
// ---------------------------------------------------------------------------

struct Pipeline {
    responder: Arc<Responder>,
    transcript: Arc<Transcript>,
    frames: Arc<StdMutex<Vec<Bytes>>>,
    tool_rx: broadcast::Receiver<String>,
    usage_rx: broadcast::Receiver<String>,
    _packets_tx: mpsc::Sender<VoicePacket>,
    _token: CancellationToken,
}

fn pipeline(llm: ScriptedLlm, tts: ScriptedTts, ux: VoiceUxConfig, tools: Vec<Tool>) -> Pipeline {
    let (transcript_tx, _) = broadcast::channel(64);
    let (tool_tx, tool_rx) = broadcast::channel(64);
    let (usage_tx, usage_rx) = broadcast::channel(64);
    let (frames_tx, mut frames_rx) = mpsc::channel::<Bytes>(64);
    let (packets_tx, voice) = MockVoice::new();

    let transcript = Arc::new(Transcript::new(40, transcript_tx, None));
    let token = CancellationToken::new();

    let responder = Responder::new(ResponderArgs {
        bot_name: "Teno".into(),
        bot_id: "42".into(),
        transcript: Arc::clone(&transcript),
        llm: Arc::new(llm),
        tts: Arc::new(tts),
        voice_ux: ux,
        prompt_contents: PromptContents {
            bot_primer: "You are a helpful voice assistant.".into(),
            tools,
            ..Default::default()
        },
        frames_tx,
        conn: voice,
        tool_messages_tx: tool_tx,
        usage: UsageMeter::new(usage_tx),
        call_token: token.clone(),
    });

    let frames = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&frames);
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            sink.lock().unwrap().push(frame);
        }
    });

    Pipeline {
        responder,
        transcript,
        frames,
        tool_rx,
        usage_rx,
        _packets_tx: packets_tx,
        _token: token,
    }
}

fn always_speak() -> VoiceUxConfig {
    VoiceUxConfig {
        speaking_mode: SpeakingMode::AlwaysSpeak,
        lines_before_sleep: 0,
        bot_name_confidence_threshold: 0.5,
        auto_respond_interval_seconds: 0,
    }
}

fn weather_tool() -> Vec<Tool> {
    vec![Tool {
        name: "Weather".into(),
        description: "Fetches the weather".into(),
        input_guide: "A time".into(),
        output_guide: "A forecast".into(),
    }]
}

async fn await_idle(responder: &Arc<Responder>) {
    timeout(WAIT, async {
        while responder.is_responding() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("response pipeline never settled");
}

async fn await_frames(frames: &Arc<StdMutex<Vec<Bytes>>>, at_least: usize) {
    timeout(WAIT, async {
        while frames.lock().unwrap().len() < at_least {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("expected frames never arrived");
}

fn transcript_texts(transcript: &Transcript) -> Vec<String> {
    transcript.text().lines().map(str::to_string).collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

// S1: one spoken sentence plus one tool invocation.
#[tokio::test(start_paused = true)]
async fn happy_path_speaks_and_emits_tool_message() {
    let llm = ScriptedLlm {
        tokens: vec![
            "It",
            " is",
            " sunny",
            ".",
            " |",
            "[{\"name\":\"Weather\",\"input\":\"now\"}]",
        ],
    };
    let mut p = pipeline(llm, ScriptedTts::instant(), always_speak(), weather_tool());

    p.responder
        .new_transcription("what's the weather", 0.0, "Ann", "100");
    await_idle(&p.responder).await;

    let tool_event = timeout(WAIT, p.tool_rx.recv())
        .await
        .expect("no tool message published")
        .unwrap();
    assert_eq!(tool_event, r#"[{"name":"Weather","input":"now"}]"#);

    let lines = transcript_texts(&p.transcript);
    assert_eq!(
        lines,
        vec![
            "what's the weather",
            "It is sunny.",
            r#"|[{"name":"Weather","input":"now"}]"#,
        ]
    );

    // Synthesized audio reached the frame queue, followed by silence.
    let frames = p.frames.lock().unwrap();
    assert!(frames
        .iter()
        .any(|f| f.as_ref() == b"It is sunny.".as_slice()));
    assert!(frames.iter().any(|f| f.as_ref() == SILENT_FRAME.as_slice()));

    // Usage events for both the completion and the synthesis were metered.
    let mut seen = Vec::new();
    while let Ok(event) = p.usage_rx.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| e.contains("\"Type\":\"LLM\"")));
    assert!(seen.iter().any(|e| e.contains("\"Type\":\"TextToSpeech\"")));
}

// S2: the model declines to speak.
#[tokio::test(start_paused = true)]
async fn caret_token_keeps_the_bot_silent() {
    let llm = ScriptedLlm { tokens: vec!["^"] };
    let mut p = pipeline(llm, ScriptedTts::instant(), always_speak(), weather_tool());

    p.responder.new_transcription("say nothing", 0.0, "Ann", "100");
    await_idle(&p.responder).await;

    assert!(p.frames.lock().unwrap().is_empty());
    assert!(p.tool_rx.try_recv().is_err());
    assert_eq!(transcript_texts(&p.transcript), vec!["say nothing"]);
}

// S3: barge-in cancels playback mid-stream.
#[tokio::test(start_paused = true)]
async fn barge_in_cancels_playback_and_records_partial_line() {
    let llm = ScriptedLlm {
        tokens: vec!["It", " is", " sunny", "."],
    };
    let tts = ScriptedTts::streaming(50, Duration::from_millis(20));
    let p = pipeline(llm, tts, always_speak(), vec![]);

    p.responder
        .new_transcription("what's the weather", 0.0, "Ann", "100");
    await_frames(&p.frames, 2).await;

    p.responder.interim_transcription();
    await_idle(&p.responder).await;

    let frames = p.frames.lock().unwrap();
    assert!(frames.len() >= 5);
    let tail = &frames[frames.len() - 5..];
    assert!(
        tail.iter().all(|f| f.as_ref() == SILENT_FRAME.as_slice()),
        "cancellation must flush five silent frames, got {tail:?}"
    );
    drop(frames);

    let last = p.transcript.last_line().unwrap();
    assert_eq!(last.text, "It is...[interrupted]");
}

// S4: synthesis completing out of order still plays in sentence order.
#[tokio::test(start_paused = true)]
async fn playback_order_is_sentence_order() {
    let llm = ScriptedLlm {
        tokens: vec!["One", ".", " Two", "."],
    };
    let tts = ScriptedTts {
        chunks: 1,
        chunk_delay: Duration::ZERO,
        slow_match: Some("One"),
        slow_delay: Duration::from_millis(100),
    };
    let p = pipeline(llm, tts, always_speak(), vec![]);

    p.responder.new_transcription("count", 0.0, "Ann", "100");
    await_idle(&p.responder).await;

    let frames = p.frames.lock().unwrap();
    let audio: Vec<&[u8]> = frames
        .iter()
        .map(|f| f.as_ref())
        .filter(|f| *f != SILENT_FRAME.as_slice())
        .collect();
    let first_one = audio.iter().position(|f| *f == b"One.".as_slice());
    let first_two = audio.iter().position(|f| *f == b" Two.".as_slice());
    assert!(
        first_one.unwrap() < first_two.unwrap(),
        "sentence one must play before sentence two"
    );
}

// S5 / property 8: AutoSleep gating on line count and wake-word confidence.
#[tokio::test(start_paused = true)]
async fn auto_sleep_gates_responses_until_the_bot_is_named() {
    let llm = ScriptedLlm { tokens: vec!["^"] };
    let ux = VoiceUxConfig {
        speaking_mode: SpeakingMode::AutoSleep,
        lines_before_sleep: 3,
        bot_name_confidence_threshold: 0.7,
        auto_respond_interval_seconds: 0,
    };
    let p = pipeline(llm, ScriptedTts::instant(), ux, vec![]);

    for i in 0..4 {
        p.responder
            .new_transcription(&format!("chatter {i}"), 0.1, "Ann", "100");
        await_idle(&p.responder).await;
    }

    // Asleep now: a low-confidence line must not start a response.
    p.responder.new_transcription("more chatter", 0.1, "Ann", "100");
    assert!(!p.responder.is_responding());

    // Naming the bot above the threshold wakes it.
    p.responder.new_transcription("hey teno", 0.9, "Ann", "100");
    assert!(p.responder.is_responding());
}

// Property 9: the auto-responder nudges only while tasks are pending.
#[tokio::test(start_paused = true)]
async fn auto_responder_nudges_when_tasks_are_pending() {
    let llm = ScriptedLlm {
        tokens: vec!["Okay", "."],
    };
    let ux = VoiceUxConfig {
        speaking_mode: SpeakingMode::AlwaysSpeak,
        lines_before_sleep: 0,
        bot_name_confidence_threshold: 0.5,
        auto_respond_interval_seconds: 2,
    };
    let p = pipeline(llm, ScriptedTts::instant(), ux, vec![]);
    p.responder.set_prompt_contents(PromptContents {
        bot_primer: "You are a helpful voice assistant.".into(),
        tasks: vec![Task {
            name: "Report status".into(),
            description: "Tell the group how things are going".into(),
            deliverable_guide: "Say it out loud".into(),
        }],
        ..Default::default()
    });

    let token = CancellationToken::new();
    tokio::spawn(run_auto_responder(
        Arc::clone(&p.responder),
        token.clone(),
    ));

    timeout(WAIT, async {
        loop {
            if p.transcript.text().contains("Complete the task: Report status") {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("task reminder never appeared");
    token.cancel();

    timeout(WAIT, async {
        loop {
            if p.transcript.text().contains("Okay.") {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("auto response never played");
}

#[tokio::test(start_paused = true)]
async fn auto_responder_stays_quiet_without_tasks() {
    let llm = ScriptedLlm {
        tokens: vec!["Okay", "."],
    };
    let ux = VoiceUxConfig {
        speaking_mode: SpeakingMode::AlwaysSpeak,
        lines_before_sleep: 0,
        bot_name_confidence_threshold: 0.5,
        auto_respond_interval_seconds: 5,
    };
    let p = pipeline(llm, ScriptedTts::instant(), ux, vec![]);

    let token = CancellationToken::new();
    tokio::spawn(run_auto_responder(
        Arc::clone(&p.responder),
        token.clone(),
    ));

    sleep(Duration::from_secs(30)).await;
    token.cancel();

    assert!(p.transcript.is_empty());
    assert!(!p.responder.is_responding());
}

// ---------------------------------------------------------------------------
// Registry-level scenarios
// ---------------------------------------------------------------------------

fn call_config(tasks: Vec<Task>) -> CallConfig {
    CallConfig {
        bot_name: "Teno".into(),
        prompt_contents: PromptContents {
            bot_primer: "You are a helpful voice assistant.".into(),
            tasks,
            ..Default::default()
        },
        voice_ux: always_speak(),
        llm: LlmConfigPayload {
            service_name: "openai".into(),
            config: serde_json::json!({ "Model": "gpt-4o" }),
        },
        tts: TtsConfigPayload {
            service_name: "azure".into(),
            config: serde_json::json!({}),
        },
        transcript: TranscriptConfig { max_lines: 40 },
        transcriber: TranscriberConfig::default(),
    }
}

fn sample_task(name: &str) -> Task {
    Task {
        name: name.into(),
        description: "A pending task".into(),
        deliverable_guide: "Do it".into(),
    }
}

// S6: a config update that grows the task list nudges the bot.
#[tokio::test(start_paused = true)]
async fn growing_the_task_list_mid_call_nudges_the_bot() {
    let stt = MockStt::default();
    let registry = CallRegistry::new(
        Arc::new(MockProviders {
            llm_tokens: vec!["On", " it", "."],
            stt: stt.clone(),
        }),
        None,
    );

    let (_packets_tx, conn) = MockVoice::new();
    let call = registry
        .join(JoinArgs {
            bot_id: "42".into(),
            guild_id: "7".into(),
            config: call_config(vec![sample_task("First task")]),
            redis_transcript_key: None,
            conn,
            resolver: Arc::new(DefaultNames),
        })
        .await
        .unwrap();

    sleep(Duration::from_secs(5)).await;

    registry
        .update_config(
            "42",
            "7",
            ConfigUpdate {
                prompt_contents: Some(PromptContents {
                    bot_primer: "You are a helpful voice assistant.".into(),
                    tasks: vec![sample_task("First task"), sample_task("Second task")],
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .unwrap();

    timeout(WAIT, async {
        loop {
            let text = call.transcript().text();
            if text.contains("Complete the task: Second task") && text.contains("On it.") {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task nudge never produced a response");
}

// Full inbound flow: packet → speaker → transcription events → response.
#[tokio::test(start_paused = true)]
async fn packet_to_response_flow() {
    let stt = MockStt::default();
    let registry = CallRegistry::new(
        Arc::new(MockProviders {
            llm_tokens: vec!["Hi", " there", "."],
            stt: stt.clone(),
        }),
        None,
    );

    let (packets_tx, conn) = MockVoice::new();
    let call = registry
        .join(JoinArgs {
            bot_id: "42".into(),
            guild_id: "7".into(),
            config: call_config(vec![]),
            redis_transcript_key: None,
            conn,
            resolver: Arc::new(DefaultNames),
        })
        .await
        .unwrap();

    let mut transcript_rx = call.subscribe_transcript();
    let mut usage_rx = call.subscribe_usage();

    packets_tx
        .send(VoicePacket {
            user_id: 100,
            payload: Bytes::from_static(b"opus"),
        })
        .await
        .unwrap();

    let session = stt.session(0).await;
    session
        .send(SttEvent::Final {
            text: "hello bot".into(),
            search_hits: vec![],
            duration_secs: 1.92,
        })
        .await
        .unwrap();

    let user_line = timeout(WAIT, transcript_rx.recv()).await.unwrap().unwrap();
    assert!(user_line.ends_with("User: hello bot"));

    let assistant_line = timeout(WAIT, transcript_rx.recv()).await.unwrap().unwrap();
    assert!(assistant_line.ends_with("Teno: Hi there."));

    let usage = timeout(WAIT, usage_rx.recv()).await.unwrap().unwrap();
    assert!(usage.contains("\"Type\":\"Transcription\""));
    assert!(usage.contains("mock-stt"));
}

#[tokio::test(start_paused = true)]
async fn leave_tears_the_call_down_idempotently() {
    let stt = MockStt::default();
    let registry = CallRegistry::new(
        Arc::new(MockProviders {
            llm_tokens: vec!["^"],
            stt,
        }),
        None,
    );

    let (_packets_tx, conn) = MockVoice::new();
    let voice = Arc::clone(&conn);
    registry
        .join(JoinArgs {
            bot_id: "42".into(),
            guild_id: "7".into(),
            config: call_config(vec![]),
            redis_transcript_key: None,
            conn,
            resolver: Arc::new(DefaultNames),
        })
        .await
        .unwrap();

    assert_eq!(registry.active_call_count(), 1);
    assert!(registry.leave("42", "7"));
    assert!(!registry.leave("42", "7"));

    timeout(WAIT, async {
        while !voice.closed.load(Ordering::Acquire) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("voice connection never closed");
    assert_eq!(registry.active_call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_join_is_rejected() {
    let stt = MockStt::default();
    let registry = CallRegistry::new(
        Arc::new(MockProviders {
            llm_tokens: vec!["^"],
            stt,
        }),
        None,
    );

    let (_tx_a, conn_a) = MockVoice::new();
    registry
        .join(JoinArgs {
            bot_id: "42".into(),
            guild_id: "7".into(),
            config: call_config(vec![]),
            redis_transcript_key: None,
            conn: conn_a,
            resolver: Arc::new(DefaultNames),
        })
        .await
        .unwrap();

    let (_tx_b, conn_b) = MockVoice::new();
    let duplicate = registry
        .join(JoinArgs {
            bot_id: "42".into(),
            guild_id: "7".into(),
            config: call_config(vec![]),
            redis_transcript_key: None,
            conn: conn_b,
            resolver: Arc::new(DefaultNames),
        })
        .await;
    assert!(duplicate.is_err());
}
