use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use parley_providers::ChatMessage;

/// How long a transcript persistence write may take before being abandoned.
const REDIS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone)]
pub struct TranscriptLine {
    pub kind: LineKind,
    pub text: String,
    pub speaker_name: String,
    pub speaker_id: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptLine {
    pub fn user(text: impl Into<String>, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: LineKind::User,
            text: text.into(),
            speaker_name: name.into(),
            speaker_id: id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(
        text: impl Into<String>,
        name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            kind: LineKind::Assistant,
            text: text.into(),
            speaker_name: name.into(),
            speaker_id: id.into(),
            timestamp: Utc::now(),
        }
    }

    fn system(text: impl Into<String>) -> Self {
        Self {
            kind: LineKind::System,
            text: text.into(),
            speaker_name: String::new(),
            speaker_id: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// `[HH:MM:SS] Name: text` — the SSE and persistence wire form.
    pub fn formatted(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.speaker_name,
            self.text.trim()
        )
    }
}

struct Inner {
    lines: VecDeque<TranscriptLine>,
    max_lines: usize,
}

#[derive(Clone)]
struct RedisSink {
    conn: ConnectionManager,
    key: String,
}

/// The bounded, shared log of call lines.
///
/// Spoken lines fan out to the SSE channel (best effort, never blocking the
/// pipeline) and, when a persistence key is configured, to a Redis sorted
/// set scored by timestamp. The in-memory log is the source of truth for
/// LLM context.
pub struct Transcript {
    inner: Mutex<Inner>,
    sse_tx: broadcast::Sender<String>,
    redis: Option<RedisSink>,
}

impl Transcript {
    pub fn new(
        max_lines: usize,
        sse_tx: broadcast::Sender<String>,
        redis: Option<(ConnectionManager, String)>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::new(),
                max_lines,
            }),
            sse_tx,
            redis: redis.map(|(conn, key)| RedisSink { conn, key }),
        }
    }

    fn push(&self, line: TranscriptLine) {
        let mut inner = self.inner.lock().unwrap();
        if inner.lines.len() >= inner.max_lines {
            inner.lines.pop_front();
        }
        debug!(line = %line.formatted(), "Transcript line");
        inner.lines.push_back(line);
    }

    /// Appends a spoken line, publishing it to the SSE feed and the
    /// persistence sink.
    pub fn add_spoken(&self, line: TranscriptLine) {
        let formatted = line.formatted();

        if let Some(sink) = &self.redis {
            let member = format!(
                "<{}>{}<{}>",
                line.speaker_id,
                formatted,
                line.timestamp.timestamp_millis()
            );
            let score = line.timestamp.timestamp_millis();
            let mut conn = sink.conn.clone();
            let key = sink.key.clone();
            tokio::spawn(async move {
                let write = conn.zadd::<_, _, _, ()>(key, member, score);
                match tokio::time::timeout(REDIS_WRITE_TIMEOUT, write).await {
                    Ok(Err(e)) => warn!(%e, "Transcript persistence write failed"),
                    Err(_) => warn!("Transcript persistence write timed out"),
                    Ok(Ok(())) => {}
                }
            });
        }

        self.push(line);

        // Dropped when nobody is listening; observers never back-pressure.
        let _ = self.sse_tx.send(formatted);
    }

    pub fn add_interruption(&self, user_name: &str, bot_name: &str) {
        self.push(TranscriptLine::system(format!(
            "[{user_name} interrupted {bot_name}]"
        )));
    }

    pub fn add_task_reminder(&self, task_name: &str) {
        self.push(TranscriptLine::system(format!(
            "Complete the task: {task_name}"
        )));
    }

    pub fn add_new_document_alert(&self) {
        self.push(TranscriptLine::system(
            "New document available, please relay the relevant information to the voice channel",
        ));
    }

    pub fn add_tool_message(&self, tool_message: &str) {
        self.push(TranscriptLine {
            kind: LineKind::Assistant,
            text: format!("|{tool_message}"),
            speaker_name: String::new(),
            speaker_id: String::new(),
            timestamp: Utc::now(),
        });
    }

    /// Renders the log as chat messages. Consecutive assistant lines
    /// coalesce into a single message; user lines carry a speaker prefix.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        let inner = self.inner.lock().unwrap();
        let mut messages = Vec::with_capacity(inner.lines.len());
        let mut assistant_buffer = String::new();

        for line in &inner.lines {
            match line.kind {
                LineKind::Assistant => {
                    assistant_buffer.push_str(&line.text);
                    assistant_buffer.push(' ');
                    continue;
                }
                LineKind::System => {
                    flush_assistant(&mut messages, &mut assistant_buffer);
                    messages.push(ChatMessage::system(line.text.clone()));
                }
                LineKind::User => {
                    flush_assistant(&mut messages, &mut assistant_buffer);
                    messages.push(ChatMessage::user(format!(
                        "{}: {}",
                        line.speaker_name, line.text
                    )));
                }
            }
        }
        flush_assistant(&mut messages, &mut assistant_buffer);
        messages
    }

    /// Raw newline-joined text form, for prompts that inline the transcript.
    pub fn text(&self) -> String {
        let inner = self.inner.lock().unwrap();
        inner
            .lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_line(&self) -> Option<TranscriptLine> {
        self.inner.lock().unwrap().lines.back().cloned()
    }

    pub fn set_max_lines(&self, max_lines: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_lines = max_lines;
        while inner.lines.len() > max_lines {
            inner.lines.pop_front();
        }
    }
}

fn flush_assistant(messages: &mut Vec<ChatMessage>, buffer: &mut String) {
    if !buffer.is_empty() {
        messages.push(ChatMessage::assistant(buffer.trim().to_string()));
        buffer.clear();
    }
}
