use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// One metered unit of vendor usage, published on the usage SSE feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum UsageEvent {
    #[serde(rename = "TextToSpeech", rename_all = "PascalCase")]
    Tts {
        service: String,
        model: String,
        characters: usize,
    },
    #[serde(rename = "Transcription", rename_all = "PascalCase")]
    Stt {
        service: String,
        model: String,
        minutes: f64,
    },
    #[serde(rename = "LLM", rename_all = "PascalCase")]
    Llm {
        service: String,
        model: String,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
}

impl Default for UsageEvent {
    fn default() -> Self {
        Self::Llm {
            service: String::new(),
            model: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

impl UsageEvent {
    /// True when nothing was metered; used as a guard before emission.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Tts {
                service,
                model,
                characters,
            } => service.is_empty() && model.is_empty() && *characters == 0,
            Self::Stt {
                service,
                model,
                minutes,
            } => service.is_empty() && model.is_empty() && *minutes == 0.0,
            Self::Llm {
                service,
                model,
                prompt_tokens,
                completion_tokens,
            } => {
                service.is_empty()
                    && model.is_empty()
                    && *prompt_tokens == 0
                    && *completion_tokens == 0
            }
        }
    }
}

/// Publishes usage events to the usage SSE feed, JSON-encoded.
#[derive(Clone)]
pub struct UsageMeter {
    tx: broadcast::Sender<String>,
}

impl UsageMeter {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: UsageEvent) {
        if event.is_empty() {
            return;
        }
        match serde_json::to_string(&event) {
            Ok(json) => {
                // Dropped when nobody is listening.
                let _ = self.tx.send(json);
            }
            Err(e) => debug!(%e, "Unencodable usage event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_event_is_empty() {
        assert!(UsageEvent::default().is_empty());
        assert!(!UsageEvent::Stt {
            service: "deepgram".into(),
            model: "nova-2".into(),
            minutes: 0.032,
        }
        .is_empty());
    }

    #[test]
    fn events_encode_with_type_tag() {
        let event = UsageEvent::Tts {
            service: "azure".into(),
            model: "neural".into(),
            characters: 12,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"Type\":\"TextToSpeech\""));
        assert!(json.contains("\"Characters\":12"));
    }

    #[tokio::test]
    async fn meter_publishes_non_empty_events() {
        let (tx, mut rx) = broadcast::channel(4);
        let meter = UsageMeter::new(tx);
        meter.emit(UsageEvent::default());
        meter.emit(UsageEvent::Llm {
            service: "openai".into(),
            model: "gpt-4o".into(),
            prompt_tokens: 100,
            completion_tokens: 20,
        });

        let published = rx.recv().await.unwrap();
        assert!(published.contains("\"Type\":\"LLM\""));
        assert!(rx.try_recv().is_err());
    }
}
