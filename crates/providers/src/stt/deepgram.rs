use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use super::{SearchHit, SttBackend, SttEvent, SttSession, SttStreamConfig};
use crate::ProviderError;

const LIVE_ENDPOINT: &str = "wss://api.deepgram.com/v1/listen";

/// Deepgram live-transcription backend.
///
/// Audio is Opus at 48 kHz stereo, the format Discord delivers per speaker.
pub struct DeepgramBackend {
    api_key: String,
}

impl DeepgramBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    fn stream_url(config: &SttStreamConfig) -> Result<Url, ProviderError> {
        let mut url =
            Url::parse(LIVE_ENDPOINT).map_err(|e| ProviderError::Config(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("punctuate", "true")
                .append_pair("encoding", "opus")
                .append_pair("sample_rate", "48000")
                .append_pair("channels", "2")
                .append_pair("interim_results", "true");
            if let Some(model) = &config.model {
                query.append_pair("model", model);
            }
            for keyword in &config.keywords {
                query.append_pair("keywords", keyword);
            }
            for term in &config.search_terms {
                query.append_pair("search", term);
            }
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl SttBackend for DeepgramBackend {
    async fn start_stream(&self, config: SttStreamConfig) -> Result<SttSession, ProviderError> {
        let url = Self::stream_url(&config)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key)
                .parse()
                .map_err(|_| ProviderError::Config("API key is not a valid header".into()))?,
        );

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(64);
        let (events_tx, events_rx) = mpsc::channel::<SttEvent>(64);

        // Writer: forward audio until the caller drops the sender, then close.
        tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if ws_tx.send(Message::Binary(chunk.to_vec())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })))
                .await;
            debug!("Deepgram audio stream finished");
        });

        // Reader: translate vendor messages into session events.
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_result(&text) {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        debug!(?code, "Deepgram stream closed");
                        let _ = events_tx.send(SttEvent::Closed { code }).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%e, "Deepgram stream error");
                        let _ = events_tx.send(SttEvent::Closed { code: None }).await;
                        return;
                    }
                }
            }
            let _ = events_tx.send(SttEvent::Closed { code: None }).await;
        });

        Ok(SttSession {
            audio_tx,
            events_rx,
        })
    }

    fn service(&self) -> &str {
        "deepgram"
    }

    fn model(&self) -> &str {
        "nova-2"
    }
}

/// Parses one Deepgram results message into a session event.
///
/// Non-result messages (metadata, speech-started markers) yield `None`, as
/// do results with an empty transcript.
fn parse_result(text: &str) -> Option<SttEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(%e, "Unparseable Deepgram message");
            return None;
        }
    };

    let transcript = value
        .pointer("/channel/alternatives/0/transcript")?
        .as_str()?
        .to_string();
    if transcript.is_empty() {
        return None;
    }

    let is_final = value
        .get("is_final")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !is_final {
        return Some(SttEvent::Interim { text: transcript });
    }

    let duration_secs = value
        .get("duration")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    let mut search_hits = Vec::new();
    if let Some(searches) = value.pointer("/channel/search").and_then(|v| v.as_array()) {
        for search in searches {
            let Some(query) = search.get("query").and_then(|v| v.as_str()) else {
                continue;
            };
            let confidence = search
                .pointer("/hits")
                .and_then(|v| v.as_array())
                .map(|hits| {
                    hits.iter()
                        .filter_map(|h| h.get("confidence").and_then(|c| c.as_f64()))
                        .fold(0.0_f64, f64::max)
                })
                .unwrap_or(0.0);
            search_hits.push(SearchHit {
                query: query.to_string(),
                confidence,
            });
        }
    }

    Some(SttEvent::Final {
        text: transcript,
        search_hits,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_carries_session_options() {
        let url = DeepgramBackend::stream_url(&SttStreamConfig {
            keywords: vec!["teno".into(), "weather".into()],
            search_terms: vec!["teno".into()],
            model: Some("nova-2".into()),
        })
        .unwrap();

        let query = url.query().unwrap();
        assert!(query.contains("punctuate=true"));
        assert!(query.contains("encoding=opus"));
        assert!(query.contains("sample_rate=48000"));
        assert!(query.contains("channels=2"));
        assert!(query.contains("interim_results=true"));
        assert!(query.contains("model=nova-2"));
        assert_eq!(query.matches("keywords=").count(), 2);
        assert_eq!(query.matches("search=").count(), 1);
    }

    #[test]
    fn parses_final_result_with_search_hits() {
        let message = serde_json::json!({
            "is_final": true,
            "duration": 1.92,
            "channel": {
                "alternatives": [{ "transcript": "hey teno what's up" }],
                "search": [{
                    "query": "teno",
                    "hits": [
                        { "confidence": 0.44, "start": 0.1, "end": 0.4 },
                        { "confidence": 0.91, "start": 0.5, "end": 0.8 }
                    ]
                }]
            }
        })
        .to_string();

        match parse_result(&message) {
            Some(SttEvent::Final {
                text,
                search_hits,
                duration_secs,
            }) => {
                assert_eq!(text, "hey teno what's up");
                assert_eq!(search_hits.len(), 1);
                assert_eq!(search_hits[0].query, "teno");
                assert!((search_hits[0].confidence - 0.91).abs() < f64::EPSILON);
                assert!((duration_secs - 1.92).abs() < f64::EPSILON);
            }
            other => panic!("expected final event, got {other:?}"),
        }
    }

    #[test]
    fn interim_results_and_empty_transcripts() {
        let interim = serde_json::json!({
            "is_final": false,
            "channel": { "alternatives": [{ "transcript": "hey" }] }
        })
        .to_string();
        assert!(matches!(
            parse_result(&interim),
            Some(SttEvent::Interim { .. })
        ));

        let empty = serde_json::json!({
            "is_final": true,
            "channel": { "alternatives": [{ "transcript": "" }] }
        })
        .to_string();
        assert!(parse_result(&empty).is_none());
    }
}
