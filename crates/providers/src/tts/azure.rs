use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::{AudioStream, TtsBackend};
use crate::ProviderError;

const REGION: &str = "eastus";
/// Ogg-Opus at the voice channel's native rate; no transcode needed.
const OUTPUT_FORMAT: &str = "ogg-48khz-16bit-mono-opus";
/// Bytes of Ogg container prelude (headers plus leading silence) ahead of
/// usable audio in Azure's stream.
const PRELUDE_BYTES: usize = 1700;

#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "VoiceID")]
    pub voice_id: String,
    #[serde(rename = "Language")]
    pub language: String,
    #[serde(rename = "Gender")]
    pub gender: String,
}

pub struct AzureBackend {
    config: AzureConfig,
    subscription_key: String,
    client: reqwest::Client,
}

impl AzureBackend {
    pub fn new(config: AzureConfig, subscription_key: &str) -> Self {
        Self {
            config,
            subscription_key: subscription_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let url = format!("https://{REGION}.api.cognitive.microsoft.com/sts/v1.0/issueToken");
        let response = self
            .client
            .post(url)
            .header("Ocp-Apim-Subscription-Key", &self.subscription_key)
            .send()
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ProviderError::Stream(e.to_string()))
    }

    fn ssml(&self, text: &str) -> String {
        format!(
            concat!(
                r#"<speak version="1.0" xml:lang="{lang}">"#,
                r#"<voice xml:lang="{lang}" xml:gender="{gender}" name="{voice}">{text}</voice>"#,
                "</speak>"
            ),
            lang = escape_xml(&self.config.language),
            gender = escape_xml(&self.config.gender),
            voice = escape_xml(&self.config.voice_id),
            text = escape_xml(text),
        )
    }
}

#[async_trait::async_trait]
impl TtsBackend for AzureBackend {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        let token = self.access_token().await?;
        let url = format!("https://{REGION}.tts.speech.microsoft.com/cognitiveservices/v1");

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
            .header("User-Agent", "parley")
            .body(self.ssml(text))
            .send()
            .await
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "synthesis returned {}",
                response.status()
            )));
        }

        let (chunks_tx, chunks_rx) = mpsc::channel::<Result<Bytes, ProviderError>>(16);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let item = chunk.map_err(|e| ProviderError::Stream(e.to_string()));
                let failed = item.is_err();
                if chunks_tx.send(item).await.is_err() || failed {
                    return;
                }
            }
            debug!("Azure synthesis stream finished");
        });

        Ok(AudioStream { chunks: chunks_rx })
    }

    fn service(&self) -> &str {
        "azure"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn prelude_bytes(&self) -> usize {
        PRELUDE_BYTES
    }
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
