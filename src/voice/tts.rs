//! Text-to-speech (TTS) synthesis client

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::config::VoiceParams;
use crate::{Error, Result};

/// Streamed audio bytes, playable as they arrive
pub type AudioStream = BoxStream<'static, Result<Bytes>>;

/// Produces an audio stream for a piece of text
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Request synthesized audio for `text`
    ///
    /// # Errors
    ///
    /// Returns error if the text is blank, the request fails or the service
    /// rejects it
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<AudioStream>;
}

/// Synthesizes speech through the `/tts/stream` endpoint
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSynthesizer {
    /// Create a synthesizer against a speech service base URL
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a synthesizer sharing an existing HTTP client
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build the streaming URL for one utterance
    #[must_use]
    pub fn stream_url(&self, text: &str, voice: &VoiceParams) -> String {
        format!(
            "{}/tts/stream?text={}&voice_id={}&stability={}&similarity_boost={}",
            self.base_url,
            urlencoding::encode(text),
            urlencoding::encode(&voice.voice_id),
            voice.stability,
            voice.similarity_boost,
        )
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<AudioStream> {
        if text.trim().is_empty() {
            return Err(Error::Tts("nothing to synthesize".to_string()));
        }

        let url = self.stream_url(text, voice);
        tracing::debug!(chars = text.len(), voice_id = %voice.voice_id, "requesting synthesis");

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::error!(error = %e, "synthesis request failed");
            e
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "synthesis API error");
            return Err(Error::Network(format!("synthesis error {status}: {body}")));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed())
    }
}
