//! Speech-to-text (STT) transcription client
//!
//! Both chunk and final requests share one JSON wire shape. The helpers at
//! the bottom turn buffered chunks into a request and a response into a
//! transcript, so the capture session treats both request kinds the same way.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::capture::{AudioFormat, pcm16_to_wav};
use crate::config::CaptureConfig;
use crate::{Error, Result};

/// Which transcription endpoint a request targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscriptionKind {
    /// Best-effort partial transcription of audio since the last drain
    Chunk,
    /// Authoritative transcription of the whole recording
    Final,
}

impl TranscriptionKind {
    /// Endpoint path relative to the service base URL
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Chunk => "/stt/transcribe-chunk",
            Self::Final => "/stt/transcribe",
        }
    }
}

/// Request body for both transcription endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptionRequest {
    /// Base64-encoded audio payload
    pub audio_base64: String,
    /// Container/codec name (e.g. "wav", "webm")
    pub audio_format: String,
    /// Spoken language
    pub language: String,
    /// Service task, normally "transcribe"
    pub task: String,
}

/// Response body from both transcription endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TranscriptionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Transcribes buffered audio
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Send one transcription request
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the service answers non-2xx
    async fn transcribe(
        &self,
        kind: TranscriptionKind,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse>;
}

/// Transcribes speech through the `/stt/*` endpoints
pub struct HttpTranscriber {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTranscriber {
    /// Create a transcriber against a speech service base URL
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a transcriber sharing an existing HTTP client
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        kind: TranscriptionKind,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse> {
        let url = format!("{}{}", self.base_url, kind.path());
        tracing::debug!(
            ?kind,
            audio_bytes = request.audio_base64.len(),
            format = %request.audio_format,
            "starting transcription"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, ?kind, "transcription request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, ?kind, "transcription API error");
            return Err(Error::Network(format!("transcription error {status}: {body}")));
        }

        let result: TranscriptionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription response");
            e
        })?;

        Ok(result)
    }
}

/// Assemble buffered chunks into one request body
///
/// Raw PCM chunks are joined and wrapped in a single WAV file; already
/// encoded chunks are concatenated as-is.
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn encode_chunks(
    chunks: &[Bytes],
    format: &AudioFormat,
    options: &CaptureConfig,
) -> Result<TranscriptionRequest> {
    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();

    let (payload, format_name) = match format {
        AudioFormat::Pcm16 { sample_rate } => (pcm16_to_wav(&joined, *sample_rate)?, "wav"),
        AudioFormat::Encoded(name) => (joined, name.as_str()),
    };

    Ok(TranscriptionRequest {
        audio_base64: base64::engine::general_purpose::STANDARD.encode(payload),
        audio_format: format_name.to_string(),
        language: options.language.clone(),
        task: options.task.clone(),
    })
}

/// Turn a service response into a transcript
///
/// # Errors
///
/// Returns [`Error::EmptyResult`] when the service heard nothing (no text,
/// or an error mentioning missing audio or silence), and [`Error::Stt`] for
/// any other reported failure.
pub fn interpret_response(response: TranscriptionResponse) -> Result<String> {
    if response.success {
        let text = response.text.unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::EmptyResult);
        }
        return Ok(text.to_string());
    }

    match response.error {
        None => Err(Error::EmptyResult),
        Some(error) if is_no_speech_message(&error) => Err(Error::EmptyResult),
        Some(error) => Err(Error::Stt(error)),
    }
}

fn is_no_speech_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no audio") || lower.contains("silence") || lower.contains("no speech")
}

/// Encode, send and interpret one transcription request
///
/// # Errors
///
/// Returns error if encoding, the request, or the service fails. A
/// no-speech result comes back as [`Error::EmptyResult`].
pub async fn transcribe_chunks(
    transcriber: &dyn Transcriber,
    kind: TranscriptionKind,
    chunks: &[Bytes],
    format: &AudioFormat,
    options: &CaptureConfig,
) -> Result<String> {
    let request = encode_chunks(chunks, format, options)?;
    let response = transcriber.transcribe(kind, &request).await?;
    interpret_response(response)
}
