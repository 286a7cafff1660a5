//! Error types for the voice pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone unavailable, access denied, or unsupported platform
    #[error("capability error: {0}")]
    Capability(String),

    /// Remote endpoint answered with a non-success status
    #[error("network error: {0}")]
    Network(String),

    /// Operation exceeded its time budget
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Transcription service heard nothing
    ///
    /// Normalized to an empty transcript before reaching callers.
    #[error("no speech detected")]
    EmptyResult,

    /// Audio device or decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error means "the audio held no speech"
    #[must_use]
    pub const fn is_no_speech(&self) -> bool {
        matches!(self, Self::EmptyResult)
    }
}
