//! TOML configuration file loading
//!
//! Supports `~/.config/voicepipe/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoicepipeConfigFile {
    /// Speech service base URL (e.g. "http://localhost:8000/api/audio")
    #[serde(default)]
    pub base_url: Option<String>,

    /// Playback configuration
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Capture configuration
    #[serde(default)]
    pub capture: CaptureFileConfig,
}

/// Speech playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Synthesis voice identifier
    pub voice_id: Option<String>,

    /// Voice stability (0.0 to 1.0)
    pub stability: Option<f32>,

    /// Voice similarity boost (0.0 to 1.0)
    pub similarity_boost: Option<f32>,

    /// Initial volume level (0.0 to 1.0)
    pub volume: Option<f32>,

    /// Playback rate multiplier
    pub rate: Option<f32>,

    /// Per-utterance ceiling in milliseconds
    pub utterance_timeout_ms: Option<u64>,

    /// Readiness fallback timeout in milliseconds
    pub readiness_timeout_ms: Option<u64>,
}

/// Microphone capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Send chunks for partial transcription while recording
    pub streaming: Option<bool>,

    /// Interval between chunk transcriptions in milliseconds
    pub streaming_interval_ms: Option<u64>,

    /// Chunk delivery granularity in milliseconds
    pub timeslice_ms: Option<u64>,

    /// Transcription language (e.g. "en")
    pub language: Option<String>,

    /// Transcription task (e.g. "transcribe")
    pub task: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoicepipeConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoicepipeConfigFile {
    config_file_path().map_or_else(VoicepipeConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> VoicepipeConfigFile {
    if !path.exists() {
        return VoicepipeConfigFile::default();
    }

    match read_config(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VoicepipeConfigFile::default()
        }
    }
}

/// Read and parse a config file
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if the file can't be read and
/// [`crate::Error::Toml`] if it isn't valid TOML
pub fn read_config(path: &Path) -> Result<VoicepipeConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/voicepipe/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voicepipe").join("config.toml"))
}
