//! Configuration management for the voice pipeline
//!
//! Values are layered env > TOML file > defaults.

pub mod file;

use std::time::Duration;

use serde::Serialize;

use crate::{Error, Result};

pub use file::{VoicepipeConfigFile, config_file_path, load_config_file};

/// Default speech service base URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/audio";

/// Product voice identifier
pub const DEFAULT_VOICE_ID: &str = "Fahco4VZzobUeiPqni1S";

/// Fixed attenuation applied on top of the user volume
pub const VOLUME_ATTENUATION: f32 = 0.9;

/// Shortest allowed streaming interval, protects the transcription endpoint
pub const MIN_STREAMING_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest allowed capture granularity
pub const MIN_TIMESLICE: Duration = Duration::from_millis(100);

/// Voice pipeline configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Speech service base URL (`/tts/stream`, `/stt/...` are appended)
    pub base_url: String,

    /// Speech playback configuration
    pub playback: PlaybackConfig,

    /// Microphone capture configuration
    pub capture: CaptureConfig,
}

/// Voice and style parameters sent with every synthesis request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceParams {
    /// Voice identifier
    pub voice_id: String,

    /// Stability (0.0 to 1.0)
    pub stability: f32,

    /// Similarity boost (0.0 to 1.0)
    pub similarity_boost: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice_id: DEFAULT_VOICE_ID.to_string(),
            stability: 0.97,
            similarity_boost: 0.65,
        }
    }
}

/// Speech playback configuration
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackConfig {
    /// Default voice parameters
    pub voice: VoiceParams,

    /// Initial volume level (0.0 to 1.0)
    pub volume: f32,

    /// Playback rate multiplier, slightly slowed for the product voice
    pub rate: f32,

    /// Hard ceiling on one utterance, from request to end of playback
    pub utterance_timeout: Duration,

    /// How long to wait for readiness after a blocked play
    pub readiness_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            voice: VoiceParams::default(),
            volume: 0.8,
            rate: 0.94,
            utterance_timeout: Duration::from_secs(15),
            readiness_timeout: Duration::from_secs(3),
        }
    }
}

/// Microphone capture configuration
#[derive(Debug, Clone, Serialize)]
pub struct CaptureConfig {
    /// Send chunks for partial transcription while recording
    pub streaming: bool,

    /// Interval between chunk transcriptions
    pub streaming_interval: Duration,

    /// Granularity at which the microphone delivers chunks
    pub timeslice: Duration,

    /// Transcription language
    pub language: String,

    /// Transcription task
    pub task: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            streaming: false,
            streaming_interval: Duration::from_secs(2),
            timeslice: Duration::from_secs(1),
            language: "en".to_string(),
            task: "transcribe".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            playback: PlaybackConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn load() -> Result<Self> {
        let fc = load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn from_sources(
        fc: VoicepipeConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let base_url = env("VOICEPIPE_API_URL")
            .or(fc.base_url)
            .unwrap_or(defaults.base_url);
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("base URL must not be empty".to_string()));
        }

        let pb = fc.playback;
        let voice = VoiceParams {
            voice_id: env("VOICEPIPE_VOICE_ID")
                .or(pb.voice_id)
                .unwrap_or(defaults.playback.voice.voice_id),
            stability: pb.stability.unwrap_or(defaults.playback.voice.stability),
            similarity_boost: pb
                .similarity_boost
                .unwrap_or(defaults.playback.voice.similarity_boost),
        };
        let playback = PlaybackConfig {
            voice,
            volume: pb.volume.unwrap_or(defaults.playback.volume).clamp(0.0, 1.0),
            rate: pb.rate.unwrap_or(defaults.playback.rate),
            utterance_timeout: pb
                .utterance_timeout_ms
                .map_or(defaults.playback.utterance_timeout, Duration::from_millis),
            readiness_timeout: pb
                .readiness_timeout_ms
                .map_or(defaults.playback.readiness_timeout, Duration::from_millis),
        };
        if playback.rate <= 0.0 {
            return Err(Error::Config(format!(
                "playback rate must be positive, got {}",
                playback.rate
            )));
        }

        let cc = fc.capture;
        let streaming = env("VOICEPIPE_STREAMING")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
            .or(cc.streaming)
            .unwrap_or(defaults.capture.streaming);
        let streaming_interval = cc
            .streaming_interval_ms
            .map_or(defaults.capture.streaming_interval, Duration::from_millis);
        if streaming_interval < MIN_STREAMING_INTERVAL {
            tracing::warn!(
                requested_ms = streaming_interval.as_millis(),
                "streaming interval too short, clamping to 1s"
            );
        }
        let timeslice = cc
            .timeslice_ms
            .map_or(defaults.capture.timeslice, Duration::from_millis);
        if timeslice < MIN_TIMESLICE {
            tracing::warn!(
                requested_ms = timeslice.as_millis(),
                "capture timeslice too short, clamping to 100ms"
            );
        }
        let capture = CaptureConfig {
            streaming,
            streaming_interval: streaming_interval.max(MIN_STREAMING_INTERVAL),
            timeslice: timeslice.max(MIN_TIMESLICE),
            language: cc.language.unwrap_or(defaults.capture.language),
            task: cc.task.unwrap_or(defaults.capture.task),
        };

        Ok(Self {
            base_url,
            playback,
            capture,
        })
    }
}
