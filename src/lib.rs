//! Voice pipeline - speech playback and capture for voice assistants
//!
//! This library provides the voice interaction core of an assistant UI:
//! - A speech playback queue that voices assistant text one utterance at a
//!   time, in order, without ever getting stuck on a bad utterance
//! - A speech capture session that records the microphone, streams
//!   best-effort partial transcripts, and produces one final transcript
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   submit    ┌──────────────┐  GET /tts/stream  ┌──────────────┐
//! │     Host     │────────────▶│ SpeechQueue  │──────────────────▶│  Synthesis   │
//! │ (UI, agent)  │             └──────┬───────┘                   └──────────────┘
//! │              │                    ▼ AudioSink
//! │              │               speakers
//! │              │  start/stop ┌──────────────┐  POST /stt/*      ┌──────────────┐
//! │              │────────────▶│SpeechCapture │──────────────────▶│Transcription │
//! │              │◀────────────│              │◀──────────────────│              │
//! └──────────────┘  callbacks  └──────▲───────┘                   └──────────────┘
//!                                     │ Microphone
//!                                microphone
//! ```

pub mod config;
pub mod error;
pub mod voice;

pub use config::{CaptureConfig, Config, PlaybackConfig, VoiceParams};
pub use error::{Error, Result};
pub use voice::{CaptureCallbacks, SpeechCapture, SpeechQueue};
