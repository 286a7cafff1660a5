//! Voice processing module
//!
//! Two cooperating pieces: a speech playback queue (text → synthesis →
//! speakers) and a speech capture session (microphone → transcription).
//! They share nothing beyond what the host wires between them.

mod capture;
mod playback;
mod queue;
mod session;
mod stt;
mod tts;

pub use capture::{
    AudioFormat, DeviceMicrophone, InputStream, Microphone, SAMPLE_RATE, pcm16_to_wav,
    samples_to_pcm16,
};
pub use playback::{AudioSink, DeviceSink, PlaybackSettings, Track};
pub use queue::{AttemptOutcome, SpeechQueue, Utterance};
pub use session::{
    CaptureCallbacks, CaptureSnapshot, ErrorCallback, ManualStop, PartialTranscript,
    SessionPhase, SpeechCapture, StopPolicy, TranscriptCallback,
};
pub use stt::{
    HttpTranscriber, TranscriptionKind, TranscriptionRequest, TranscriptionResponse,
    Transcriber, encode_chunks, interpret_response, transcribe_chunks,
};
pub use tts::{AudioStream, HttpSynthesizer, Synthesizer};
