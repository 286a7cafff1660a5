//! Shared test utilities
//!
//! In-memory stand-ins for the speech service and the audio hardware. All
//! timing goes through `tokio::time`, so tests run with a paused clock.

#![allow(dead_code, clippy::new_without_default)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use voice_pipeline::voice::{
    AudioFormat, AudioSink, AudioStream, InputStream, Microphone, PlaybackSettings, SAMPLE_RATE,
    Synthesizer, Track, TranscriptionKind, TranscriptionRequest, TranscriptionResponse,
    Transcriber,
};
use voice_pipeline::{Error, Result, VoiceParams};

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// How the mock synthesizer answers a given text
#[derive(Debug, Clone, Copy)]
pub enum SynthBehavior {
    /// Returns the text bytes as audio right away
    Instant,
    /// Never answers
    Hang,
    /// Fails the request
    Fail,
}

/// Synthesizer that echoes the text back as the "audio" body
#[derive(Default)]
pub struct MockSynthesizer {
    behaviors: HashMap<String, SynthBehavior>,
    requests: Mutex<Vec<(String, String)>>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, text: &str, behavior: SynthBehavior) -> Self {
        self.behaviors.insert(text.to_string(), behavior);
        self
    }

    /// `(text, voice_id)` for every request received
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<AudioStream> {
        self.requests
            .lock()
            .unwrap()
            .push((text.to_string(), voice.voice_id.clone()));

        let behavior = self.behaviors.get(text).copied().unwrap_or(SynthBehavior::Instant);
        match behavior {
            SynthBehavior::Instant => {
                let body = Bytes::from(text.to_string());
                Ok(futures::stream::once(async move { Ok(body) }).boxed())
            }
            SynthBehavior::Hang => futures::future::pending().await,
            SynthBehavior::Fail => Err(Error::Network("synthesis error 500".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// How a mock track behaves once loaded
#[derive(Debug, Clone, Copy)]
pub enum TrackBehavior {
    /// Plays immediately for the given length
    Plays(Duration),
    /// First play is blocked; becomes ready after `ready_after`
    BlockedThenReady {
        ready_after: Duration,
        length: Duration,
    },
    /// Play is always blocked and readiness never arrives
    BlockedForever,
    /// Readiness resolves but play stays blocked
    BlockedAfterReady,
    /// Play is blocked and readiness reports a load failure
    ReadyFails,
    /// Plays, then the device errors after `after`
    PlaybackErrors { after: Duration },
}

impl TrackBehavior {
    fn length(self) -> Duration {
        match self {
            Self::Plays(length) | Self::BlockedThenReady { length, .. } => length,
            Self::PlaybackErrors { after } => after,
            Self::BlockedForever | Self::BlockedAfterReady | Self::ReadyFails => {
                Duration::from_secs(3600)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlayEvent {
    Started(String, Instant),
    Ended(String, Instant),
}

/// Output device that records when each track starts and stops
pub struct MockSink {
    behaviors: HashMap<String, TrackBehavior>,
    load_failures: Vec<String>,
    default: TrackBehavior,
    log: Arc<Mutex<Vec<PlayEvent>>>,
    tracks: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            load_failures: Vec::new(),
            default: TrackBehavior::Plays(Duration::from_secs(1)),
            log: Arc::new(Mutex::new(Vec::new())),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, text: &str, behavior: TrackBehavior) -> Self {
        self.behaviors.insert(text.to_string(), behavior);
        self
    }

    /// Reject `text` at load time, after synthesis succeeded
    pub fn failing_load(mut self, text: &str) -> Self {
        self.load_failures.push(text.to_string());
        self
    }

    pub fn with_default(mut self, behavior: TrackBehavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn events(&self) -> Vec<PlayEvent> {
        self.log.lock().unwrap().clone()
    }

    /// Texts in the order their playback started
    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PlayEvent::Started(text, _) => Some(text),
                PlayEvent::Ended(..) => None,
            })
            .collect()
    }

    pub fn started_at(&self, text: &str) -> Option<Instant> {
        self.events().into_iter().find_map(|e| match e {
            PlayEvent::Started(t, at) if t == text => Some(at),
            _ => None,
        })
    }

    /// `(text, start, end)` for every track that started
    pub fn spans(&self) -> Vec<(String, Instant, Option<Instant>)> {
        let events = self.events();
        events
            .iter()
            .filter_map(|e| match e {
                PlayEvent::Started(text, start) => {
                    let end = events.iter().find_map(|e| match e {
                        PlayEvent::Ended(t, at) if t == text => Some(*at),
                        _ => None,
                    });
                    Some((text.clone(), *start, end))
                }
                PlayEvent::Ended(..) => None,
            })
            .collect()
    }

    pub fn track(&self, text: &str) -> Option<Arc<MockTrack>> {
        self.tracks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.text == text)
            .cloned()
    }
}

#[async_trait]
impl AudioSink for MockSink {
    async fn load(
        &self,
        mut stream: AudioStream,
        settings: PlaybackSettings,
    ) -> Result<Arc<dyn Track>> {
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        let text = String::from_utf8_lossy(&body).into_owned();
        if self.load_failures.contains(&text) {
            return Err(Error::Audio("unsupported audio format".to_string()));
        }
        let behavior = self.behaviors.get(&text).copied().unwrap_or(self.default);

        let track = Arc::new(MockTrack {
            text,
            behavior,
            log: Arc::clone(&self.log),
            volume: Mutex::new(settings.volume),
            rate: settings.rate,
            ready: AtomicBool::new(false),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            paused: CancellationToken::new(),
        });
        self.tracks.lock().unwrap().push(Arc::clone(&track));
        Ok(track)
    }
}

pub struct MockTrack {
    pub text: String,
    behavior: TrackBehavior,
    log: Arc<Mutex<Vec<PlayEvent>>>,
    volume: Mutex<f32>,
    pub rate: f32,
    ready: AtomicBool,
    started: AtomicBool,
    ended: AtomicBool,
    paused: CancellationToken,
}

impl MockTrack {
    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_cancelled()
    }

    fn mark_ended(&self) {
        if self.started.load(Ordering::SeqCst) && !self.ended.swap(true, Ordering::SeqCst) {
            self.log
                .lock()
                .unwrap()
                .push(PlayEvent::Ended(self.text.clone(), Instant::now()));
        }
    }
}

#[async_trait]
impl Track for MockTrack {
    async fn play(&self) -> Result<()> {
        if self.paused.is_cancelled() {
            return Err(Error::Audio("track paused".to_string()));
        }
        let blocked = match self.behavior {
            TrackBehavior::Plays(_) | TrackBehavior::PlaybackErrors { .. } => false,
            TrackBehavior::BlockedThenReady { .. } => !self.ready.load(Ordering::SeqCst),
            TrackBehavior::BlockedForever
            | TrackBehavior::BlockedAfterReady
            | TrackBehavior::ReadyFails => true,
        };
        if blocked {
            return Err(Error::Audio("not enough audio buffered".to_string()));
        }

        self.started.store(true, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push(PlayEvent::Started(self.text.clone(), Instant::now()));
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        match self.behavior {
            TrackBehavior::Plays(_)
            | TrackBehavior::PlaybackErrors { .. }
            | TrackBehavior::BlockedAfterReady => Ok(()),
            TrackBehavior::ReadyFails => Err(Error::Audio("decode failed".to_string())),
            TrackBehavior::BlockedThenReady { ready_after, .. } => {
                tokio::time::sleep(ready_after).await;
                self.ready.store(true, Ordering::SeqCst);
                Ok(())
            }
            TrackBehavior::BlockedForever => futures::future::pending().await,
        }
    }

    async fn finished(&self) -> Result<()> {
        let interrupted = tokio::select! {
            () = tokio::time::sleep(self.behavior.length()) => false,
            () = self.paused.cancelled() => true,
        };
        self.mark_ended();
        match self.behavior {
            TrackBehavior::PlaybackErrors { .. } if !interrupted => {
                Err(Error::Audio("output device lost".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume;
    }

    fn pause(&self) {
        self.paused.cancel();
        self.mark_ended();
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Microphone fed by the test through [`MockMicrophone::push`]
pub struct MockMicrophone {
    format: AudioFormat,
    available: AtomicBool,
    feed: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    opens: AtomicUsize,
    timeslices: Mutex<Vec<Duration>>,
    releases: Arc<AtomicUsize>,
}

impl MockMicrophone {
    pub fn new() -> Self {
        Self::with_format(AudioFormat::Pcm16 {
            sample_rate: SAMPLE_RATE,
        })
    }

    pub fn with_format(format: AudioFormat) -> Self {
        Self {
            format,
            available: AtomicBool::new(true),
            feed: Mutex::new(None),
            opens: AtomicUsize::new(0),
            timeslices: Mutex::new(Vec::new()),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `open` fail as if permission were denied
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Deliver one chunk to the live stream
    pub fn push(&self, chunk: impl Into<Bytes>) {
        if let Some(tx) = self.feed.lock().unwrap().as_ref() {
            let _ = tx.send(chunk.into());
        }
    }

    /// Simulate the device ending the stream
    pub fn end(&self) {
        self.feed.lock().unwrap().take();
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Timeslice requested by every `open`
    pub fn timeslices(&self) -> Vec<Duration> {
        self.timeslices.lock().unwrap().clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for MockMicrophone {
    fn format(&self) -> AudioFormat {
        self.format.clone()
    }

    async fn open(&self, timeslice: Duration) -> Result<Box<dyn InputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.timeslices.lock().unwrap().push(timeslice);
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Capability("permission denied".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        Ok(Box::new(MockInputStream {
            rx,
            released: false,
            releases: Arc::clone(&self.releases),
        }))
    }
}

struct MockInputStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
    released: bool,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl InputStream for MockInputStream {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        if self.released {
            return None;
        }
        self.rx.recv().await
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Two bytes of silence in 16-bit PCM
pub fn pcm_chunk() -> Bytes {
    Bytes::from_static(&[0, 0, 1, 0])
}

// ---------------------------------------------------------------------------
// Transcription
// ---------------------------------------------------------------------------

/// Scripted answer from the transcription service
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// `success: false` with a "No audio" style message
    NoSpeech,
    /// `success: false` with another message
    ServerError(String),
    /// Transport failure
    Fail,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    fn into_response(self) -> Result<TranscriptionResponse> {
        match self {
            Self::Text(text) => Ok(TranscriptionResponse {
                success: true,
                text: Some(text),
                error: None,
            }),
            Self::NoSpeech => Ok(TranscriptionResponse {
                success: false,
                text: None,
                error: Some("No audio detected".to_string()),
            }),
            Self::ServerError(error) => Ok(TranscriptionResponse {
                success: false,
                text: None,
                error: Some(error),
            }),
            Self::Fail => Err(Error::Network("connection refused".to_string())),
        }
    }
}

/// Transcriber answering chunk requests from a script and final requests
/// with a fixed reply
pub struct ScriptedTranscriber {
    chunks: Mutex<VecDeque<(Duration, Reply)>>,
    final_reply: Mutex<Reply>,
    calls: Mutex<Vec<(TranscriptionKind, TranscriptionRequest)>>,
}

impl ScriptedTranscriber {
    pub fn new(final_reply: Reply) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            final_reply: Mutex::new(final_reply),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue the reply for the next chunk request
    pub fn chunk(self, reply: Reply) -> Self {
        self.delayed_chunk(Duration::ZERO, reply)
    }

    /// Queue a reply that arrives after `delay`
    pub fn delayed_chunk(self, delay: Duration, reply: Reply) -> Self {
        self.chunks.lock().unwrap().push_back((delay, reply));
        self
    }

    pub fn set_final(&self, reply: Reply) {
        *self.final_reply.lock().unwrap() = reply;
    }

    pub fn calls(&self, kind: TranscriptionKind) -> Vec<TranscriptionRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        kind: TranscriptionKind,
        request: &TranscriptionRequest,
    ) -> Result<TranscriptionResponse> {
        self.calls.lock().unwrap().push((kind, request.clone()));

        let (delay, reply) = match kind {
            TranscriptionKind::Chunk => self
                .chunks
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Duration::ZERO, Reply::NoSpeech)),
            TranscriptionKind::Final => (Duration::ZERO, self.final_reply.lock().unwrap().clone()),
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reply.into_response()
    }
}

/// Collects callback invocations for assertions
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, value: impl Into<String>) {
        self.0.lock().unwrap().push(value.into());
    }

    pub fn values(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
