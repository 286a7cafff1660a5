//! Microphone capture sessions
//!
//! [`SpeechCapture`] is the host-facing controller. Each `start` opens the
//! microphone and spawns a fresh recording session that walks
//! `Idle → Recording → Stopping → Idle` exactly once:
//!
//! - **Recording**: chunks from the device are appended to the full buffer.
//!   With streaming enabled, a ticker drains the chunks gathered since its
//!   last firing and sends them for best-effort chunk transcription without
//!   blocking capture.
//! - **Stopping**: entered on `stop`, when the device stops delivering, or
//!   when the [`StopPolicy`] says so. Timers and in-flight chunk requests are
//!   dropped, the hardware is released, and the full buffer goes out as one
//!   final transcription request.
//!
//! Chunk responses may arrive out of order; [`PartialTranscript`] applies
//! them in tick order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::capture::{AudioFormat, InputStream, Microphone};
use super::stt::{TranscriptionKind, Transcriber, transcribe_chunks};
use crate::config::{CaptureConfig, MIN_STREAMING_INTERVAL, MIN_TIMESLICE};
use crate::{Error, Result};

/// Callback receiving transcript text
pub type TranscriptCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback receiving a surfaced error
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Host callbacks fired by capture sessions
#[derive(Clone, Default)]
pub struct CaptureCallbacks {
    on_partial: Option<TranscriptCallback>,
    on_final: Option<TranscriptCallback>,
    on_error: Option<ErrorCallback>,
}

impl CaptureCallbacks {
    /// Called with the accumulated partial transcript after each applied chunk
    #[must_use]
    pub fn on_partial(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_partial = Some(Arc::new(f));
        self
    }

    /// Called once per session with the final transcript (may be empty)
    #[must_use]
    pub fn on_final(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_final = Some(Arc::new(f));
        self
    }

    /// Called for capability errors and failed final transcriptions
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    fn partial(&self, text: &str) {
        if let Some(f) = &self.on_partial {
            f(text);
        }
    }

    fn final_transcript(&self, text: &str) {
        if let Some(f) = &self.on_final {
            f(text);
        }
    }

    fn error(&self, err: &Error) {
        if let Some(f) = &self.on_error {
            f(err);
        }
    }
}

impl std::fmt::Debug for CaptureCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureCallbacks")
            .field("on_partial", &self.on_partial.is_some())
            .field("on_final", &self.on_final.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Decides whether a recording should end on its own
///
/// Consulted after every captured chunk. Sessions default to [`ManualStop`].
pub trait StopPolicy: Send {
    /// Return `true` to move the session to Stopping
    fn should_stop(&mut self, chunk: &Bytes, elapsed: Duration) -> bool;
}

/// Never stops automatically; recording ends only on `stop`
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualStop;

impl StopPolicy for ManualStop {
    fn should_stop(&mut self, _chunk: &Bytes, _elapsed: Duration) -> bool {
        false
    }
}

/// Lifecycle phase of the current session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Idle,
    Recording,
    Stopping,
}

/// Observable capture state
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub phase: SessionPhase,
    pub transcribing: bool,
    /// Accumulated partial transcript of the current or last session
    pub partial: String,
    /// Final transcript of the last completed session
    pub transcript: String,
    /// Most recent surfaced error
    pub error: Option<String>,
}

impl CaptureSnapshot {
    /// Whether the microphone is being recorded
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.phase == SessionPhase::Recording
    }
}

/// Applies chunk transcription results in tick order
///
/// Each streaming tick gets the next sequence number. A result is held back
/// until every earlier tick has resolved, so a slow response can never be
/// appended after a newer one. A failed or silent tick resolves as empty.
#[derive(Debug, Default)]
pub struct PartialTranscript {
    next_seq: u64,
    waiting: BTreeMap<u64, Option<String>>,
    text: String,
}

impl PartialTranscript {
    /// Create an empty transcript
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of tick `seq`
    ///
    /// Returns `true` if the accumulated text changed.
    pub fn apply(&mut self, seq: u64, piece: Option<String>) -> bool {
        if seq < self.next_seq {
            tracing::debug!(seq, "ignoring duplicate chunk result");
            return false;
        }
        self.waiting.insert(seq, piece);

        let mut changed = false;
        while let Some(piece) = self.waiting.remove(&self.next_seq) {
            self.next_seq += 1;
            let Some(piece) = piece else { continue };
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if !self.text.is_empty() {
                self.text.push(' ');
            }
            self.text.push_str(piece);
            changed = true;
        }
        changed
    }

    /// Accumulated text so far
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of ticks still awaited before `waiting` can drain
    #[must_use]
    pub fn held_back(&self) -> usize {
        self.waiting.len()
    }
}

/// Why a recording left the Recording phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    DeviceEnded,
    Policy,
}

type PolicyFactory = Arc<dyn Fn() -> Box<dyn StopPolicy> + Send + Sync>;

struct SessionHandle {
    stop: CancellationToken,
    task: JoinHandle<Result<String>>,
}

#[derive(Default)]
struct CaptureState {
    snapshot: CaptureSnapshot,
    session: Option<SessionHandle>,
}

struct CaptureShared {
    state: Mutex<CaptureState>,
}

impl CaptureShared {
    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut CaptureSnapshot)) {
        f(&mut self.lock().snapshot);
    }
}

/// Host-facing controller for microphone capture and transcription
pub struct SpeechCapture {
    microphone: Arc<dyn Microphone>,
    transcriber: Arc<dyn Transcriber>,
    config: CaptureConfig,
    callbacks: CaptureCallbacks,
    policy: PolicyFactory,
    shared: Arc<CaptureShared>,
    control: tokio::sync::Mutex<()>,
}

impl SpeechCapture {
    /// Create an idle capture controller
    #[must_use]
    pub fn new(
        microphone: Arc<dyn Microphone>,
        transcriber: Arc<dyn Transcriber>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            microphone,
            transcriber,
            config,
            callbacks: CaptureCallbacks::default(),
            policy: Arc::new(|| Box::new(ManualStop)),
            shared: Arc::new(CaptureShared {
                state: Mutex::new(CaptureState::default()),
            }),
            control: tokio::sync::Mutex::new(()),
        }
    }

    /// Attach host callbacks
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: CaptureCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Install an automatic stop policy, built fresh for each session
    #[must_use]
    pub fn with_stop_policy(
        mut self,
        factory: impl Fn() -> Box<dyn StopPolicy> + Send + Sync + 'static,
    ) -> Self {
        self.policy = Arc::new(factory);
        self
    }

    /// Acquire the microphone and begin recording
    ///
    /// Does nothing if a session is already recording or finishing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capability`] if the microphone cannot be opened; the
    /// controller stays idle and the call may be retried.
    pub async fn start(&self) -> Result<()> {
        let _control = self.control.lock().await;

        {
            let state = self.shared.lock();
            if state.snapshot.phase != SessionPhase::Idle {
                tracing::warn!(phase = ?state.snapshot.phase, "capture already active");
                return Ok(());
            }
        }

        let timeslice = self.config.timeslice.max(MIN_TIMESLICE);
        let input = match self.microphone.open(timeslice).await {
            Ok(input) => input,
            Err(e) => {
                let err = match e {
                    Error::Capability(_) => e,
                    other => Error::Capability(other.to_string()),
                };
                tracing::error!(error = %err, "microphone unavailable");
                self.shared.update(|s| s.error = Some(err.to_string()));
                self.callbacks.error(&err);
                return Err(err);
            }
        };

        let stop = CancellationToken::new();
        let session = RecordingSession {
            transcriber: Arc::clone(&self.transcriber),
            format: self.microphone.format(),
            config: self.config.clone(),
            callbacks: self.callbacks.clone(),
            shared: Arc::clone(&self.shared),
            policy: (self.policy)(),
            full: Vec::new(),
            streaming: Vec::new(),
            partial: PartialTranscript::new(),
        };

        let mut state = self.shared.lock();
        state.snapshot = CaptureSnapshot {
            phase: SessionPhase::Recording,
            ..CaptureSnapshot::default()
        };
        let task = tokio::spawn(session.run(input, stop.clone()));
        state.session = Some(SessionHandle { stop, task });
        drop(state);

        tracing::info!(streaming = self.config.streaming, "recording started");
        Ok(())
    }

    /// Stop recording and wait for the final transcript
    ///
    /// Returns an empty transcript when there was no session to stop.
    ///
    /// # Errors
    ///
    /// Returns error if the final transcription failed
    pub async fn stop(&self) -> Result<String> {
        let _control = self.control.lock().await;

        let Some(handle) = self.shared.lock().session.take() else {
            tracing::debug!("stop requested with no session");
            return Ok(String::new());
        };

        self.shared.update(|s| {
            // The task may already have finished on its own and gone Idle
            if s.phase == SessionPhase::Recording {
                s.phase = SessionPhase::Stopping;
            }
        });
        handle.stop.cancel();
        match handle.task.await {
            Ok(result) => result,
            Err(e) => {
                let err = Error::Stt(format!("capture session aborted: {e}"));
                self.shared.update(|s| {
                    s.phase = SessionPhase::Idle;
                    s.transcribing = false;
                    s.error = Some(err.to_string());
                });
                self.callbacks.error(&err);
                Err(err)
            }
        }
    }

    /// Start when idle, stop when recording
    ///
    /// Returns the final transcript when this call stopped a session.
    ///
    /// # Errors
    ///
    /// Returns error if starting or the final transcription fails
    pub async fn toggle(&self) -> Result<Option<String>> {
        if self.is_recording() {
            self.stop().await.map(Some)
        } else {
            self.start().await.map(|()| None)
        }
    }

    /// Copy of the observable state
    #[must_use]
    pub fn snapshot(&self) -> CaptureSnapshot {
        self.shared.lock().snapshot.clone()
    }

    /// Whether the microphone is being recorded
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.shared.lock().snapshot.is_recording()
    }

    /// Whether the final transcription is in flight
    #[must_use]
    pub fn is_transcribing(&self) -> bool {
        self.shared.lock().snapshot.transcribing
    }

    /// Most recent partial transcript
    #[must_use]
    pub fn partial_transcript(&self) -> String {
        self.shared.lock().snapshot.partial.clone()
    }

    /// Most recent surfaced error
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().snapshot.error.clone()
    }

    /// Clear partial and final transcript text
    pub fn reset_transcript(&self) {
        self.shared.update(|s| {
            s.partial.clear();
            s.transcript.clear();
        });
    }
}

impl Drop for SpeechCapture {
    fn drop(&mut self) {
        // Teardown without a final request; the session's guard releases the hardware
        if let Some(handle) = self.shared.lock().session.take() {
            handle.stop.cancel();
            handle.task.abort();
        }
    }
}

/// Releases the microphone when dropped, on every exit path
struct HardwareGuard(Box<dyn InputStream>);

impl Drop for HardwareGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Sends a chunk result when dropped, so a panicking request still resolves its tick
struct ChunkReport {
    seq: u64,
    piece: Option<String>,
    tx: mpsc::UnboundedSender<(u64, Option<String>)>,
}

impl Drop for ChunkReport {
    fn drop(&mut self) {
        let _ = self.tx.send((self.seq, self.piece.take()));
    }
}

/// One recording lifecycle
struct RecordingSession {
    transcriber: Arc<dyn Transcriber>,
    format: AudioFormat,
    config: CaptureConfig,
    callbacks: CaptureCallbacks,
    shared: Arc<CaptureShared>,
    policy: Box<dyn StopPolicy>,
    full: Vec<Bytes>,
    streaming: Vec<Bytes>,
    partial: PartialTranscript,
}

impl RecordingSession {
    async fn run(mut self, input: Box<dyn InputStream>, stop: CancellationToken) -> Result<String> {
        let mut hardware = HardwareGuard(input);
        let started = Instant::now();
        let interval = self.config.streaming_interval.max(MIN_STREAMING_INTERVAL);
        let mut ticker = tokio::time::interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        let mut next_seq = 0_u64;

        let reason = loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break StopReason::Requested,
                Some((seq, piece)) = results_rx.recv() => {
                    self.apply_chunk_result(seq, piece);
                }
                chunk = hardware.0.next_chunk() => {
                    let Some(chunk) = chunk else { break StopReason::DeviceEnded };
                    if chunk.is_empty() {
                        continue;
                    }
                    self.full.push(chunk.clone());
                    if self.config.streaming {
                        self.streaming.push(chunk.clone());
                    }
                    if self.policy.should_stop(&chunk, started.elapsed()) {
                        break StopReason::Policy;
                    }
                }
                _ = ticker.tick(), if self.config.streaming => {
                    in_flight.retain(|h| !h.is_finished());
                    if self.streaming.is_empty() {
                        tracing::trace!("no chunks to transcribe yet");
                        continue;
                    }
                    let batch = std::mem::take(&mut self.streaming);
                    let seq = next_seq;
                    next_seq += 1;
                    in_flight.push(self.spawn_chunk_request(seq, batch, results_tx.clone()));
                }
            }
        };

        // Stopping
        for handle in &in_flight {
            handle.abort();
        }
        drop(hardware);

        let has_audio = !self.full.is_empty();
        self.shared.update(|s| {
            s.phase = SessionPhase::Stopping;
            s.transcribing = has_audio;
        });
        tracing::info!(?reason, chunks = self.full.len(), "recording stopped");

        let result = if has_audio {
            match transcribe_chunks(
                self.transcriber.as_ref(),
                TranscriptionKind::Final,
                &self.full,
                &self.format,
                &self.config,
            )
            .await
            {
                Err(e) if e.is_no_speech() => {
                    tracing::info!("no speech detected in recording");
                    Ok(String::new())
                }
                other => other,
            }
        } else {
            tracing::debug!("no audio captured, skipping final transcription");
            Ok(String::new())
        };

        self.shared.update(|s| {
            s.phase = SessionPhase::Idle;
            s.transcribing = false;
            match &result {
                Ok(text) => s.transcript.clone_from(text),
                Err(e) => s.error = Some(e.to_string()),
            }
        });

        match &result {
            Ok(text) => {
                tracing::info!(transcript = %text, "transcription complete");
                self.callbacks.final_transcript(text);
            }
            Err(e) => {
                tracing::error!(error = %e, "final transcription failed");
                self.callbacks.error(e);
            }
        }

        result
    }

    fn spawn_chunk_request(
        &self,
        seq: u64,
        batch: Vec<Bytes>,
        tx: mpsc::UnboundedSender<(u64, Option<String>)>,
    ) -> JoinHandle<()> {
        tracing::debug!(seq, chunks = batch.len(), "sending chunk for transcription");
        let transcriber = Arc::clone(&self.transcriber);
        let format = self.format.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut report = ChunkReport {
                seq,
                piece: None,
                tx,
            };
            match transcribe_chunks(
                transcriber.as_ref(),
                TranscriptionKind::Chunk,
                &batch,
                &format,
                &config,
            )
            .await
            {
                Ok(text) => report.piece = Some(text),
                Err(e) if e.is_no_speech() => {
                    tracing::debug!(seq, "no speech in chunk");
                }
                Err(e) => {
                    tracing::warn!(seq, error = %e, "chunk transcription failed");
                }
            }
        })
    }

    fn apply_chunk_result(&mut self, seq: u64, piece: Option<String>) {
        if !self.partial.apply(seq, piece) {
            return;
        }
        let text = self.partial.text().to_string();
        tracing::debug!(seq, partial = %text, "partial transcription");
        self.shared.update(|s| s.partial.clone_from(&text));
        self.callbacks.partial(&text);
    }
}
