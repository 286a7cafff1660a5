//! Sequential speech playback
//!
//! [`SpeechQueue`] voices submitted text one utterance at a time, in
//! submission order. A single worker task owns the draining; callers only
//! append. Every utterance gets exactly one playback attempt bounded by the
//! utterance ceiling, so a bad utterance can delay the queue but never
//! stall it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use super::playback::{AudioSink, PlaybackSettings, Track};
use super::tts::Synthesizer;
use crate::{Error, Result};
use crate::config::{PlaybackConfig, VOLUME_ATTENUATION, VoiceParams};

/// One unit of text queued for synthesis
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Text to speak
    pub text: String,
    /// Voice used for this utterance
    pub voice: VoiceParams,
}

/// How a playback attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Audio played to its end
    Completed,
    /// Playback was blocked and the readiness retry failed too
    Abandoned,
    /// Synthesis, loading or playback errored
    Failed,
    /// The utterance ceiling expired
    TimedOut,
    /// Cancelled by [`SpeechQueue::stop`]
    Stopped,
}

/// Progress of a single attempt
///
/// `Requested → Playing`, or `Requested → AwaitingReadiness → Playing | Abandoned`.
enum AttemptState {
    Requested,
    AwaitingReadiness(Arc<dyn Track>),
    Playing(Arc<dyn Track>),
    Abandoned,
}

impl AttemptState {
    fn name(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::AwaitingReadiness(_) => "awaiting_readiness",
            Self::Playing(_) => "playing",
            Self::Abandoned => "abandoned",
        }
    }
}

struct ActiveAttempt {
    id: u64,
    cancel: CancellationToken,
    track: Option<Arc<dyn Track>>,
}

struct QueueState {
    pending: VecDeque<Utterance>,
    active: Option<ActiveAttempt>,
    volume: f32,
    muted: bool,
    next_id: u64,
}

struct QueueShared {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    config: PlaybackConfig,
    state: Mutex<QueueState>,
    wake: Notify,
    speaking: watch::Sender<bool>,
}

/// Plays utterances strictly one at a time in submission order
pub struct SpeechQueue {
    shared: Arc<QueueShared>,
    shutdown: CancellationToken,
}

impl SpeechQueue {
    /// Create a queue and spawn its worker
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        config: PlaybackConfig,
    ) -> Self {
        let (speaking, _) = watch::channel(false);
        let volume = config.volume.clamp(0.0, 1.0);
        let shared = Arc::new(QueueShared {
            synthesizer,
            sink,
            config,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: None,
                volume,
                muted: false,
                next_id: 0,
            }),
            wake: Notify::new(),
            speaking,
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(run_worker(Arc::clone(&shared), shutdown.clone()));

        Self { shared, shutdown }
    }

    /// Queue `text` with the default voice
    ///
    /// Returns immediately. Empty text and submissions while muted are dropped.
    pub fn submit(&self, text: impl Into<String>) {
        let voice = self.shared.config.voice.clone();
        self.submit_with(text, voice);
    }

    /// Queue `text` with an explicit voice
    pub fn submit_with(&self, text: impl Into<String>, voice: VoiceParams) {
        let text = text.into();
        if text.trim().is_empty() {
            tracing::warn!("ignoring empty utterance");
            return;
        }

        {
            let mut state = self.shared.lock();
            if state.muted {
                tracing::debug!(chars = text.len(), "muted, dropping utterance");
                return;
            }
            state.pending.push_back(Utterance { text, voice });
            tracing::debug!(pending = state.pending.len(), "utterance queued");
            self.shared.speaking.send_replace(true);
        }
        self.shared.wake.notify_one();
    }

    /// Drop all pending utterances and halt the current one
    ///
    /// Idempotent.
    pub fn stop(&self) {
        let active = {
            let mut state = self.shared.lock();
            state.pending.clear();
            self.shared.speaking.send_replace(false);
            state.active.take()
        };

        if let Some(active) = active {
            active.cancel.cancel();
            if let Some(track) = active.track {
                track.pause();
            }
            tracing::info!(attempt = active.id, "speech stopped, queue cleared");
        }
    }

    /// Set the volume for the current and subsequent attempts
    pub fn set_volume(&self, level: f32) {
        let level = level.clamp(0.0, 1.0);
        let track = {
            let mut state = self.shared.lock();
            state.volume = level;
            state.active.as_ref().and_then(|a| a.track.clone())
        };
        if let Some(track) = track {
            track.set_volume(level * VOLUME_ATTENUATION);
        }
    }

    /// Current volume level (before attenuation)
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.shared.lock().volume
    }

    /// Suppress new submissions without touching queued work
    pub fn set_muted(&self, muted: bool) {
        self.shared.lock().muted = muted;
        tracing::debug!(muted, "speech mute changed");
    }

    /// Whether new submissions are being dropped
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.shared.lock().muted
    }

    /// Whether an attempt is active or work is queued
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        *self.shared.speaking.borrow()
    }

    /// Watch "is speaking" transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.speaking.subscribe()
    }

    /// Number of utterances waiting behind the current one
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Wait until the queue has drained
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|speaking| !*speaking).await;
    }
}

impl Drop for SpeechQueue {
    fn drop(&mut self) {
        self.stop();
        self.shutdown.cancel();
    }
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the next utterance and register it as the active attempt
    fn begin_next(&self) -> Option<(Utterance, u64, CancellationToken)> {
        let mut state = self.lock();
        let Some(utterance) = state.pending.pop_front() else {
            self.speaking.send_replace(false);
            return None;
        };

        state.next_id += 1;
        let id = state.next_id;
        let cancel = CancellationToken::new();
        state.active = Some(ActiveAttempt {
            id,
            cancel: cancel.clone(),
            track: None,
        });
        self.speaking.send_replace(true);
        tracing::debug!(attempt = id, remaining = state.pending.len(), "processing utterance");
        Some((utterance, id, cancel))
    }

    /// Release the attempt's resources if it is still the active one
    fn end_attempt(&self, id: u64) {
        let active = {
            let mut state = self.lock();
            if state.active.as_ref().is_some_and(|a| a.id == id) {
                state.active.take()
            } else {
                None
            }
        };
        if let Some(track) = active.and_then(|a| a.track) {
            track.pause();
        }
    }

    async fn attempt(&self, utterance: &Utterance, id: u64, cancel: &CancellationToken) -> AttemptOutcome {
        let ceiling = self.config.utterance_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => AttemptOutcome::Stopped,
            result = tokio::time::timeout(ceiling, self.drive(utterance, id)) => {
                result.unwrap_or_else(|_| {
                    tracing::warn!(attempt = id, error = %Error::Timeout(ceiling), "utterance abandoned");
                    AttemptOutcome::TimedOut
                })
            }
        }
    }

    async fn drive(&self, utterance: &Utterance, id: u64) -> AttemptOutcome {
        let mut state = AttemptState::Requested;
        loop {
            tracing::trace!(attempt = id, state = state.name(), "attempt state");
            state = match state {
                AttemptState::Requested => {
                    let track = match self.load(utterance, id).await {
                        Ok(track) => track,
                        Err(e) => {
                            tracing::warn!(attempt = id, error = %e, "synthesis failed, skipping utterance");
                            return AttemptOutcome::Failed;
                        }
                    };
                    match track.play().await {
                        Ok(()) => AttemptState::Playing(track),
                        Err(e) => {
                            tracing::debug!(attempt = id, error = %e, "immediate play blocked, awaiting readiness");
                            AttemptState::AwaitingReadiness(track)
                        }
                    }
                }
                AttemptState::AwaitingReadiness(track) => {
                    let limit = self.config.readiness_timeout;
                    match tokio::time::timeout(limit, track.ready()).await {
                        Ok(Ok(())) => match track.play().await {
                            Ok(()) => AttemptState::Playing(track),
                            Err(e) => {
                                tracing::warn!(attempt = id, error = %e, "retry play failed");
                                AttemptState::Abandoned
                            }
                        },
                        Ok(Err(e)) => {
                            tracing::warn!(attempt = id, error = %e, "track never became ready");
                            AttemptState::Abandoned
                        }
                        Err(_) => {
                            tracing::warn!(attempt = id, error = %Error::Timeout(limit), "readiness never arrived");
                            AttemptState::Abandoned
                        }
                    }
                }
                AttemptState::Playing(track) => {
                    return match track.finished().await {
                        Ok(()) => AttemptOutcome::Completed,
                        Err(e) => {
                            tracing::warn!(attempt = id, error = %e, "playback error");
                            AttemptOutcome::Failed
                        }
                    };
                }
                AttemptState::Abandoned => return AttemptOutcome::Abandoned,
            };
        }
    }

    /// Request audio and load it into a track registered on the active attempt
    async fn load(&self, utterance: &Utterance, id: u64) -> Result<Arc<dyn Track>> {
        let stream = self
            .synthesizer
            .synthesize(&utterance.text, &utterance.voice)
            .await?;

        let settings = PlaybackSettings {
            volume: self.lock().volume * VOLUME_ATTENUATION,
            rate: self.config.rate,
        };
        let track = self.sink.load(stream, settings).await?;

        let mut guard = self.lock();
        let state = &mut *guard;
        match state.active.as_mut() {
            Some(active) if active.id == id => {
                // Volume may have changed while loading
                track.set_volume(state.volume * VOLUME_ATTENUATION);
                active.track = Some(Arc::clone(&track));
            }
            _ => track.pause(),
        }
        Ok(track)
    }
}

async fn run_worker(shared: Arc<QueueShared>, shutdown: CancellationToken) {
    loop {
        let Some((utterance, id, cancel)) = shared.begin_next() else {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = shared.wake.notified() => {}
            }
            continue;
        };

        let outcome = tokio::select! {
            () = shutdown.cancelled() => {
                shared.end_attempt(id);
                break;
            }
            outcome = shared.attempt(&utterance, id, &cancel) => outcome,
        };
        shared.end_attempt(id);

        match outcome {
            AttemptOutcome::Completed => {
                tracing::debug!(attempt = id, "utterance finished");
            }
            other => {
                tracing::info!(attempt = id, outcome = ?other, "utterance ended early");
            }
        }
    }
    tracing::debug!("speech queue worker stopped");
}
