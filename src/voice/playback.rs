//! Audio playback to speakers
//!
//! [`AudioSink`] loads a synthesized stream into a [`Track`]. A track can be
//! told to play, asked to signal readiness, paused, and awaited until it
//! finishes. [`DeviceSink`] is the real output device; tests substitute
//! their own sinks.
//!
//! The device track decodes MP3 frames as bytes arrive and is playable as
//! soon as the first frame is decoded. Output keeps reading the growing
//! buffer and ends once the download is complete and the buffer is drained.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use super::tts::AudioStream;
use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Per-attempt output settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSettings {
    /// Effective output volume (already attenuated)
    pub volume: f32,
    /// Playback rate multiplier
    pub rate: f32,
}

/// An output device that can load synthesized audio
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Start buffering `stream` and return a controllable track
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot accept the stream
    async fn load(&self, stream: AudioStream, settings: PlaybackSettings)
    -> Result<Arc<dyn Track>>;
}

/// One loaded piece of audio
#[async_trait]
pub trait Track: Send + Sync {
    /// Try to start playback right away
    ///
    /// # Errors
    ///
    /// Returns error if playback is blocked (e.g. not enough audio buffered)
    async fn play(&self) -> Result<()>;

    /// Resolve once the track has enough audio to play
    ///
    /// # Errors
    ///
    /// Returns error if loading failed
    async fn ready(&self) -> Result<()>;

    /// Resolve when playback ends, errors, or the track is paused
    ///
    /// # Errors
    ///
    /// Returns error if playback failed
    async fn finished(&self) -> Result<()>;

    /// Change the effective volume in place
    fn set_volume(&self, volume: f32);

    /// Halt playback without waiting for the natural end
    fn pause(&self);
}

/// Plays audio to the default output device
#[derive(Debug, Clone)]
pub struct DeviceSink {
    config: StreamConfig,
}

impl DeviceSink {
    /// Create a new device sink
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }
}

#[async_trait]
impl AudioSink for DeviceSink {
    async fn load(
        &self,
        mut stream: AudioStream,
        settings: PlaybackSettings,
    ) -> Result<Arc<dyn Track>> {
        let shared = Arc::new(TrackShared::new(self.config.clone(), settings));
        let (chunk_tx, chunk_rx) = std::sync::mpsc::channel::<Bytes>();

        // minimp3 pulls from a blocking reader, so decoding gets its own thread
        let decode_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("tts-decode".to_string())
            .spawn(move || {
                let reader = ChunkReader::new(chunk_rx);
                let result = decode_into(reader, &decode_shared);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "synthesized audio decode failed");
                }
                decode_shared.complete(result.err().map(|e| e.to_string()));
            })?;

        let task_shared = Arc::clone(&shared);
        let download = tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if chunk_tx.send(bytes).is_err() {
                            // Decoder stopped (paused or failed)
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "synthesis stream failed");
                        task_shared.fail(e.to_string());
                        return;
                    }
                }
            }
            tracing::trace!("synthesis stream complete");
        });
        *shared.download.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(download.abort_handle());

        Ok(Arc::new(DeviceTrack { shared }))
    }
}

/// `Read` over chunks handed across from the download task
///
/// Blocks until the next chunk arrives and reports end of input once the
/// sending side is dropped.
struct ChunkReader {
    rx: std::sync::mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChunkReader {
    const fn new(rx: std::sync::mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.current = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Decoded mono audio, growing while the download runs
#[derive(Debug, Default)]
struct PcmBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    /// No more samples will be appended
    complete: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoadState {
    Loading,
    Ready,
    Failed(String),
}

struct TrackShared {
    config: StreamConfig,
    rate: f32,
    volume: AtomicU32,
    paused: AtomicBool,
    started: AtomicBool,
    pcm: Mutex<PcmBuffer>,
    loaded: watch::Sender<LoadState>,
    done: watch::Sender<Option<std::result::Result<(), String>>>,
    download: Mutex<Option<AbortHandle>>,
}

impl TrackShared {
    fn new(config: StreamConfig, settings: PlaybackSettings) -> Self {
        let (loaded, _) = watch::channel(LoadState::Loading);
        let (done, _) = watch::channel(None);
        Self {
            config,
            rate: settings.rate,
            volume: AtomicU32::new(settings.volume.to_bits()),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            pcm: Mutex::new(PcmBuffer {
                sample_rate: PLAYBACK_SAMPLE_RATE,
                ..PcmBuffer::default()
            }),
            loaded,
            done,
            download: Mutex::new(None),
        }
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn pcm(&self) -> MutexGuard<'_, PcmBuffer> {
        self.pcm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append decoded samples; the first frame makes the track playable
    fn push_samples(&self, sample_rate: u32, samples: &[f32]) {
        {
            let mut pcm = self.pcm();
            pcm.sample_rate = sample_rate;
            pcm.samples.extend_from_slice(samples);
        }
        self.loaded.send_if_modified(|state| {
            if *state == LoadState::Loading {
                *state = LoadState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Record a download failure
    fn fail(&self, error: String) {
        self.pcm().error.get_or_insert_with(|| error.clone());
        self.loaded.send_if_modified(|state| {
            if *state == LoadState::Loading {
                *state = LoadState::Failed(error);
                true
            } else {
                false
            }
        });
    }

    /// Mark the buffer final; a track with no audio is ready to "play" nothing
    fn complete(&self, error: Option<String>) {
        let error = {
            let mut pcm = self.pcm();
            pcm.complete = true;
            if let Some(e) = error {
                pcm.error.get_or_insert(e);
            }
            pcm.error.clone()
        };
        self.loaded.send_if_modified(|state| {
            if *state != LoadState::Loading {
                return false;
            }
            *state = error.map_or(LoadState::Ready, LoadState::Failed);
            true
        });
    }

    fn finish(&self, result: std::result::Result<(), String>) {
        self.done.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(result);
                true
            } else {
                false
            }
        });
    }
}

/// Track backed by the default output device
struct DeviceTrack {
    shared: Arc<TrackShared>,
}

#[async_trait]
impl Track for DeviceTrack {
    async fn play(&self) -> Result<()> {
        if self.shared.paused.load(Ordering::SeqCst) {
            return Err(Error::Audio("track was paused".to_string()));
        }

        let state = self.shared.loaded.borrow().clone();
        match state {
            LoadState::Ready => {}
            LoadState::Loading => {
                return Err(Error::Audio("not enough audio buffered".to_string()));
            }
            LoadState::Failed(e) => return Err(Error::Audio(e)),
        }

        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("tts-playback".to_string())
            .spawn(move || {
                let result = play_blocking(&shared);
                if let Err(e) = &result {
                    tracing::error!(error = %e, "audio playback error");
                }
                shared.finish(result.map_err(|e| e.to_string()));
            })?;

        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        let mut rx = self.shared.loaded.subscribe();
        let state = rx
            .wait_for(|s| *s != LoadState::Loading)
            .await
            .map_err(|_| Error::Audio("track dropped".to_string()))?
            .clone();
        match state {
            LoadState::Failed(e) => Err(Error::Audio(e)),
            _ => Ok(()),
        }
    }

    async fn finished(&self) -> Result<()> {
        let mut rx = self.shared.done.subscribe();
        let result = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Audio("track dropped".to_string()))?
            .clone();
        match result {
            Some(Err(e)) => Err(Error::Audio(e)),
            _ => Ok(()),
        }
    }

    fn set_volume(&self, volume: f32) {
        self.shared.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .shared
            .download
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.shared.finish(Ok(()));
    }
}

impl Drop for DeviceTrack {
    fn drop(&mut self) {
        self.pause();
    }
}

/// Play the buffer, blocking until it drains or the track is paused
fn play_blocking(shared: &Arc<TrackShared>) -> Result<()> {
    let (source_rate, empty) = {
        let pcm = shared.pcm();
        (pcm.sample_rate, pcm.complete && pcm.samples.is_empty())
    };
    if empty {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let config = shared.config.clone();
    let channels = config.channels as usize;
    let step = f64::from(shared.rate) * f64::from(source_rate) / f64::from(config.sample_rate.0);

    let drained = Arc::new(AtomicBool::new(false));
    let cb_drained = Arc::clone(&drained);
    let cb_shared = Arc::clone(shared);
    let mut position = 0.0_f64;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let volume = cb_shared.volume();
                let pcm = cb_shared.pcm();
                for frame in data.chunks_mut(channels) {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let index = position as usize;
                    let sample = if let Some(s) = pcm.samples.get(index) {
                        position += step;
                        s * volume
                    } else {
                        // Underrun while downloading holds position; silence meanwhile
                        if pcm.complete {
                            cb_drained.store(true, Ordering::SeqCst);
                        }
                        0.0
                    };
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    // Safety deadline, armed once the length is known
    let mut deadline: Option<Instant> = None;
    while !drained.load(Ordering::SeqCst) && !shared.paused.load(Ordering::SeqCst) {
        if deadline.is_none() {
            let pcm = shared.pcm();
            if pcm.complete {
                // Output frames needed to consume every source sample
                #[allow(clippy::cast_precision_loss)]
                let secs = pcm.samples.len() as f64
                    / (step.max(0.01) * f64::from(config.sample_rate.0));
                deadline = Some(
                    Instant::now() + Duration::from_secs_f64(secs) + Duration::from_millis(500),
                );
            }
        }
        if deadline.is_some_and(|d| Instant::now() > d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    let pcm = shared.pcm();
    tracing::debug!(samples = pcm.samples.len(), "playback complete");

    match &pcm.error {
        Some(e) => Err(Error::Audio(e.clone())),
        None => Ok(()),
    }
}

/// Decode MP3 frames from `reader` into the track buffer until input ends
fn decode_into(reader: impl Read, shared: &TrackShared) -> Result<()> {
    let mut decoder = minimp3::Decoder::new(reader);

    loop {
        if shared.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        match decoder.next_frame() {
            Ok(frame) => {
                let sample_rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);
                shared.push_samples(sample_rate, &frame_to_mono(&frame.data, frame.channels));
            }
            Err(minimp3::Error::Eof) => return Ok(()),
            Err(minimp3::Error::SkippedData | minimp3::Error::InsufficientData) => {}
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }
}

/// Convert interleaved i16 frame data to mono f32
fn frame_to_mono(data: &[i16], channels: usize) -> Vec<f32> {
    if channels == 2 {
        // Stereo: average channels
        data.chunks(2)
            .map(|chunk| {
                let left = f32::from(chunk[0]) / 32768.0;
                let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                f32::midpoint(left, right)
            })
            .collect()
    } else {
        data.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }
}
