//! Audio capture from microphone

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::oneshot;
use tokio::time::{Instant, Interval};

use crate::config::MIN_TIMESLICE;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Encoding of the chunks a microphone delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormat {
    /// Raw mono little-endian 16-bit PCM
    Pcm16 { sample_rate: u32 },
    /// Already encoded, concatenable chunks (e.g. "webm")
    Encoded(String),
}

/// A source of microphone audio
///
/// Opening is where permission and hardware failures surface; callers
/// treat any error here as a capability problem.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Format of the chunks produced by [`InputStream::next_chunk`]
    fn format(&self) -> AudioFormat;

    /// Acquire the device and start delivering chunks every `timeslice`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capability`] if the device cannot be opened
    async fn open(&self, timeslice: Duration) -> Result<Box<dyn InputStream>>;
}

/// A live capture holding the microphone hardware
#[async_trait]
pub trait InputStream: Send {
    /// Wait for the next chunk; `None` once the device stops delivering
    async fn next_chunk(&mut self) -> Option<Bytes>;

    /// Release the hardware. Must be safe to call more than once.
    fn release(&mut self);
}

/// Captures audio from the default input device
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceMicrophone;

impl DeviceMicrophone {
    /// Create a microphone bound to the default input device
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Microphone for DeviceMicrophone {
    fn format(&self) -> AudioFormat {
        AudioFormat::Pcm16 {
            sample_rate: SAMPLE_RATE,
        }
    }

    async fn open(&self, timeslice: Duration) -> Result<Box<dyn InputStream>> {
        // A zero period would panic the ticker
        let timeslice = timeslice.max(MIN_TIMESLICE);
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let ended = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        // cpal streams aren't Send, so the stream lives on its own thread
        let thread_buffer = Arc::clone(&buffer);
        let thread_ended = Arc::clone(&ended);
        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || match build_input_stream(thread_buffer, thread_ended) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until release or the sender is dropped
                    let _ = release_rx.recv();
                    drop(stream);
                    tracing::debug!("audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .await
            .map_err(|_| Error::Capability("capture thread exited".to_string()))??;

        tracing::debug!(timeslice_ms = timeslice.as_millis(), "audio capture started");

        Ok(Box::new(DeviceInputStream {
            buffer,
            ended,
            release: Some(release_tx),
            ticker: tokio::time::interval_at(Instant::now() + timeslice, timeslice),
        }))
    }
}

fn build_input_stream(buffer: Arc<Mutex<Vec<f32>>>, ended: Arc<AtomicBool>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Capability("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Capability(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Capability("no suitable audio config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                ended.store(true, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| Error::Capability(e.to_string()))?;

    stream.play().map_err(|e| Error::Capability(e.to_string()))?;
    Ok(stream)
}

/// Live capture from [`DeviceMicrophone`]
struct DeviceInputStream {
    buffer: Arc<Mutex<Vec<f32>>>,
    ended: Arc<AtomicBool>,
    release: Option<std::sync::mpsc::Sender<()>>,
    ticker: Interval,
}

impl DeviceInputStream {
    fn take_buffer(&self) -> Vec<f32> {
        let mut buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buf)
    }
}

#[async_trait]
impl InputStream for DeviceInputStream {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            if self.release.is_none() {
                return None;
            }
            self.ticker.tick().await;

            let samples = self.take_buffer();
            if !samples.is_empty() {
                return Some(Bytes::from(samples_to_pcm16(&samples)));
            }
            if self.ended.load(Ordering::SeqCst) {
                return None;
            }
        }
    }

    fn release(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for DeviceInputStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Convert f32 samples to little-endian 16-bit PCM bytes
#[must_use]
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            sample_i16.to_le_bytes()
        })
        .collect()
}

/// Wrap little-endian 16-bit PCM bytes in a mono WAV container for STT APIs
///
/// A trailing odd byte is ignored.
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
