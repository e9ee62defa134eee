//! Microphone capture using cpal, plus an energy-based endpointer that turns
//! the live stream into one recorded utterance.
//!
//! [`AudioCapture`] delivers 16 kHz mono i16 samples whatever the device's
//! native format, rate, and channel count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use palaver_core::wav::{SAMPLE_RATE, compute_rms, write_wav};

use crate::error::CaptureError;

/// Chunk size returned by `read_chunk()`: 100 ms at 16 kHz mono.
pub const CHUNK_SAMPLES: usize = 1_600;
const CHUNK_MS: u64 = (CHUNK_SAMPLES as u64 * 1000) / SAMPLE_RATE as u64;

const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct AudioCapture {
    rx: mpsc::UnboundedReceiver<Vec<i16>>,
    buf: Vec<i16>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioCapture {
    /// Open the default input device and start capturing.
    pub fn new() -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

        let supported = device
            .default_input_config()
            .map_err(|e| CaptureError::Config(e.to_string()))?;

        let native_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        let (tx, rx) = mpsc::unbounded_channel::<Vec<i16>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        // cpal Stream is !Send on macOS, so it lives on its own thread.
        let thread = std::thread::Builder::new()
            .name("palaver-capture".into())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::I16 => {
                        let stop = stop_flag.clone();
                        device.build_input_stream(
                            &config,
                            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                                if stop.load(Ordering::Relaxed) {
                                    return;
                                }
                                let mono = mix_to_mono(data, channels);
                                let _ = tx.send(resample_linear(&mono, native_rate, SAMPLE_RATE));
                            },
                            |err| error!("capture: stream error: {err}"),
                            None,
                        )
                    }
                    SampleFormat::F32 => {
                        let stop = stop_flag.clone();
                        device.build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                if stop.load(Ordering::Relaxed) {
                                    return;
                                }
                                let pcm: Vec<i16> = data
                                    .iter()
                                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                                    .collect();
                                let mono = mix_to_mono(&pcm, channels);
                                let _ = tx.send(resample_linear(&mono, native_rate, SAMPLE_RATE));
                            },
                            |err| error!("capture: stream error: {err}"),
                            None,
                        )
                    }
                    other => {
                        error!("capture: unsupported sample format {other:?}");
                        return;
                    }
                };

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        error!("capture: failed to build stream: {e}");
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    error!("capture: failed to start stream: {e}");
                    return;
                }
                debug!("capture: {native_rate} Hz, {channels} ch");

                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::park();
                }
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        Ok(AudioCapture {
            rx,
            buf: Vec::new(),
            stop,
            thread: Some(thread),
        })
    }

    /// Read exactly [`CHUNK_SAMPLES`] samples.
    pub async fn read_chunk(&mut self) -> Result<Vec<i16>, CaptureError> {
        while self.buf.len() < CHUNK_SAMPLES {
            match self.rx.recv().await {
                Some(samples) => self.buf.extend_from_slice(&samples),
                None => return Err(CaptureError::Ended),
            }
        }
        Ok(self.buf.drain(..CHUNK_SAMPLES).collect())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

// ─── Endpointing ──────────────────────────────────────────────────────────

/// Timing and level thresholds for one recorded utterance.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub silence_threshold: f32,
    /// Speech shorter than this is treated as a click, not an utterance.
    pub min_speech_ms: u64,
    /// Trailing silence that ends the utterance.
    pub silence_ms: u64,
    pub max_capture_ms: u64,
    pub no_speech_timeout_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.004,
            min_speech_ms: 180,
            silence_ms: 700,
            max_capture_ms: 12_000,
            no_speech_timeout_ms: 7_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadStep {
    /// No speech yet; discard the chunk.
    Waiting,
    /// Inside an utterance; keep the chunk.
    Recording,
    /// Utterance ended; keep the chunk and stop.
    Done,
    /// Gave up waiting for speech.
    NoSpeech,
}

/// Chunk-driven endpointer. Time is counted in audio, not wall clock.
#[derive(Debug)]
pub struct Endpointer {
    config: VadConfig,
    elapsed_ms: u64,
    speech_ms: Option<u64>,
    silence_ms: u64,
}

impl Endpointer {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            elapsed_ms: 0,
            speech_ms: None,
            silence_ms: 0,
        }
    }

    pub fn push(&mut self, rms: f32, chunk_ms: u64) -> VadStep {
        self.elapsed_ms += chunk_ms;
        let loud = rms > self.config.silence_threshold;

        let Some(speech_ms) = self.speech_ms.as_mut() else {
            if loud {
                self.speech_ms = Some(chunk_ms);
                return VadStep::Recording;
            }
            if self.elapsed_ms >= self.config.no_speech_timeout_ms {
                return VadStep::NoSpeech;
            }
            return VadStep::Waiting;
        };

        *speech_ms += chunk_ms;
        if loud {
            self.silence_ms = 0;
        } else if *speech_ms >= self.config.min_speech_ms {
            self.silence_ms += chunk_ms;
            if self.silence_ms >= self.config.silence_ms {
                return VadStep::Done;
            }
        }

        if self.elapsed_ms >= self.config.max_capture_ms {
            return VadStep::Done;
        }
        VadStep::Recording
    }
}

/// Record one utterance from the default microphone and return it as WAV.
/// `None` means nobody spoke before the no-speech timeout.
pub async fn record_utterance(
    config: VadConfig,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>, CaptureError> {
    let mut capture = AudioCapture::new()?;
    let mut endpointer = Endpointer::new(config);
    let mut recorded: Vec<i16> = Vec::new();

    loop {
        let samples = tokio::select! {
            _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
            read = tokio::time::timeout(READ_TIMEOUT, capture.read_chunk()) => match read {
                Ok(Ok(samples)) => samples,
                Ok(Err(e)) if recorded.is_empty() => return Err(e),
                Ok(Err(_)) => break,
                Err(_) => return Err(CaptureError::Timeout),
            },
        };

        match endpointer.push(compute_rms(&samples), CHUNK_MS) {
            VadStep::Waiting => {}
            VadStep::Recording => recorded.extend_from_slice(&samples),
            VadStep::Done => {
                recorded.extend_from_slice(&samples);
                break;
            }
            VadStep::NoSpeech => return Ok(None),
        }
    }
    drop(capture);

    if recorded.is_empty() {
        return Ok(None);
    }
    debug!(
        "capture: recorded {} ms",
        recorded.len() as u64 * 1000 / SAMPLE_RATE as u64
    );
    Ok(Some(write_wav(&recorded, SAMPLE_RATE)))
}

// ─── Sample helpers ───────────────────────────────────────────────────────

/// Mix multi-channel audio to mono by averaging channels.
fn mix_to_mono(input: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return input.to_vec();
    }
    let ch = channels as usize;
    input
        .chunks_exact(ch)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech.
fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (input.len() as f64 / ratio) as usize;
    (0..output_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let s0 = input[idx] as f64;
            let s1 = input.get(idx + 1).map_or(s0, |&s| s as f64);
            (s0 + frac * (s1 - s0)) as i16
        })
        .collect()
}
