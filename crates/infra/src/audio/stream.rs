//! Real-time playback stream fed from a session
//!
//! A `cpal::Stream` is not `Send` on every platform, so each sink owns a
//! dedicated thread that builds the stream, plays it, and drops it on close.
//! Decoded samples reach the output callback through a bounded queue: writers
//! wait for room, and the callback never blocks, playing silence when the
//! queue runs dry. Errors reported by the stream wake any waiting writer, so
//! a device that disappears fails the next write instead of stalling it.

use audiorelay_core::domain::audio::{AudioConfig, AudioError, AudioSink, Result, SampleFormat};
use audiorelay_core::domain::pcm::PcmDecoder;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam::channel::{bounded, unbounded, Sender};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Interleaved `f32` samples in the negotiated channel layout
pub type AudioBuffer = Vec<f32>;

enum Control {
    Pause,
}

/// Samples pulled from the queue by the output callback
#[derive(Debug, Default)]
pub(crate) struct PlaybackBuffer {
    current: AudioBuffer,
    pos: usize,
}

impl PlaybackBuffer {
    /// Next queued sample, or silence if nothing is queued
    pub(crate) fn next_sample(&mut self, source: &mut mpsc::Receiver<AudioBuffer>) -> f32 {
        while self.pos >= self.current.len() {
            match source.try_recv() {
                Ok(next) => {
                    self.current = next;
                    self.pos = 0;
                }
                Err(_) => return 0.0,
            }
        }
        let sample = self.current[self.pos];
        self.pos += 1;
        sample
    }
}

fn stream_config(config: &AudioConfig) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: config.channels,
        sample_rate: config.sample_rate_hz,
        buffer_size: match config.frames_per_buffer {
            0 => cpal::BufferSize::Default,
            frames => cpal::BufferSize::Fixed(frames),
        },
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> AudioError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceNotFound("device is no longer available".to_string())
        }
        cpal::BuildStreamError::StreamConfigNotSupported => AudioError::UnsupportedConfiguration(
            "device does not support the requested rate, channels or buffer size".to_string(),
        ),
        other => AudioError::StreamError(format!("Failed to build stream: {}", other)),
    }
}

/// Build an output stream in the device's native sample type
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    samples: mpsc::Receiver<AudioBuffer>,
    failure: watch::Sender<Option<String>>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, samples, failure),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, samples, failure),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, samples, failure),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, samples, failure),
        other => Err(AudioError::UnsupportedConfiguration(format!(
            "Unsupported device sample format: {:?}",
            other
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut samples: mpsc::Receiver<AudioBuffer>,
    failure: watch::Sender<Option<String>>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let mut playback = PlaybackBuffer::default();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for slot in data.iter_mut() {
                    *slot = <T as cpal::Sample>::from_sample::<f32>(
                        playback.next_sample(&mut samples),
                    );
                }
            },
            move |err| {
                error!(error = %err, "Output stream error");
                failure.send_replace(Some(err.to_string()));
            },
            None,
        )
        .map_err(map_build_error)
}

/// Writer half of a playback queue
///
/// Decodes wire bytes and queues them in chunks of one device buffer. Chunks
/// of a write are queued in order, and a write waits while the queue is
/// full unless the stream reports a failure first.
pub(crate) struct SampleWriter {
    decoder: PcmDecoder,
    chunk_samples: usize,
    scratch: AudioBuffer,
    samples: Option<mpsc::Sender<AudioBuffer>>,
    failure: watch::Receiver<Option<String>>,
}

impl SampleWriter {
    /// `chunk_samples` of zero queues each write as a single chunk
    pub(crate) fn new(
        format: SampleFormat,
        chunk_samples: usize,
        samples: mpsc::Sender<AudioBuffer>,
        failure: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            decoder: PcmDecoder::new(format),
            chunk_samples,
            scratch: Vec::with_capacity(chunk_samples),
            samples: Some(samples),
            failure,
        }
    }

    fn stream_failure(&self) -> AudioError {
        match self.failure.borrow().as_deref() {
            Some(reason) => AudioError::StreamError(format!("output stream failed: {}", reason)),
            None => AudioError::StreamError("output stream has stopped".to_string()),
        }
    }

    pub(crate) async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.failure.borrow().is_some() {
            return Err(self.stream_failure());
        }
        let tx = self.samples.as_ref().ok_or(AudioError::SinkClosed)?;

        self.scratch.clear();
        self.decoder.decode(bytes, &mut self.scratch);
        if self.scratch.is_empty() {
            return Ok(());
        }

        let chunk_len = match self.chunk_samples {
            0 => self.scratch.len(),
            n => n,
        };
        for chunk in self.scratch.chunks(chunk_len) {
            let failed = tokio::select! {
                sent = tx.send(chunk.to_vec()) => {
                    sent.map_err(|_| AudioError::StreamError("output stream has stopped".to_string()))?;
                    false
                }
                _ = self.failure.changed() => true,
            };
            if failed {
                return Err(self.stream_failure());
            }
        }
        Ok(())
    }

    /// Forget any partial sample so the next write starts on a boundary
    pub(crate) fn reset(&mut self) {
        let pending = self.decoder.pending_bytes();
        if pending > 0 {
            debug!(pending, "Discarding partial sample");
        }
        self.decoder.reset();
    }

    /// Stop accepting samples; the callback drains what is already queued
    pub(crate) fn close(&mut self) {
        self.samples.take();
    }
}

/// An open CPAL output stream accepting raw PCM bytes
pub struct CpalSink {
    writer: SampleWriter,
    control: Option<Sender<Control>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Start playback on `device` in the negotiated format
    ///
    /// Returns once the stream is playing, or with the error that kept it
    /// from starting.
    pub fn open(device: cpal::Device, config: &AudioConfig, queue_buffers: usize) -> Result<Self> {
        let name = crate::audio::cpal_backend::device_name(&device);
        let sample_format = device
            .default_output_config()
            .map_err(|e| AudioError::InvalidConfiguration(e.to_string()))?
            .sample_format();
        let cpal_config = stream_config(config);

        info!(
            device = %name,
            rate_hz = config.sample_rate_hz,
            channels = config.channels,
            wire_format = %config.format,
            device_format = ?sample_format,
            "Creating output stream"
        );

        let (samples_tx, samples_rx) = mpsc::channel::<AudioBuffer>(queue_buffers.max(1));
        let (failure_tx, failure_rx) = watch::channel::<Option<String>>(None);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (control_tx, control_rx) = unbounded::<Control>();

        let worker = std::thread::Builder::new()
            .name("audiorelay-output".to_string())
            .spawn(move || {
                let stream = match build_output_stream(
                    &device,
                    &cpal_config,
                    sample_format,
                    samples_rx,
                    failure_tx,
                )
                .and_then(|stream| {
                    stream.play().map_err(|e| {
                        AudioError::StreamError(format!("Failed to start stream: {}", e))
                    })?;
                    Ok(stream)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                for command in control_rx.iter() {
                    match command {
                        Control::Pause => {
                            if let Err(e) = stream.pause() {
                                warn!(error = %e, "Failed to pause output stream");
                            }
                        }
                    }
                }

                drop(stream);
                debug!("Output stream dropped");
            })
            .map_err(|e| AudioError::OsError(format!("Failed to spawn output thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(AudioError::StreamError(
                    "output thread exited during startup".to_string(),
                ));
            }
        }

        let chunk_samples = config.frames_per_buffer as usize * config.channels as usize;
        Ok(Self {
            writer: SampleWriter::new(config.format, chunk_samples, samples_tx, failure_rx),
            control: Some(control_tx),
            worker: Some(worker),
        })
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write(bytes).await
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(control) = &self.control {
            let _ = control.send(Control::Pause);
        }
        self.writer.reset();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer.close();
        self.control.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| AudioError::StreamError("output thread panicked".to_string()))?;
            debug!("Output device released");
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to release output device");
        }
    }
}
