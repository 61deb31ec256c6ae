//! Audio output abstractions and domain models
//!
//! This module defines the negotiated stream format and the two capability
//! traits the session talks to: [`AudioOutput`] to list and open playback
//! devices, and [`AudioSink`] to push PCM bytes into an open device.
//! Implementations for real hardware live in the `infra` crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the audio subsystem
#[derive(Debug, Error)]
pub enum AudioError {
    /// Requested audio device was not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Error in audio stream creation or processing
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Invalid configuration for audio device
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Input/Output error at the OS level
    #[error("OS error: {0}")]
    OsError(String),

    /// Device does not support the requested configuration
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The sink was already released
    #[error("Sink closed")]
    SinkClosed,
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// PCM sample encodings a client may stream
///
/// The wire carries a sample width in bytes; the mapping to an encoding is
/// fixed: 1 → Int8, 2 → Int16, 3 → Int24, 4 → Float32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    I8,
    I16,
    I24,
    F32,
}

impl SampleFormat {
    pub const SUPPORTED_WIDTHS: [u8; 4] = [1, 2, 3, 4];

    pub fn from_width(width_bytes: u8) -> Option<Self> {
        match width_bytes {
            1 => Some(SampleFormat::I8),
            2 => Some(SampleFormat::I16),
            3 => Some(SampleFormat::I24),
            4 => Some(SampleFormat::F32),
            _ => None,
        }
    }

    /// Bytes per sample
    pub fn width(&self) -> u8 {
        match self {
            SampleFormat::I8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I24 => 3,
            SampleFormat::F32 => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::I8 => "int8",
            SampleFormat::I16 => "int16",
            SampleFormat::I24 => "int24",
            SampleFormat::F32 => "float32",
        };
        f.write_str(name)
    }
}

/// Stream parameters negotiated with a client
///
/// Immutable once a session accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// Buffer size hint for the device; 0 lets the backend choose.
    pub frames_per_buffer: u32,
}

impl AudioConfig {
    pub fn new(
        sample_rate_hz: u32,
        channels: u16,
        sample_width_bytes: u8,
        frames_per_buffer: u32,
    ) -> Result<Self> {
        let format = SampleFormat::from_width(sample_width_bytes).ok_or_else(|| {
            AudioError::InvalidConfiguration(format!(
                "unsupported sample width: {} bytes",
                sample_width_bytes
            ))
        })?;

        if sample_rate_hz == 0 {
            return Err(AudioError::InvalidConfiguration(
                "sample rate must be greater than zero".to_string(),
            ));
        }

        if channels == 0 {
            return Err(AudioError::InvalidConfiguration(
                "channel count must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            sample_rate_hz,
            channels,
            format,
            frames_per_buffer,
        })
    }

    pub fn sample_width_bytes(&self) -> u8 {
        self.format.width()
    }

    /// Size of one interleaved frame (one sample per channel) in bytes
    pub fn bytes_per_frame(&self) -> usize {
        self.format.width() as usize * self.channels as usize
    }
}

/// A playback device as reported by one enumeration
///
/// `index` addresses the device in the backend's enumeration order and is
/// only meaningful until the next enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDevice {
    pub index: u32,
    pub name: String,
}

/// Capability interface for playback hardware
///
/// Both operations may block on the audio backend, so callers on an async
/// runtime run them on the blocking pool.
pub trait AudioOutput: Send + Sync {
    /// List the devices that can play audio, in enumeration order
    fn list_output_devices(&self) -> Result<Vec<OutputDevice>>;

    /// Open the device at `device_index` for playback in the given format
    fn open_output(&self, config: &AudioConfig, device_index: u32) -> Result<Box<dyn AudioSink>>;
}

/// An open playback stream accepting raw PCM bytes
#[async_trait]
pub trait AudioSink: Send {
    /// Queue bytes for playback, suspending until the sink has room for them
    ///
    /// Bytes are played in the order they are written.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Stop the active transfer
    fn stop(&mut self) -> Result<()>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_width_table() {
        assert_eq!(SampleFormat::from_width(1), Some(SampleFormat::I8));
        assert_eq!(SampleFormat::from_width(2), Some(SampleFormat::I16));
        assert_eq!(SampleFormat::from_width(3), Some(SampleFormat::I24));
        assert_eq!(SampleFormat::from_width(4), Some(SampleFormat::F32));
        assert_eq!(SampleFormat::from_width(0), None);
        assert_eq!(SampleFormat::from_width(8), None);
    }

    #[test]
    fn test_width_roundtrips_through_table() {
        for width in SampleFormat::SUPPORTED_WIDTHS {
            let format = SampleFormat::from_width(width).unwrap();
            assert_eq!(format.width(), width);
        }
    }

    #[test]
    fn test_audio_config_rejects_bad_values() {
        assert!(AudioConfig::new(48000, 2, 5, 128).is_err());
        assert!(AudioConfig::new(0, 2, 2, 128).is_err());
        assert!(AudioConfig::new(48000, 0, 2, 128).is_err());
    }

    #[test]
    fn test_audio_config_frame_size() {
        let config = AudioConfig::new(44100, 2, 3, 256).unwrap();
        assert_eq!(config.format, SampleFormat::I24);
        assert_eq!(config.sample_width_bytes(), 3);
        assert_eq!(config.bytes_per_frame(), 6);
    }

    #[test]
    fn test_zero_buffer_hint_is_allowed() {
        let config = AudioConfig::new(48000, 1, 2, 0).unwrap();
        assert_eq!(config.frames_per_buffer, 0);
    }

    #[test]
    fn test_sample_format_display() {
        assert_eq!(SampleFormat::I24.to_string(), "int24");
        assert_eq!(SampleFormat::F32.to_string(), "float32");
    }
}
