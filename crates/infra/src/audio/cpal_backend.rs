//! CPAL-based output device enumeration
//!
//! Device indices are positions in the host's full device enumeration. Only
//! devices that can play audio are listed, so the listed indices may have
//! gaps, and `open_output` resolves an index against the same enumeration.

use crate::audio::stream::CpalSink;
use audiorelay_core::domain::audio::{
    AudioConfig, AudioError, AudioOutput, AudioSink, OutputDevice, Result,
};
use audiorelay_core::domain::config::AudioSettings;
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info, instrument};

/// Audio output backed by the platform's default CPAL host
///
/// The host is looked up on every call, so devices plugged in while the
/// server runs show up in the next enumeration.
#[derive(Debug, Clone)]
pub struct CpalOutput {
    queue_buffers: usize,
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new(AudioSettings::default().sink_queue_buffers)
    }
}

impl CpalOutput {
    /// `queue_buffers` bounds each sink's queue, in device buffers
    pub fn new(queue_buffers: usize) -> Self {
        Self {
            queue_buffers: queue_buffers.max(1),
        }
    }

    pub fn queue_buffers(&self) -> usize {
        self.queue_buffers
    }

    fn host() -> cpal::Host {
        let host = cpal::default_host();
        debug!(host = ?host.id(), "Using audio host");
        host
    }
}

pub(crate) fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|description| description.name().to_string())
        .unwrap_or_else(|_| "Unknown Device".to_string())
}

/// Whether the device can play audio
pub(crate) fn has_output(device: &cpal::Device) -> bool {
    output_capable(
        device
            .supported_output_configs()
            .map(|mut configs| configs.any(|config| config.channels() > 0)),
    )
}

/// Interpret an output configuration query
///
/// A device that is open elsewhere may refuse the query (ALSA reports it as
/// busy). It is still listed; opening it is what reports the conflict.
fn output_capable(probe: std::result::Result<bool, cpal::SupportedStreamConfigsError>) -> bool {
    match probe {
        Ok(has_channels) => has_channels,
        Err(cpal::SupportedStreamConfigsError::DeviceNotAvailable) => false,
        Err(e) => {
            debug!(error = %e, "Output configurations unavailable, assuming output device");
            true
        }
    }
}

impl AudioOutput for CpalOutput {
    #[instrument(skip(self))]
    fn list_output_devices(&self) -> Result<Vec<OutputDevice>> {
        let devices = Self::host()
            .devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?;

        let mut outputs = Vec::new();
        for (index, device) in devices.enumerate() {
            if !has_output(&device) {
                continue;
            }
            let name = device_name(&device);
            debug!(index, name = %name, "Found output device");
            outputs.push(OutputDevice {
                index: index as u32,
                name,
            });
        }

        info!(count = outputs.len(), "Enumerated output devices");
        Ok(outputs)
    }

    #[instrument(skip(self, config), fields(rate_hz = config.sample_rate_hz, channels = config.channels))]
    fn open_output(&self, config: &AudioConfig, device_index: u32) -> Result<Box<dyn AudioSink>> {
        let device = Self::host()
            .devices()
            .map_err(|e| AudioError::OsError(e.to_string()))?
            .nth(device_index as usize)
            .ok_or_else(|| {
                AudioError::DeviceNotFound(format!("no output device at index {}", device_index))
            })?;

        if !has_output(&device) {
            return Err(AudioError::UnsupportedConfiguration(format!(
                "device {} ({}) has no outputs",
                device_index,
                device_name(&device)
            )));
        }

        let sink = CpalSink::open(device, config, self.queue_buffers)?;
        Ok(Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_depth_is_at_least_one() {
        assert_eq!(CpalOutput::new(0).queue_buffers(), 1);
        assert_eq!(CpalOutput::new(4).queue_buffers(), 4);
        assert_eq!(
            CpalOutput::default().queue_buffers(),
            AudioSettings::default().sink_queue_buffers
        );
    }

    #[test]
    fn test_busy_device_still_counts_as_output() {
        assert!(output_capable(Ok(true)));
        assert!(!output_capable(Ok(false)));
        assert!(!output_capable(Err(
            cpal::SupportedStreamConfigsError::DeviceNotAvailable
        )));
        assert!(output_capable(Err(
            cpal::SupportedStreamConfigsError::BackendSpecific {
                err: cpal::BackendSpecificError {
                    description: "Device or resource busy".to_string(),
                },
            }
        )));
    }

    #[test]
    fn test_enumerate_output_devices() {
        let output = CpalOutput::default();
        match output.list_output_devices() {
            Ok(devices) => {
                for pair in devices.windows(2) {
                    assert!(pair[0].index < pair[1].index);
                }
                for device in &devices {
                    assert!(!device.name.is_empty());
                }
            }
            Err(e) => {
                // On CI or headless systems, there might not be audio devices
                eprintln!("Skipping test: {}", e);
            }
        }
    }

    #[test]
    fn test_open_out_of_range_index() {
        let output = CpalOutput::default();
        let config = AudioConfig::new(48000, 2, 2, 256).unwrap();
        match output.open_output(&config, u32::MAX) {
            Err(AudioError::DeviceNotFound(_)) => {}
            Err(AudioError::OsError(e)) => eprintln!("Skipping test: {}", e),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("opened a device at index u32::MAX"),
        }
    }
}
