//! PCM byte decoding
//!
//! Clients send interleaved little-endian samples in the negotiated width.
//! Frames from the transport do not have to line up with sample boundaries,
//! so the decoder carries an incomplete trailing sample over to the next call.

use crate::domain::audio::SampleFormat;

const I8_SCALE: f32 = 128.0;
const I16_SCALE: f32 = 32768.0;
const I24_SCALE: f32 = 8_388_608.0;

/// Incremental decoder from raw PCM bytes to normalized `f32` samples
#[derive(Debug, Clone)]
pub struct PcmDecoder {
    format: SampleFormat,
    pending: Vec<u8>,
}

impl PcmDecoder {
    pub fn new(format: SampleFormat) -> Self {
        Self {
            format,
            pending: Vec::with_capacity(4),
        }
    }

    /// Bytes held back because they do not form a whole sample yet
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Decode `bytes`, appending whole samples to `out`
    ///
    /// Returns the number of samples appended.
    pub fn decode(&mut self, bytes: &[u8], out: &mut Vec<f32>) -> usize {
        let width = self.format.width() as usize;
        let before = out.len();
        let mut input = bytes;

        if !self.pending.is_empty() {
            let needed = width - self.pending.len();
            if input.len() < needed {
                self.pending.extend_from_slice(input);
                return 0;
            }
            self.pending.extend_from_slice(&input[..needed]);
            input = &input[needed..];
            out.push(decode_sample(self.format, &self.pending));
            self.pending.clear();
        }

        let whole = input.len() / width * width;
        out.reserve(whole / width);
        for chunk in input[..whole].chunks_exact(width) {
            out.push(decode_sample(self.format, chunk));
        }
        self.pending.extend_from_slice(&input[whole..]);

        out.len() - before
    }

    /// Drop any partial sample
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[inline]
fn decode_sample(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::I8 => bytes[0] as i8 as f32 / I8_SCALE,
        SampleFormat::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / I16_SCALE,
        SampleFormat::I24 => {
            // Sign-extend from bit 23
            let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            raw as f32 / I24_SCALE
        }
        SampleFormat::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}
