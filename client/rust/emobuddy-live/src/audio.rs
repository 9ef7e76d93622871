use crate::error::FrameError;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::time::Duration;

pub mod capture;
pub mod level;
pub mod playback;
pub mod resample;

/// Mono PCM16 audio.
///
/// A frame is handed from one pipeline stage to the next by value; it is not
/// `Clone`, so nothing keeps reading a frame after passing it on.
#[derive(Debug, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate_hz: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate_hz: u32) -> Result<Self, FrameError> {
        if samples.is_empty() {
            return Err(FrameError::Empty);
        }
        if sample_rate_hz == 0 {
            return Err(FrameError::ZeroRate);
        }
        Ok(Self {
            samples,
            sample_rate_hz,
        })
    }

    /// Builds a frame from normalized f32 samples, clamping to [-1, 1].
    pub fn from_f32(samples: &[f32], sample_rate_hz: u32) -> Result<Self, FrameError> {
        Self::new(samples.iter().map(|&s| f32_to_pcm16(s)).collect(), sample_rate_hz)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate_hz)
    }

    pub fn to_le_bytes(&self) -> Bytes {
        pcm16_le_bytes(&self.samples)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResampleQuality {
    #[default]
    Linear,
    High,
}

pub fn samples_to_duration(samples: usize, sample_rate_hz: u32) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((samples as u64).saturating_mul(1_000_000_000) / sample_rate_hz as u64)
}

pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn f32_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn pcm16_le_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

pub(crate) fn downmix_f32_to_mono_into(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    if channels <= 1 {
        out.extend_from_slice(data);
        return;
    }

    let frames = data.len() / channels;
    out.reserve(frames);
    for frame in data.chunks_exact(channels) {
        out.push(frame.iter().sum::<f32>() / channels as f32);
    }
}
