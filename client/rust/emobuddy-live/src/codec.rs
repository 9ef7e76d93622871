//! PCM16 framing between captured audio and wire messages.

use crate::audio::resample::DynResampler;
use crate::audio::{AudioFrame, ResampleQuality, f32_to_pcm16, pcm16_le_bytes, pcm16_to_f32};
use crate::error::{DecodeError, EncodeError, FrameError};
use crate::protocol::WireMessage;

/// Converts captured frames to the protocol rate and packs them into
/// `AudioChunk` messages.
///
/// Output is emitted in whole protocol frames. A remainder shorter than one
/// frame is kept and prepended to the next call, so at most one frame of
/// audio is ever held back.
pub struct Encoder {
    capture_rate_hz: u32,
    protocol_rate_hz: u32,
    frame_samples: usize,
    resampler: Option<DynResampler>,
    scratch: Vec<f32>,
    resampled: Vec<f32>,
    pending: Vec<i16>,
}

impl Encoder {
    pub fn new(
        capture_rate_hz: u32,
        protocol_rate_hz: u32,
        frame_ms: u32,
        quality: ResampleQuality,
    ) -> Result<Self, EncodeError> {
        let resampler = DynResampler::new(capture_rate_hz, protocol_rate_hz, quality)?;
        let frame_samples = ((protocol_rate_hz as u64 * frame_ms as u64) / 1000).max(1) as usize;
        Ok(Self {
            capture_rate_hz,
            protocol_rate_hz,
            frame_samples,
            resampler,
            scratch: Vec::new(),
            resampled: Vec::new(),
            pending: Vec::with_capacity(frame_samples * 2),
        })
    }

    pub fn protocol_rate_hz(&self) -> u32 {
        self.protocol_rate_hz
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Samples waiting for the next call.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn encode(&mut self, frame: AudioFrame) -> Result<Option<WireMessage>, EncodeError> {
        if frame.sample_rate_hz() != self.capture_rate_hz {
            return Err(EncodeError::RateMismatch {
                expected: self.capture_rate_hz,
                got: frame.sample_rate_hz(),
            });
        }

        match self.resampler.as_mut() {
            Some(resampler) => {
                self.scratch.clear();
                self.scratch
                    .extend(frame.samples().iter().map(|&s| pcm16_to_f32(s)));
                resampler.process_into(&self.scratch, &mut self.resampled)?;
                self.pending
                    .extend(self.resampled.iter().map(|&s| f32_to_pcm16(s)));
            }
            None => self.pending.extend_from_slice(frame.samples()),
        }

        let whole = (self.pending.len() / self.frame_samples) * self.frame_samples;
        if whole == 0 {
            return Ok(None);
        }
        let bytes = pcm16_le_bytes(&self.pending[..whole]);
        self.pending.drain(..whole);
        Ok(Some(WireMessage::AudioChunk(bytes)))
    }

    /// Emits the held-back remainder, if any.
    pub fn finish(&mut self) -> Option<WireMessage> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = pcm16_le_bytes(&self.pending);
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        Some(WireMessage::AudioChunk(bytes))
    }
}

/// Turns inbound PCM16 payloads into frames at the negotiated output rate.
#[derive(Clone, Copy, Debug)]
pub struct Decoder {
    sample_rate_hz: u32,
}

impl Decoder {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self { sample_rate_hz }
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<AudioFrame, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() % 2 != 0 {
            return Err(DecodeError::Truncated { len: bytes.len() });
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        AudioFrame::new(samples, self.sample_rate_hz).map_err(|e| match e {
            FrameError::Empty => DecodeError::Empty,
            FrameError::ZeroRate => DecodeError::InvalidRate(self.sample_rate_hz),
        })
    }
}
