use crate::audio::ResampleQuality;
use crate::error::EncodeError;

#[cfg(feature = "hq-resample")]
use rubato::Resampler as _;

/// Streaming linear-interpolation resampler over mono f32 samples.
///
/// The tail of each input block that cannot be interpolated yet is carried
/// into the next call, so block boundaries never drop or repeat samples.
#[derive(Debug)]
pub struct LinearResampler {
    in_rate_hz: u32,
    out_rate_hz: u32,
    step: f64,
    pos: f64,
    buf: Vec<f32>,
}

impl LinearResampler {
    pub fn new(in_rate_hz: u32, out_rate_hz: u32) -> Self {
        Self {
            in_rate_hz,
            out_rate_hz,
            step: in_rate_hz as f64 / out_rate_hz.max(1) as f64,
            pos: 0.0,
            buf: Vec::new(),
        }
    }

    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        if input.is_empty() {
            return;
        }

        self.buf.extend_from_slice(input);

        let approx_out_len = ((input.len() as u64 * self.out_rate_hz as u64)
            / self.in_rate_hz.max(1) as u64)
            .saturating_add(2) as usize;
        out.reserve(approx_out_len);

        while self.pos + 1.0 < self.buf.len() as f64 {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            let a = self.buf[i];
            let b = self.buf[i + 1];
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        let drain = (self.pos.floor() as usize).min(self.buf.len());
        if drain > 0 {
            self.buf.drain(0..drain);
            self.pos -= drain as f64;
        }
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.buf.clear();
    }
}

#[cfg(feature = "hq-resample")]
pub struct HqResampler {
    resampler: rubato::FftFixedInOut<f32>,
    pending: Vec<f32>,
}

#[cfg(feature = "hq-resample")]
impl HqResampler {
    const CHUNK_SIZE: usize = 1024;

    pub fn new(in_rate_hz: u32, out_rate_hz: u32) -> Result<Self, EncodeError> {
        let resampler = rubato::FftFixedInOut::<f32>::new(
            in_rate_hz as usize,
            out_rate_hz as usize,
            Self::CHUNK_SIZE,
            1,
        )
        .map_err(|e| EncodeError::Resample(e.to_string()))?;

        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), EncodeError> {
        out.clear();
        if input.is_empty() {
            return Ok(());
        }

        self.pending.extend_from_slice(input);
        let chunk_size = self.resampler.input_frames_next();
        if chunk_size == 0 {
            return Ok(());
        }

        while self.pending.len() >= chunk_size {
            let resampled = self
                .resampler
                .process(&[&self.pending[..chunk_size]], None)
                .map_err(|e| EncodeError::Resample(e.to_string()))?;
            if let Some(channel) = resampled.first() {
                out.extend_from_slice(channel);
            }
            self.pending.drain(..chunk_size);
        }

        Ok(())
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
    }
}

/// Resampler chosen at runtime from [`ResampleQuality`].
pub enum DynResampler {
    Linear(LinearResampler),
    #[cfg(feature = "hq-resample")]
    High(HqResampler),
}

impl DynResampler {
    /// Returns `None` when the rates already match.
    pub fn new(
        in_rate_hz: u32,
        out_rate_hz: u32,
        quality: ResampleQuality,
    ) -> Result<Option<Self>, EncodeError> {
        if in_rate_hz == out_rate_hz {
            return Ok(None);
        }

        match quality {
            ResampleQuality::Linear => Ok(Some(Self::Linear(LinearResampler::new(
                in_rate_hz,
                out_rate_hz,
            )))),
            ResampleQuality::High => {
                #[cfg(feature = "hq-resample")]
                {
                    Ok(Some(Self::High(HqResampler::new(in_rate_hz, out_rate_hz)?)))
                }
                #[cfg(not(feature = "hq-resample"))]
                {
                    Err(EncodeError::Resample(
                        "hq-resample feature is not enabled".to_string(),
                    ))
                }
            }
        }
    }

    pub fn process_into(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<(), EncodeError> {
        match self {
            DynResampler::Linear(resampler) => {
                resampler.process_into(input, out);
                Ok(())
            }
            #[cfg(feature = "hq-resample")]
            DynResampler::High(resampler) => resampler.process_into(input, out),
        }
    }

    pub fn reset(&mut self) {
        match self {
            DynResampler::Linear(resampler) => resampler.reset(),
            #[cfg(feature = "hq-resample")]
            DynResampler::High(resampler) => resampler.reset(),
        }
    }
}
