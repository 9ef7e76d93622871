//! Loudness metering for live visual feedback.

use crate::audio::AudioFrame;

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Minimum dB floor to avoid -infinity for silence.
pub const DB_FLOOR: f32 = -60.0;

/// Most recent loudness of the capture (or output) path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeSample {
    /// RMS amplitude normalized to [0, 1].
    pub level: f32,
    pub at: Instant,
}

impl VolumeSample {
    pub fn silent() -> Self {
        Self {
            level: 0.0,
            at: Instant::now(),
        }
    }

    pub fn to_db(&self) -> f32 {
        linear_to_db(self.level)
    }
}

/// Convert linear amplitude to decibels, with floor.
pub fn linear_to_db(linear: f32) -> f32 {
    if linear <= 0.0 {
        DB_FLOOR
    } else {
        (20.0 * linear.log10()).max(DB_FLOOR)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VolumeMeter;

impl VolumeMeter {
    /// RMS of the frame relative to the PCM16 full scale (32768).
    pub fn measure(frame: &AudioFrame) -> VolumeSample {
        VolumeSample {
            level: rms_level(frame.samples()),
            at: Instant::now(),
        }
    }
}

fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    if rms.is_finite() { rms.clamp(0.0, 1.0) } else { 0.0 }
}

/// Single-slot publisher: every write replaces the previous value and never
/// waits for readers.
#[derive(Clone, Debug)]
pub struct VolumeFeed {
    tx: Arc<watch::Sender<VolumeSample>>,
}

impl Default for VolumeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(VolumeSample::silent());
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, sample: VolumeSample) {
        self.tx.send_replace(sample);
    }

    pub fn measure_and_publish(&self, frame: &AudioFrame) -> VolumeSample {
        let sample = VolumeMeter::measure(frame);
        self.publish(sample);
        sample
    }

    pub fn subscribe(&self) -> watch::Receiver<VolumeSample> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> VolumeSample {
        *self.tx.borrow()
    }
}
