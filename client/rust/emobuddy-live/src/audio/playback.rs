//! Gapless playback of decoded audio.
//!
//! [`PlaybackScheduler`] assigns each frame a start time of
//! `max(now, end of the previous entry)` and hands it to the output device
//! shortly before that time. Nothing is ever dropped to catch up: a slow
//! network grows latency instead of producing glitches.
//!
//! The output device is opened on first use (or explicitly through
//! [`PlaybackScheduler::ensure_output`]) and released by
//! [`PlaybackScheduler::shutdown`].

use crate::audio::{AudioFrame, samples_to_duration};
use crate::codec::Decoder;
use crate::config::PlaybackConfig;
use crate::error::PlaybackError;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A sink for mono PCM16 audio at the rate it was opened with.
pub trait OutputDevice: Send {
    fn write(&mut self, frame: AudioFrame) -> Result<(), PlaybackError>;

    /// Discards audio handed over but not yet played.
    fn clear(&mut self);
}

pub trait OutputBackend: Send + Sync + 'static {
    fn open(&self, sample_rate_hz: u32) -> Result<Box<dyn OutputDevice>, PlaybackError>;
}

#[derive(Debug)]
pub struct PlaybackQueueEntry {
    frame: AudioFrame,
    start: Instant,
    end: Instant,
}

impl PlaybackQueueEntry {
    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn end(&self) -> Instant {
        self.end
    }

    pub fn frame(&self) -> &AudioFrame {
        &self.frame
    }
}

/// `[start, end)` of a scheduled entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledSpan {
    pub start: Instant,
    pub end: Instant,
}

impl ScheduledSpan {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &ScheduledSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

pub struct PlaybackScheduler {
    backend: Arc<dyn OutputBackend>,
    sample_rate_hz: u32,
    lookahead: Duration,
    drain_timeout: Duration,
    output: Option<Box<dyn OutputDevice>>,
    queue: VecDeque<PlaybackQueueEntry>,
    timeline_end: Option<Instant>,
    accepting: bool,
}

impl PlaybackScheduler {
    pub fn new(
        backend: Arc<dyn OutputBackend>,
        sample_rate_hz: u32,
        config: &PlaybackConfig,
    ) -> Self {
        Self {
            backend,
            sample_rate_hz,
            lookahead: config.lookahead(),
            drain_timeout: config.drain_timeout(),
            output: None,
            queue: VecDeque::new(),
            timeline_end: None,
            accepting: true,
        }
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    /// Opens the output device unless it is already open.
    pub fn ensure_output(&mut self) -> Result<(), PlaybackError> {
        if self.output.is_none() {
            let output = self.backend.open(self.sample_rate_hz)?;
            info!(sample_rate_hz = self.sample_rate_hz, "output device opened");
            self.output = Some(output);
        }
        Ok(())
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn schedule(&mut self, frame: AudioFrame) -> Result<ScheduledSpan, PlaybackError> {
        self.schedule_at(frame, Instant::now())
    }

    pub fn schedule_at(
        &mut self,
        frame: AudioFrame,
        now: Instant,
    ) -> Result<ScheduledSpan, PlaybackError> {
        if !self.accepting {
            return Err(PlaybackError::Closed);
        }
        if frame.sample_rate_hz() != self.sample_rate_hz {
            return Err(PlaybackError::InvalidBuffer(format!(
                "frame rate {} Hz does not match output rate {} Hz",
                frame.sample_rate_hz(),
                self.sample_rate_hz
            )));
        }

        let start = match self.timeline_end {
            Some(end) if end > now => end,
            _ => now,
        };
        let end = start + frame.duration();
        self.timeline_end = Some(end);
        self.queue.push_back(PlaybackQueueEntry { frame, start, end });
        Ok(ScheduledSpan { start, end })
    }

    /// When the front entry should be handed to the device.
    pub fn next_due(&self) -> Option<Instant> {
        self.queue
            .front()
            .map(|entry| entry.start.checked_sub(self.lookahead).unwrap_or(entry.start))
    }

    /// Hands every entry starting within the lookahead window to the device.
    pub fn render_due(&mut self, now: Instant) -> Result<usize, PlaybackError> {
        let horizon = now + self.lookahead;
        let mut rendered = 0;
        while self.queue.front().is_some_and(|entry| entry.start <= horizon) {
            self.ensure_output()?;
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            if let Some(output) = self.output.as_mut() {
                output.write(entry.frame)?;
            }
            rendered += 1;
        }
        Ok(rendered)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PlaybackQueueEntry> {
        self.queue.iter()
    }

    pub fn timeline_end(&self) -> Option<Instant> {
        self.timeline_end
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Drops everything scheduled but not yet played and reopens intake.
    pub fn reset(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.timeline_end = None;
        self.accepting = true;
        if let Some(output) = self.output.as_mut() {
            output.clear();
        }
        if dropped > 0 {
            debug!(dropped, "playback queue reset");
        }
    }

    /// Refuses further frames; already scheduled entries are kept.
    pub fn close_intake(&mut self) {
        self.accepting = false;
    }

    /// Plays out what is already scheduled, then returns. Gives up after the
    /// configured drain timeout and discards the rest.
    pub async fn drain(&mut self) -> Result<(), PlaybackError> {
        self.accepting = false;
        let deadline = Instant::now() + self.drain_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                if !self.queue.is_empty() {
                    warn!(discarded = self.queue.len(), "playback drain timed out");
                    self.queue.clear();
                }
                break;
            }

            self.render_due(now)?;

            let wake = match (self.next_due(), self.timeline_end) {
                (Some(due), _) => due,
                (None, Some(end)) if end > now => end,
                _ => break,
            };
            tokio::time::sleep_until(wake.min(deadline)).await;
        }
        Ok(())
    }

    /// Clears the queue and releases the output device.
    pub fn shutdown(&mut self) {
        self.queue.clear();
        self.timeline_end = None;
        self.accepting = false;
        if self.output.take().is_some() {
            info!("output device released");
        }
    }
}

const PLAY_CHUNK_MS: u64 = 100;
/// How far ahead of its playback time a chunk is handed to the device.
const PLAY_AHEAD: Duration = Duration::from_millis(300);
/// Left for the device to empty its buffer before it is released.
const PLAY_TAIL: Duration = Duration::from_millis(200);

/// Plays a single PCM16 buffer once and waits until it has been played.
///
/// The buffer is written in short chunks paced against the clock, so its
/// length is not limited by how much the device can buffer.
pub async fn play_buffer(
    backend: &dyn OutputBackend,
    pcm16: &[u8],
    sample_rate_hz: u32,
) -> Result<Duration, PlaybackError> {
    let frame = Decoder::new(sample_rate_hz)
        .decode(pcm16)
        .map_err(|e| PlaybackError::InvalidBuffer(e.to_string()))?;
    let duration = frame.duration();
    let chunk_samples = ((sample_rate_hz as u64 * PLAY_CHUNK_MS) / 1000).max(1) as usize;

    let mut output = backend.open(sample_rate_hz)?;
    let start = Instant::now();
    let mut offset = 0;
    for chunk in frame.samples().chunks(chunk_samples) {
        let due = start + samples_to_duration(offset, sample_rate_hz);
        tokio::time::sleep_until(due.checked_sub(PLAY_AHEAD).unwrap_or(start)).await;

        let chunk_frame = AudioFrame::new(chunk.to_vec(), sample_rate_hz)
            .map_err(|e| PlaybackError::InvalidBuffer(e.to_string()))?;
        output.write(chunk_frame)?;
        offset += chunk.len();
    }
    tokio::time::sleep_until(start + duration + PLAY_TAIL).await;
    drop(output);

    debug!(?duration, sample_rate_hz, "buffer played");
    Ok(duration)
}

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalOutput;

#[cfg(feature = "cpal-backend")]
mod cpal_backend {
    use super::{OutputBackend, OutputDevice};
    use crate::audio::AudioFrame;
    use crate::audio::pcm16_to_f32;
    use crate::audio::resample::LinearResampler;
    use crate::error::PlaybackError;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use ringbuf::{HeapProd, HeapRb, traits::*};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::thread::{self, JoinHandle};
    use tracing::{debug, info, warn};

    /// Default output device through cpal, fed from a lock-free ring buffer.
    #[derive(Clone, Debug)]
    pub struct CpalOutput {
        max_buffer_ms: u32,
    }

    impl Default for CpalOutput {
        fn default() -> Self {
            Self {
                max_buffer_ms: 10_000,
            }
        }
    }

    impl CpalOutput {
        pub fn new(max_buffer_ms: u32) -> Self {
            Self {
                max_buffer_ms: max_buffer_ms.max(100),
            }
        }
    }

    struct Started {
        producer: HeapProd<f32>,
        device_rate_hz: u32,
    }

    impl OutputBackend for CpalOutput {
        fn open(&self, sample_rate_hz: u32) -> Result<Box<dyn OutputDevice>, PlaybackError> {
            let (ready_tx, ready_rx) =
                std_mpsc::sync_channel::<Result<Started, PlaybackError>>(1);
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let flush = Arc::new(AtomicBool::new(false));
            let failed = Arc::new(AtomicBool::new(false));
            let max_buffer_ms = self.max_buffer_ms;

            let flush_cb = flush.clone();
            let failed_cb = failed.clone();
            let thread = thread::Builder::new()
                .name("emobuddy-output".to_string())
                .spawn(move || {
                    let stream =
                        match start_stream(sample_rate_hz, max_buffer_ms, flush_cb, failed_cb) {
                            Ok((stream, started)) => {
                                let _ = ready_tx.send(Ok(started));
                                stream
                            }
                            Err(err) => {
                                let _ = ready_tx.send(Err(err));
                                return;
                            }
                        };
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("output stream stopped");
                })
                .map_err(|e| PlaybackError::Backend(e.to_string()))?;

            let started = match ready_rx.recv() {
                Ok(Ok(started)) => started,
                Ok(Err(err)) => {
                    let _ = thread.join();
                    return Err(err);
                }
                Err(_) => {
                    let _ = thread.join();
                    return Err(PlaybackError::Backend(
                        "output thread exited during startup".to_string(),
                    ));
                }
            };

            let resampler = (started.device_rate_hz != sample_rate_hz)
                .then(|| LinearResampler::new(sample_rate_hz, started.device_rate_hz));

            Ok(Box::new(CpalOutputDevice {
                producer: started.producer,
                resampler,
                scratch: Vec::new(),
                resampled: Vec::new(),
                flush,
                failed,
                stop: Some(stop_tx),
                thread: Some(thread),
            }))
        }
    }

    struct CpalOutputDevice {
        producer: HeapProd<f32>,
        resampler: Option<LinearResampler>,
        scratch: Vec<f32>,
        resampled: Vec<f32>,
        flush: Arc<AtomicBool>,
        failed: Arc<AtomicBool>,
        stop: Option<std_mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl OutputDevice for CpalOutputDevice {
        fn write(&mut self, frame: AudioFrame) -> Result<(), PlaybackError> {
            if self.failed.load(Ordering::Acquire) {
                return Err(PlaybackError::Backend("output stream failed".to_string()));
            }

            self.scratch.clear();
            self.scratch
                .extend(frame.samples().iter().map(|&s| pcm16_to_f32(s)));
            let samples = match self.resampler.as_mut() {
                Some(r) => {
                    r.process_into(&self.scratch, &mut self.resampled);
                    self.resampled.as_slice()
                }
                None => self.scratch.as_slice(),
            };

            let written = self.producer.push_slice(samples);
            if written < samples.len() {
                warn!(
                    dropped = samples.len() - written,
                    "output ring buffer full, samples dropped"
                );
            }
            Ok(())
        }

        fn clear(&mut self) {
            self.flush.store(true, Ordering::Release);
            if let Some(r) = self.resampler.as_mut() {
                r.reset();
            }
        }
    }

    impl Drop for CpalOutputDevice {
        fn drop(&mut self) {
            self.stop.take();
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    warn!("output thread panicked");
                }
            }
        }
    }

    fn start_stream(
        sample_rate_hz: u32,
        max_buffer_ms: u32,
        flush: Arc<AtomicBool>,
        failed: Arc<AtomicBool>,
    ) -> Result<(cpal::Stream, Started), PlaybackError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| {
                PlaybackError::OutputUnavailable("no output device available".to_string())
            })?;

        let unavailable = |e: cpal::SupportedStreamConfigsError| {
            PlaybackError::OutputUnavailable(e.to_string())
        };
        let mut supported_configs_range = device.supported_output_configs().map_err(unavailable)?;
        let config_range = match supported_configs_range.find(|c| c.channels() == 1) {
            None => device
                .supported_output_configs()
                .map_err(unavailable)?
                .next()
                .ok_or_else(|| {
                    PlaybackError::OutputUnavailable("no audio output available".to_string())
                })?,
            Some(config_range) => config_range,
        };

        let sample_rate = cpal::SampleRate(sample_rate_hz).clamp(
            config_range.min_sample_rate(),
            config_range.max_sample_rate(),
        );
        let config: cpal::StreamConfig = config_range.with_sample_rate(sample_rate).into();
        let channels = config.channels as usize;
        let device_rate_hz = config.sample_rate.0;

        let max_buffer_samples = ((device_rate_hz as u64 * max_buffer_ms as u64) / 1000) as usize;
        let rb = HeapRb::<f32>::new(max_buffer_samples.max(device_rate_hz as usize / 10));
        let (producer, mut consumer) = rb.split();
        let mut last_elem_state = 0.0f32;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    data.fill(0.);

                    if flush.swap(false, Ordering::AcqRel) {
                        let occupied = consumer.occupied_len();
                        consumer.skip(occupied);
                        last_elem_state = 0.0;
                        return;
                    }

                    let mut last_elem = last_elem_state;
                    for (idx, elem) in data.iter_mut().enumerate() {
                        if idx % channels == 0 {
                            match consumer.try_pop() {
                                None => break,
                                Some(v) => {
                                    last_elem = v;
                                    *elem = v;
                                }
                            }
                        } else {
                            *elem = last_elem;
                        }
                    }
                    last_elem_state = last_elem;
                },
                move |err| {
                    warn!(error = %err, "output stream error");
                    failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    PlaybackError::OutputUnavailable(e.to_string())
                }
                other => PlaybackError::Backend(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| PlaybackError::OutputSuspended(e.to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "<unknown>".to_string()),
            device_rate_hz,
            channels,
            "output stream started"
        );

        Ok((
            stream,
            Started {
                producer,
                device_rate_hz,
            },
        ))
    }
}
