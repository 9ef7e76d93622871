//! Microphone capture.
//!
//! A [`CaptureBackend`] opens the input device and hands back a
//! [`CaptureHandle`] that yields fixed-duration mono PCM16 frames at the
//! device rate. The handle owns the device for its whole lifetime: dropping
//! or closing it releases the device on every path.

use crate::audio::AudioFrame;
use crate::config::CaptureConfig;
use crate::error::CaptureError;

use tokio::sync::mpsc;
use tracing::debug;

pub trait CaptureBackend: Send + Sync + 'static {
    fn open(&self, config: &CaptureConfig) -> Result<CaptureHandle, CaptureError>;
}

/// Receiving side of an open capture device.
pub struct CaptureHandle {
    sample_rate_hz: u32,
    frames: mpsc::Receiver<AudioFrame>,
    errors: mpsc::Receiver<CaptureError>,
    guard: Option<Box<dyn Send>>,
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("open", &self.guard.is_some())
            .finish()
    }
}

impl CaptureHandle {
    /// Creates a handle plus the sink a backend pushes frames into. `capacity`
    /// is the number of frames buffered before new frames are dropped.
    pub fn new(sample_rate_hz: u32, capacity: usize) -> (Self, CaptureSink) {
        let (frame_tx, frame_rx) = mpsc::channel(capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(1);
        (
            Self {
                sample_rate_hz,
                frames: frame_rx,
                errors: error_rx,
                guard: None,
            },
            CaptureSink {
                frames: frame_tx,
                errors: error_tx,
            },
        )
    }

    /// Attaches whatever keeps the device open; it is dropped on `close()`.
    pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    /// Next captured frame. A device failure is reported ahead of any frames
    /// still queued; `None` means the backend stopped.
    pub async fn next(&mut self) -> Option<Result<AudioFrame, CaptureError>> {
        tokio::select! {
            biased;
            Some(err) = self.errors.recv() => Some(Err(err)),
            frame = self.frames.recv() => frame.map(Ok),
        }
    }

    /// Releases the input device and discards queued frames.
    pub fn close(mut self) {
        self.frames.close();
        if self.guard.take().is_some() {
            debug!(sample_rate_hz = self.sample_rate_hz, "capture device released");
        }
    }
}

/// Producer side handed to the device callback. Never blocks.
#[derive(Clone, Debug)]
pub struct CaptureSink {
    frames: mpsc::Sender<AudioFrame>,
    errors: mpsc::Sender<CaptureError>,
}

impl CaptureSink {
    /// Returns false when the frame was dropped (queue full or handle closed).
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        self.frames.try_send(frame).is_ok()
    }

    pub fn fail(&self, err: CaptureError) {
        let _ = self.errors.try_send(err);
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalCapture;

#[cfg(feature = "cpal-backend")]
mod cpal_backend {
    use super::{CaptureBackend, CaptureHandle, CaptureSink};
    use crate::audio::{AudioFrame, downmix_f32_to_mono_into};
    use crate::config::CaptureConfig;
    use crate::error::CaptureError;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
    use std::sync::mpsc as std_mpsc;
    use std::thread::{self, JoinHandle};
    use tracing::{debug, info, warn};

    /// Captures from the default (or a named) input device via cpal.
    ///
    /// `cpal::Stream` is not `Send` on every platform, so the stream lives on
    /// a dedicated thread that parks until the handle is closed.
    #[derive(Clone, Debug, Default)]
    pub struct CpalCapture {
        device_name: Option<String>,
    }

    impl CpalCapture {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_device(name: impl Into<String>) -> Self {
            Self {
                device_name: Some(name.into()),
            }
        }
    }

    impl CaptureBackend for CpalCapture {
        fn open(&self, config: &CaptureConfig) -> Result<CaptureHandle, CaptureError> {
            let (ready_tx, ready_rx) =
                std_mpsc::sync_channel::<Result<CaptureHandle, CaptureError>>(1);
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let device_name = self.device_name.clone();
            let config = *config;

            let thread = thread::Builder::new()
                .name("emobuddy-capture".to_string())
                .spawn(move || {
                    let stream = match start_stream(device_name.as_deref(), &config) {
                        Ok((stream, handle)) => {
                            let _ = ready_tx.send(Ok(handle));
                            stream
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    // Returns once the guard drops the sender.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("capture stream stopped");
                })
                .map_err(|e| CaptureError::Backend(e.to_string()))?;

            let guard = StreamGuard {
                stop: Some(stop_tx),
                thread: Some(thread),
            };

            match ready_rx.recv() {
                Ok(Ok(handle)) => Ok(handle.with_guard(guard)),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(CaptureError::Backend(
                    "capture thread exited during startup".to_string(),
                )),
            }
        }
    }

    struct StreamGuard {
        stop: Option<std_mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl Drop for StreamGuard {
        fn drop(&mut self) {
            self.stop.take();
            if let Some(thread) = self.thread.take() {
                if thread.join().is_err() {
                    warn!("capture thread panicked");
                }
            }
        }
    }

    fn start_stream(
        device_name: Option<&str>,
        config: &CaptureConfig,
    ) -> Result<(cpal::Stream, CaptureHandle), CaptureError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| classify_backend(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    CaptureError::DeviceUnavailable(format!("no input device named {name}"))
                })?,
            None => host.default_input_device().ok_or_else(|| {
                CaptureError::DeviceUnavailable("no default input device available".to_string())
            })?,
        };

        let input_config = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable(e.to_string())
            }
            cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                CaptureError::UnsupportedFormat(e.to_string())
            }
            other => classify_backend(other.to_string()),
        })?;

        let sample_rate_hz = input_config.sample_rate().0;
        let channels = usize::from(input_config.channels());
        let stream_config: StreamConfig = input_config.clone().into();
        let frame_samples = config.frame_samples(sample_rate_hz);

        let (handle, sink) = CaptureHandle::new(sample_rate_hz, config.queue_frames);

        let stream = match input_config.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(
                &device,
                &stream_config,
                channels,
                frame_samples,
                sample_rate_hz,
                sink,
            )?,
            SampleFormat::I16 => build_stream::<i16>(
                &device,
                &stream_config,
                channels,
                frame_samples,
                sample_rate_hz,
                sink,
            )?,
            SampleFormat::U16 => build_stream::<u16>(
                &device,
                &stream_config,
                channels,
                frame_samples,
                sample_rate_hz,
                sink,
            )?,
            other => {
                return Err(CaptureError::UnsupportedFormat(format!(
                    "unsupported input sample format: {other:?}"
                )));
            }
        };

        stream.play().map_err(|e| classify_backend(e.to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "<unknown>".to_string()),
            sample_rate_hz,
            channels,
            frame_samples,
            "capture device opened"
        );

        Ok((stream, handle))
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        channels: usize,
        frame_samples: usize,
        sample_rate_hz: u32,
        sink: CaptureSink,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let mut scratch = Vec::<f32>::with_capacity(frame_samples * channels);
        let mut mono_buf = Vec::<f32>::with_capacity(frame_samples);
        let mut pending = Vec::<f32>::with_capacity(frame_samples * 4);
        let mut pending_read_idx = 0usize;
        let error_sink = sink.clone();

        device
            .build_input_stream(
                config,
                move |data: &[T], _info| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
                    downmix_f32_to_mono_into(&scratch, channels, &mut mono_buf);
                    if mono_buf.is_empty() {
                        return;
                    }

                    pending.extend_from_slice(&mono_buf);

                    while pending.len().saturating_sub(pending_read_idx) >= frame_samples {
                        let start = pending_read_idx;
                        let end = pending_read_idx + frame_samples;
                        pending_read_idx = end;
                        let Ok(frame) =
                            AudioFrame::from_f32(&pending[start..end], sample_rate_hz)
                        else {
                            continue;
                        };
                        if !sink.push_frame(frame) {
                            // Consumer is behind; start over from fresh audio.
                            pending.clear();
                            pending_read_idx = 0;
                            break;
                        }
                    }

                    if pending_read_idx > 0 && pending_read_idx >= frame_samples * 4 {
                        pending.drain(..pending_read_idx);
                        pending_read_idx = 0;
                    }
                },
                move |err| {
                    warn!(error = %err, "capture stream error");
                    let err = match err {
                        cpal::StreamError::DeviceNotAvailable => {
                            CaptureError::DeviceLost(err.to_string())
                        }
                        other => classify_backend(other.to_string()),
                    };
                    error_sink.fail(err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    CaptureError::DeviceUnavailable(e.to_string())
                }
                cpal::BuildStreamError::StreamConfigNotSupported => {
                    CaptureError::UnsupportedFormat(e.to_string())
                }
                other => classify_backend(other.to_string()),
            })
    }

    /// Host backends report revoked or missing microphone access as a generic
    /// backend error; only the message tells it apart.
    pub(super) fn classify_backend(message: String) -> CaptureError {
        let lower = message.to_ascii_lowercase();
        if lower.contains("permission")
            || lower.contains("denied")
            || lower.contains("not authorized")
        {
            CaptureError::PermissionDenied(message)
        } else {
            CaptureError::Backend(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagOnDrop(Arc<AtomicBool>);

    impl Drop for FlagOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn frame(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; 4], 16_000).unwrap()
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (mut handle, sink) = CaptureHandle::new(16_000, 4);
        assert!(sink.push_frame(frame(1)));
        assert!(sink.push_frame(frame(2)));

        assert_eq!(handle.next().await.unwrap().unwrap().samples()[0], 1);
        assert_eq!(handle.next().await.unwrap().unwrap().samples()[0], 2);

        drop(sink);
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn device_failure_preempts_queued_frames() {
        let (mut handle, sink) = CaptureHandle::new(16_000, 4);
        sink.push_frame(frame(1));
        sink.fail(CaptureError::PermissionDenied("revoked".to_string()));

        assert_eq!(
            handle.next().await.unwrap().unwrap_err(),
            CaptureError::PermissionDenied("revoked".to_string())
        );
    }

    #[test]
    fn full_queue_drops_newest_frame() {
        let (_handle, sink) = CaptureHandle::new(16_000, 1);
        assert!(sink.push_frame(frame(1)));
        assert!(!sink.push_frame(frame(2)));
    }

    #[test]
    fn close_releases_guard_and_stops_sink() {
        let released = Arc::new(AtomicBool::new(false));
        let (handle, sink) = CaptureHandle::new(16_000, 4);
        let handle = handle.with_guard(FlagOnDrop(released.clone()));

        assert!(!released.load(Ordering::SeqCst));
        handle.close();
        assert!(released.load(Ordering::SeqCst));
        assert!(sink.is_closed());
        assert!(!sink.push_frame(frame(1)));
    }

    #[cfg(feature = "cpal-backend")]
    #[test]
    fn permission_messages_are_classified() {
        assert!(matches!(
            cpal_backend::classify_backend("Access denied by the system".to_string()),
            CaptureError::PermissionDenied(_)
        ));
        assert!(matches!(
            cpal_backend::classify_backend("ALSA function failed".to_string()),
            CaptureError::Backend(_)
        ));
    }
}
