//! In-memory devices and a loopback WebSocket server for tests.

use crate::audio::AudioFrame;
use crate::audio::capture::{CaptureBackend, CaptureHandle, CaptureSink};
use crate::audio::playback::{OutputBackend, OutputDevice};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, PlaybackError};

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

#[derive(Default)]
struct OutputCounters {
    opened: AtomicUsize,
    open_devices: AtomicUsize,
    written_frames: AtomicUsize,
    written_samples: AtomicUsize,
    clears: AtomicUsize,
}

/// Output backend that records what reaches the device.
#[derive(Clone, Default)]
pub(crate) struct RecordingOutput {
    counters: Arc<OutputCounters>,
    fail_with: Arc<Mutex<Option<PlaybackError>>>,
}

impl RecordingOutput {
    pub(crate) fn failing(err: PlaybackError) -> Self {
        let output = Self::default();
        if let Ok(mut slot) = output.fail_with.lock() {
            *slot = Some(err);
        }
        output
    }

    pub(crate) fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn open_devices(&self) -> usize {
        self.counters.open_devices.load(Ordering::SeqCst)
    }

    pub(crate) fn written_frames(&self) -> usize {
        self.counters.written_frames.load(Ordering::SeqCst)
    }

    pub(crate) fn written_samples(&self) -> usize {
        self.counters.written_samples.load(Ordering::SeqCst)
    }

    pub(crate) fn clears(&self) -> usize {
        self.counters.clears.load(Ordering::SeqCst)
    }
}

impl OutputBackend for RecordingOutput {
    fn open(&self, _sample_rate_hz: u32) -> Result<Box<dyn OutputDevice>, PlaybackError> {
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingDevice {
            counters: self.counters.clone(),
        }))
    }
}

struct RecordingDevice {
    counters: Arc<OutputCounters>,
}

impl OutputDevice for RecordingDevice {
    fn write(&mut self, frame: AudioFrame) -> Result<(), PlaybackError> {
        self.counters.written_frames.fetch_add(1, Ordering::SeqCst);
        self.counters
            .written_samples
            .fetch_add(frame.sample_count(), Ordering::SeqCst);
        Ok(())
    }

    fn clear(&mut self) {
        self.counters.clears.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for RecordingDevice {
    fn drop(&mut self) {
        self.counters.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

struct CaptureGuard(Arc<AtomicUsize>);

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Capture backend whose frames are pushed by the test.
#[derive(Clone, Default)]
pub(crate) struct ScriptedCapture {
    open_handles: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    fail_with: Arc<Mutex<Option<CaptureError>>>,
    open_delay: Arc<Mutex<Option<Duration>>>,
    sink: Arc<Mutex<Option<CaptureSink>>>,
}

impl ScriptedCapture {
    pub(crate) fn failing(err: CaptureError) -> Self {
        let capture = Self::default();
        *capture.fail_with.lock().unwrap() = Some(err);
        capture
    }

    /// Blocks `open()` for `delay`, simulating a slow permission prompt.
    pub(crate) fn slow(delay: Duration) -> Self {
        let capture = Self::default();
        *capture.open_delay.lock().unwrap() = Some(delay);
        capture
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn sink(&self) -> Option<CaptureSink> {
        self.sink.lock().unwrap().clone()
    }
}

impl CaptureBackend for ScriptedCapture {
    fn open(&self, config: &CaptureConfig) -> Result<CaptureHandle, CaptureError> {
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.fail_with.lock().unwrap().clone() {
            return Err(err);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        let (handle, sink) = CaptureHandle::new(16_000, config.queue_frames);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(handle.with_guard(CaptureGuard(self.open_handles.clone())))
    }
}

pub(crate) fn tone(samples: usize, rate: u32) -> AudioFrame {
    let data = (0..samples)
        .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
        .collect();
    AudioFrame::new(data, rate).unwrap()
}

/// One-connection WebSocket server on an ephemeral port. The handler gets the
/// accepted stream; the returned url points at it.
pub(crate) async fn serve_once<F, Fut>(handler: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                handler(ws).await;
            }
        }
    });
    format!("ws://{addr}/live")
}

/// Reads the client's setup envelope and answers with `ready`.
pub(crate) async fn accept_setup(ws: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let setup: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(setup["type"], "setup");
                let ready = serde_json::json!({
                    "type": "ready",
                    "protocol_version": setup["protocol_version"],
                });
                ws.send(Message::Text(ready.to_string().into())).await.unwrap();
                return setup;
            }
            Some(Ok(_)) => continue,
            other => panic!("connection ended before setup: {other:?}"),
        }
    }
}
