//! Session state machine tying capture, transport and playback together.
//!
//! ```text
//! Idle -> Connecting -> Active -> Closing -> Closed
//!              |           |
//!              +-----------+----> Failed(reason)
//! ```
//!
//! Once `Active`, two pumps run as separate tasks: capture -> encode -> send,
//! and receive -> decode -> schedule. They only meet through the transport's
//! outbound queue and the playback scheduler. A supervisor task waits for the
//! caller to disconnect or for either pump to fail, then tears the session
//! down in a fixed order.

use crate::audio::capture::{CaptureBackend, CaptureHandle};
use crate::audio::level::{VolumeFeed, VolumeSample};
use crate::audio::playback::{OutputBackend, PlaybackScheduler};
use crate::codec::{Decoder, Encoder};
use crate::config::{EndpointConfig, SessionConfig};
use crate::error::{CaptureError, ConnectError, PlaybackError, TransportError};
use crate::protocol::{ControlKind, WireMessage};
use crate::transport::{SendStatus, StreamTransport, TransportSender};

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
    Failed(ConnectError),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed(_))
    }

    fn is_busy(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Active | ConnectionState::Closing
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Outbound queue full.
    Backpressure,
    EncodeFailed,
    DecodeFailed,
    MalformedMessage,
    PlaybackRejected,
}

/// Non-fatal notifications published while a session runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    ChunkDropped { reason: DropReason },
    RemoteError { code: u16, message: String },
    Control(ControlKind),
}

/// Stops the `on_volume` callback task when dropped.
#[derive(Debug)]
pub struct VolumeGuard {
    task: JoinHandle<()>,
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Inner {
    config: SessionConfig,
    capture: Arc<dyn CaptureBackend>,
    output: Arc<dyn OutputBackend>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    volume: VolumeFeed,
    stop: watch::Sender<bool>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    scheduler: Mutex<Option<PlaybackScheduler>>,
    live_sender: Mutex<Option<TransportSender>>,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        match &next {
            ConnectionState::Failed(err) => {
                warn!(error = %err, kind = ?err.kind(), "session failed")
            }
            other => info!(state = ?other, "session state"),
        }
        self.state.send_replace(next);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn take_scheduler(&self) -> PlaybackScheduler {
        let existing = self.scheduler.lock().ok().and_then(|mut slot| slot.take());
        existing.unwrap_or_else(|| {
            PlaybackScheduler::new(
                self.output.clone(),
                self.config.audio.output_sample_rate_hz,
                &self.config.playback,
            )
        })
    }

    fn store_scheduler(&self, scheduler: PlaybackScheduler) {
        if let Ok(mut slot) = self.scheduler.lock() {
            *slot = Some(scheduler);
        }
    }

    fn set_live_sender(&self, sender: Option<TransportSender>) {
        if let Ok(mut slot) = self.live_sender.lock() {
            *slot = sender;
        }
    }
}

/// Drives one live voice session at a time.
///
/// Cloning yields another handle to the same controller.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl ConnectionController {
    pub fn new(
        config: SessionConfig,
        capture: Arc<dyn CaptureBackend>,
        output: Arc<dyn OutputBackend>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                capture,
                output,
                state,
                events,
                volume: VolumeFeed::new(),
                stop,
                supervisor: tokio::sync::Mutex::new(None),
                scheduler: Mutex::new(None),
                live_sender: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Latest loudness only; a slow reader never holds up capture.
    pub fn subscribe_volume(&self) -> watch::Receiver<VolumeSample> {
        self.inner.volume.subscribe()
    }

    /// Calls `callback` from a background task with each new volume sample
    /// until the guard is dropped. Must be called within a tokio runtime.
    pub fn on_volume<F>(&self, callback: F) -> VolumeGuard
    where
        F: Fn(VolumeSample) + Send + 'static,
    {
        let mut rx = self.inner.volume.subscribe();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let sample = *rx.borrow_and_update();
                callback(sample);
            }
        });
        VolumeGuard { task }
    }

    /// Starts a session: opens the output device, then the transport and the
    /// microphone concurrently. Returns once the session is `Active`, or with
    /// the reason it could not start (the state is then `Failed`, or `Closed`
    /// if `disconnect()` was called meanwhile).
    pub async fn connect(&self, endpoint: &EndpointConfig) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let mut supervisor = inner.supervisor.lock().await;

        if inner.state.borrow().is_busy() {
            return Err(ConnectError::Busy);
        }
        if let Some(previous) = supervisor.take() {
            let _ = previous.await;
        }

        inner.config.validate()?;
        endpoint.validate()?;

        inner.stop.send_replace(false);
        let mut stop_rx = inner.stop.subscribe();
        inner.set_state(ConnectionState::Connecting);

        let mut scheduler = inner.take_scheduler();
        scheduler.reset();

        let audio = inner.config.audio;
        let capture_config = inner.config.capture;
        let capture_backend = inner.capture.clone();

        // Device opens block (permission prompts, driver startup).
        let output_open = async move {
            let opened =
                tokio::task::spawn_blocking(move || scheduler.ensure_output().map(|()| scheduler))
                    .await;
            match opened {
                Ok(result) => result.map_err(ConnectError::from),
                Err(e) => Err(ConnectError::Playback(PlaybackError::Backend(e.to_string()))),
            }
        };
        let capture_open = async move {
            let opened =
                tokio::task::spawn_blocking(move || capture_backend.open(&capture_config)).await;
            match opened {
                Ok(result) => result.map_err(ConnectError::from),
                Err(e) => Err(ConnectError::Capture(CaptureError::Backend(e.to_string()))),
            }
        };
        let transport_open =
            async { StreamTransport::open(endpoint, &audio).await.map_err(ConnectError::from) };

        let opened = tokio::select! {
            res = async { tokio::try_join!(output_open, transport_open, capture_open) } => res,
            _ = stopped(&mut stop_rx) => {
                info!("connect cancelled");
                inner.set_state(ConnectionState::Closed);
                return Err(ConnectError::Cancelled);
            }
        };

        let (scheduler, transport, capture) = match opened {
            Ok(parts) => parts,
            Err(err) => {
                inner.set_state(ConnectionState::Failed(err.clone()));
                return Err(err);
            }
        };

        let encoder = match Encoder::new(
            capture.sample_rate_hz(),
            audio.input_sample_rate_hz,
            capture_config.frame_ms,
            capture_config.resample_quality,
        ) {
            Ok(encoder) => encoder,
            Err(e) => {
                capture.close();
                transport.close().await;
                let err = ConnectError::Capture(CaptureError::UnsupportedFormat(e.to_string()));
                inner.set_state(ConnectionState::Failed(err.clone()));
                return Err(err);
            }
        };

        inner.set_live_sender(Some(transport.sender()));
        inner.set_state(ConnectionState::Active);
        *supervisor = Some(tokio::spawn(run_session(
            inner.clone(),
            Session {
                transport,
                capture,
                encoder,
                scheduler,
                decoder: Decoder::new(audio.output_sample_rate_hz),
            },
        )));
        Ok(())
    }

    /// Ends the session gracefully and waits (bounded) until it is released.
    /// Cancels a connect in progress. Safe to call in any state.
    ///
    /// After a transport failure the session is already `Failed` while its
    /// scheduled playback drains; this still waits for that drain and for
    /// the output device to be released.
    pub async fn disconnect(&self) {
        self.inner.stop.send_replace(true);
        let mut state = self.inner.state.subscribe();
        if timeout(DISCONNECT_TIMEOUT, state.wait_for(|s| !s.is_busy()))
            .await
            .is_err()
        {
            warn!("disconnect did not complete in time");
        }
        self.wait_released().await;
    }

    /// Waits (bounded) for the last session's teardown to finish, including
    /// a playback drain after a transport failure. Returns at once when no
    /// session has run.
    pub async fn wait_released(&self) {
        let mut supervisor = self.inner.supervisor.lock().await;
        let Some(handle) = &mut *supervisor else {
            return;
        };
        match timeout(DISCONNECT_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "session supervisor failed"),
            Err(_) => {
                warn!("session teardown did not complete in time");
                return;
            }
        }
        *supervisor = None;
    }

    /// Tears the connection down immediately, discarding unsent audio.
    /// Does not wait; the state settles on `Closed` shortly after.
    pub fn abort(&self) {
        self.inner.stop.send_replace(true);
        if let Ok(slot) = self.inner.live_sender.lock() {
            if let Some(sender) = slot.as_ref() {
                sender.abort();
            }
        }
    }
}

struct Session {
    transport: StreamTransport,
    capture: CaptureHandle,
    encoder: Encoder,
    scheduler: PlaybackScheduler,
    decoder: Decoder,
}

struct NetworkExit {
    transport: StreamTransport,
    scheduler: PlaybackScheduler,
    result: Result<(), ConnectError>,
}

enum Ending {
    Requested,
    Capture(CaptureError),
    Network(NetworkExit),
}

async fn run_session(inner: Arc<Inner>, session: Session) {
    let Session {
        transport,
        capture,
        encoder,
        scheduler,
        decoder,
    } = session;

    let (capture_stop_tx, capture_stop_rx) = watch::channel(false);
    let (network_stop_tx, network_stop_rx) = watch::channel(false);

    let mut frame_pump = tokio::spawn(frame_pump(
        inner.clone(),
        capture,
        encoder,
        transport.sender(),
        capture_stop_rx,
    ));
    let mut message_pump = tokio::spawn(message_pump(
        inner.clone(),
        transport,
        scheduler,
        decoder,
        network_stop_rx,
    ));
    let mut stop_rx = inner.stop.subscribe();

    let ending = tokio::select! {
        _ = stopped(&mut stop_rx) => Ending::Requested,
        res = &mut frame_pump => match res {
            Ok(Err(err)) => Ending::Capture(err),
            Ok(Ok(())) => Ending::Requested,
            Err(e) => Ending::Capture(CaptureError::Backend(e.to_string())),
        },
        res = &mut message_pump => match res {
            Ok(exit) => Ending::Network(exit),
            Err(e) => {
                warn!(error = %e, "message pump task failed");
                let _ = capture_stop_tx.send(true);
                join_frame_pump(frame_pump).await;
                inner.set_live_sender(None);
                let err = ConnectError::Transport(TransportError::Disconnected(e.to_string()));
                inner.set_state(ConnectionState::Failed(err));
                return;
            }
        },
    };

    match ending {
        Ending::Requested => {
            inner.set_state(ConnectionState::Closing);
            let _ = capture_stop_tx.send(true);
            join_frame_pump(frame_pump).await;
            let _ = network_stop_tx.send(true);
            if let Some(exit) = join_message_pump(message_pump).await {
                exit.transport.close().await;
                let mut scheduler = exit.scheduler;
                scheduler.shutdown();
                inner.store_scheduler(scheduler);
            }
            inner.set_live_sender(None);
            inner.set_state(ConnectionState::Closed);
        }
        Ending::Capture(err) => {
            let _ = network_stop_tx.send(true);
            if let Some(exit) = join_message_pump(message_pump).await {
                exit.transport.close().await;
                let mut scheduler = exit.scheduler;
                scheduler.shutdown();
                inner.store_scheduler(scheduler);
            }
            inner.set_live_sender(None);
            inner.set_state(ConnectionState::Failed(ConnectError::Capture(err)));
        }
        Ending::Network(exit) => {
            let _ = capture_stop_tx.send(true);
            join_frame_pump(frame_pump).await;
            inner.set_live_sender(None);

            let NetworkExit {
                transport,
                mut scheduler,
                result,
            } = exit;
            drop(transport);

            // An abort shows up as the transport ending; it is still a
            // caller-initiated stop.
            if inner.stop_requested() {
                scheduler.shutdown();
                inner.store_scheduler(scheduler);
                inner.set_state(ConnectionState::Closed);
                return;
            }

            let err = match result {
                Err(err) => err,
                Ok(()) => ConnectError::Transport(TransportError::Disconnected(
                    "transport ended".to_string(),
                )),
            };
            inner.set_state(ConnectionState::Failed(err));

            scheduler.close_intake();
            if let Err(e) = scheduler.drain().await {
                warn!(error = %e, "playback drain failed");
            }
            scheduler.shutdown();
            inner.store_scheduler(scheduler);
        }
    }
}

async fn join_frame_pump(mut pump: JoinHandle<Result<(), CaptureError>>) {
    match timeout(PUMP_JOIN_TIMEOUT, &mut pump).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => debug!(error = %e, "capture ended while stopping"),
        Ok(Err(e)) => warn!(error = %e, "frame pump task failed"),
        Err(_) => {
            warn!("frame pump did not stop in time");
            pump.abort();
        }
    }
}

async fn join_message_pump(mut pump: JoinHandle<NetworkExit>) -> Option<NetworkExit> {
    match timeout(PUMP_JOIN_TIMEOUT, &mut pump).await {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(e)) => {
            warn!(error = %e, "message pump task failed");
            None
        }
        Err(_) => {
            warn!("message pump did not stop in time");
            pump.abort();
            None
        }
    }
}

fn send_chunk(inner: &Inner, sender: &TransportSender, msg: WireMessage) {
    match sender.send(msg) {
        SendStatus::Queued => {}
        SendStatus::Full => {
            warn!("outbound queue full, dropping audio chunk");
            inner.emit(SessionEvent::ChunkDropped {
                reason: DropReason::Backpressure,
            });
        }
        SendStatus::Closed => {}
    }
}

/// capture -> volume -> encode -> send, until stopped or the device fails.
/// The capture handle is closed on every exit.
async fn frame_pump(
    inner: Arc<Inner>,
    mut capture: CaptureHandle,
    mut encoder: Encoder,
    sender: TransportSender,
    mut stop: watch::Receiver<bool>,
) -> Result<(), CaptureError> {
    let result = loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break Ok(()),
            item = capture.next() => match item {
                Some(Ok(frame)) => {
                    inner.volume.measure_and_publish(&frame);
                    match encoder.encode(frame) {
                        Ok(Some(msg)) => send_chunk(&inner, &sender, msg),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "dropping captured frame");
                            inner.emit(SessionEvent::ChunkDropped {
                                reason: DropReason::EncodeFailed,
                            });
                        }
                    }
                }
                Some(Err(err)) => break Err(err),
                None => break Err(CaptureError::DeviceLost("capture stream ended".to_string())),
            },
        }
    };

    capture.close();
    if result.is_ok() {
        if let Some(msg) = encoder.finish() {
            send_chunk(&inner, &sender, msg);
        }
    }
    inner.volume.publish(VolumeSample::silent());
    result
}

/// Resolves once the flag is set, or its sender is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(due) => sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// receive -> decode -> schedule, until stopped or the transport fails.
async fn message_pump(
    inner: Arc<Inner>,
    mut transport: StreamTransport,
    mut scheduler: PlaybackScheduler,
    decoder: Decoder,
    mut stop: watch::Receiver<bool>,
) -> NetworkExit {
    let meter_output = inner.config.meter_output;

    let result = loop {
        let due = scheduler.next_due();
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break Ok(()),
            _ = wait_until(due) => {
                if let Err(e) = scheduler.render_due(Instant::now()) {
                    break Err(ConnectError::Playback(e));
                }
            }
            item = transport.recv() => match item {
                Some(Ok(WireMessage::AudioChunk(bytes))) => match decoder.decode(&bytes) {
                    Ok(frame) => {
                        if meter_output {
                            inner.volume.measure_and_publish(&frame);
                        }
                        if let Err(e) = scheduler.schedule(frame) {
                            warn!(error = %e, "dropping decoded audio");
                            inner.emit(SessionEvent::ChunkDropped {
                                reason: DropReason::PlaybackRejected,
                            });
                        }
                        if let Err(e) = scheduler.render_due(Instant::now()) {
                            break Err(ConnectError::Playback(e));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable audio chunk");
                        inner.emit(SessionEvent::ChunkDropped {
                            reason: DropReason::DecodeFailed,
                        });
                    }
                },
                Some(Ok(WireMessage::ControlEvent(kind))) => {
                    debug!(?kind, "control event");
                    if kind == ControlKind::Interrupted {
                        scheduler.reset();
                    }
                    inner.emit(SessionEvent::Control(kind));
                }
                Some(Ok(WireMessage::Error { code, message })) => {
                    warn!(code, %message, "server reported an error");
                    inner.emit(SessionEvent::RemoteError { code, message });
                }
                Some(Err(e)) if e.is_recoverable() => {
                    inner.emit(SessionEvent::ChunkDropped {
                        reason: DropReason::MalformedMessage,
                    });
                }
                Some(Err(e)) => break Err(ConnectError::Transport(e)),
                None => break Ok(()),
            },
        }
    };

    NetworkExit {
        transport,
        scheduler,
        result,
    }
}
