use crate::config::{AudioConfig, EndpointConfig};
use crate::error::TransportError;
use crate::protocol::{Envelope, WireMessage, decode_envelope, encode_envelope};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INBOUND_QUEUE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug)]
enum Outbound {
    Msg(WireMessage),
    Close,
}

/// Result of a non-blocking send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Queued,
    /// Outbound queue full; the message was dropped.
    Full,
    /// The transport is closed or aborted; the message was dropped.
    Closed,
}

fn close_code_message(code: u16, reason: &str) -> String {
    let reason = reason.trim();
    let reason_suffix = if reason.is_empty() {
        String::new()
    } else {
        format!(" (reason: {reason})")
    };

    match code {
        1000 => format!("server ended the session (close code 1000){reason_suffix}"),
        4000 => format!("server at capacity (close code 4000){reason_suffix}"),
        4001 => format!("authentication failed (close code 4001){reason_suffix}"),
        4002 => format!("session timeout (close code 4002){reason_suffix}"),
        4003 => format!("invalid message (close code 4003){reason_suffix}"),
        4004 => format!("rate limited (close code 4004){reason_suffix}"),
        4005 => format!("resource unavailable (close code 4005){reason_suffix}"),
        4006 => format!("client timeout (close code 4006){reason_suffix}"),
        other => format!("websocket closed (code {other}){reason_suffix}"),
    }
}

fn close_error(frame: Option<CloseFrame>) -> TransportError {
    let (code, reason) = match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
        None => (1005, String::new()),
    };
    let message = close_code_message(code, &reason);
    match code {
        4001 => TransportError::Unauthorized(message),
        1000 | 1001 | 1005 => TransportError::Disconnected(message),
        _ => TransportError::RemoteClosed { code, message },
    }
}

pub fn build_ws_url(endpoint: &EndpointConfig) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(&endpoint.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported scheme {:?}, expected ws or wss",
            url.scheme()
        )));
    }
    if let Some(token) = endpoint.query_token.as_deref() {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

pub fn redact_ws_url(url: &Url) -> String {
    let mut url = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            if k == "token" {
                (k.to_string(), "REDACTED".to_string())
            } else {
                (k.to_string(), v.to_string())
            }
        })
        .collect();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

async fn connect_ws(url: &Url, auth_token: Option<&str>) -> Result<WsStream, TransportError> {
    let mut req = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

    if let Some(token) = auth_token {
        let header_value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        req.headers_mut().insert(AUTHORIZATION, header_value);
    }

    let (ws_stream, _resp) = connect_async(req).await.map_err(|e| match e {
        tokio_tungstenite::tungstenite::Error::Http(resp)
            if matches!(resp.status().as_u16(), 401 | 403) =>
        {
            TransportError::Unauthorized(format!("server answered HTTP {}", resp.status()))
        }
        other => TransportError::Connect(other.to_string()),
    })?;

    Ok(ws_stream)
}

/// Sends `setup` and waits for `ready`.
async fn handshake(
    ws: &mut WsStream,
    endpoint: &EndpointConfig,
    audio: &AudioConfig,
) -> Result<(), TransportError> {
    let setup = encode_envelope(&Envelope::Setup {
        protocol_version: endpoint.protocol_version,
        input_sample_rate: audio.input_sample_rate_hz,
        output_sample_rate: audio.output_sample_rate_hz,
    })?;
    ws.send(Message::Text(setup.into()))
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    loop {
        let item = ws
            .next()
            .await
            .ok_or_else(|| TransportError::Handshake("connection closed before ready".into()))?
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        match item {
            Message::Text(text) => match decode_envelope(text.as_str()) {
                Ok(Envelope::Ready { protocol_version }) => {
                    if protocol_version != endpoint.protocol_version {
                        return Err(TransportError::Handshake(format!(
                            "server speaks protocol version {protocol_version}, client {}",
                            endpoint.protocol_version
                        )));
                    }
                    return Ok(());
                }
                Ok(Envelope::Error { code, message }) => {
                    return Err(TransportError::Rejected { code, message });
                }
                Ok(other) => {
                    return Err(TransportError::Handshake(format!(
                        "unexpected message before ready: {other:?}"
                    )));
                }
                Err(e) => return Err(TransportError::Handshake(e.to_string())),
            },
            Message::Close(frame) => {
                return Err(match close_error(frame) {
                    TransportError::Unauthorized(message) => TransportError::Unauthorized(message),
                    TransportError::RemoteClosed { code, message }
                    | TransportError::Rejected { code, message } => {
                        TransportError::Rejected { code, message }
                    }
                    other => TransportError::Handshake(other.to_string()),
                });
            }
            Message::Binary(_) => {
                return Err(TransportError::Handshake(
                    "audio received before ready".to_string(),
                ));
            }
            _ => {}
        }
    }
}

/// Cloneable, non-blocking send side of a [`StreamTransport`].
#[derive(Clone, Debug)]
pub struct TransportSender {
    tx: mpsc::Sender<Outbound>,
    open: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl TransportSender {
    /// Enqueues a message for transmission. Never waits; once the transport
    /// has closed this is a no-op.
    pub fn send(&self, msg: WireMessage) -> SendStatus {
        if !self.open.load(Ordering::Acquire) {
            return SendStatus::Closed;
        }
        match self.tx.try_send(Outbound::Msg(msg)) {
            Ok(()) => SendStatus::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendStatus::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendStatus::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Terminates the connection immediately, discarding unsent messages.
    pub fn abort(&self) {
        self.open.store(false, Ordering::Release);
        self.abort.abort();
    }
}

/// An open, handshaken duplex session with the live endpoint.
///
/// One io task owns the socket: it writes queued outbound messages, forwards
/// inbound messages in receipt order and pings the server. A dead connection
/// is reported once, as the last inbound item.
pub struct StreamTransport {
    sender: TransportSender,
    inbound: mpsc::Receiver<Result<WireMessage, TransportError>>,
    state: watch::Receiver<TransportState>,
    state_tx: Arc<watch::Sender<TransportState>>,
    io_loop: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl StreamTransport {
    pub async fn open(
        endpoint: &EndpointConfig,
        audio: &AudioConfig,
    ) -> Result<Self, TransportError> {
        let url = build_ws_url(endpoint)?;
        let redacted = redact_ws_url(&url);
        info!(url = %redacted, protocol_version = endpoint.protocol_version, "connecting");

        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);

        let mut ws = timeout(
            endpoint.handshake_timeout(),
            connect_ws(&url, endpoint.auth_token.as_deref()),
        )
        .await
        .map_err(|_| TransportError::Timeout(format!("connecting to {redacted}")))??;

        timeout(endpoint.handshake_timeout(), handshake(&mut ws, endpoint, audio))
            .await
            .map_err(|_| TransportError::Timeout("waiting for ready".to_string()))??;

        let (tx, rx) = mpsc::channel::<Outbound>(endpoint.outbound_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let open = Arc::new(AtomicBool::new(true));
        let state_tx = Arc::new(state_tx);

        let io_loop = tokio::spawn(run_io(
            ws,
            rx,
            inbound_tx,
            open.clone(),
            state_tx.clone(),
            IoTimings {
                heartbeat_interval: endpoint.heartbeat_interval(),
                heartbeat_timeout: endpoint.heartbeat_timeout(),
                close_timeout: endpoint.close_timeout(),
            },
        ));

        state_tx.send_replace(TransportState::Open);
        info!(url = %redacted, "session ready");

        Ok(Self {
            sender: TransportSender {
                tx,
                open,
                abort: io_loop.abort_handle(),
            },
            inbound: inbound_rx,
            state: state_rx,
            state_tx,
            io_loop: Some(io_loop),
            close_timeout: endpoint.close_timeout(),
        })
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub fn send(&self, msg: WireMessage) -> SendStatus {
        self.sender.send(msg)
    }

    /// Next inbound message in the order the server sent it. Malformed
    /// messages arrive as recoverable `Protocol` errors; a fatal error is the
    /// last item before `None`.
    pub async fn recv(&mut self) -> Option<Result<WireMessage, TransportError>> {
        self.inbound.recv().await
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.clone()
    }

    pub fn abort(mut self) {
        self.sender.abort();
        self.io_loop.take();
        self.state_tx.send_replace(TransportState::Closed);
    }

    /// Flushes queued sends, sends a close frame and waits for the io task,
    /// aborting it if that takes longer than the close timeout.
    pub async fn close(mut self) {
        if matches!(self.state(), TransportState::Open) {
            self.state_tx.send_replace(TransportState::Closing);
        }
        let queued = timeout(self.close_timeout, self.sender.tx.send(Outbound::Close)).await;
        self.sender.open.store(false, Ordering::Release);
        if !matches!(queued, Ok(Ok(()))) {
            debug!("io loop not accepting close, aborting");
            self.sender.abort.abort();
        }

        let Some(mut io_loop) = self.io_loop.take() else {
            return;
        };

        let mut inbound_open = true;
        let joined = timeout(self.close_timeout, async {
            loop {
                tokio::select! {
                    res = &mut io_loop => return res,
                    item = self.inbound.recv(), if inbound_open => {
                        if item.is_none() {
                            inbound_open = false;
                        }
                    }
                }
            }
        })
        .await;

        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!(error = %e, "transport io task failed"),
            Err(_) => {
                warn!("transport close timed out, aborting");
                io_loop.abort();
            }
        }
        if !matches!(*self.state.borrow(), TransportState::Failed) {
            self.state_tx.send_replace(TransportState::Closed);
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Some(io_loop) = self.io_loop.take() {
            self.sender.open.store(false, Ordering::Release);
            io_loop.abort();
        }
    }
}

struct IoTimings {
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    close_timeout: Duration,
}

async fn run_io(
    ws: WsStream,
    mut rx: mpsc::Receiver<Outbound>,
    inbound_tx: mpsc::Sender<Result<WireMessage, TransportError>>,
    open: Arc<AtomicBool>,
    state_tx: Arc<watch::Sender<TransportState>>,
    timings: IoTimings,
) {
    let (mut ws_write, mut ws_read) = ws.split();
    let mut heartbeat = interval_at(
        Instant::now() + timings.heartbeat_interval,
        timings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let result: Result<(), TransportError> = loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Outbound::Msg(msg)) => {
                        let msg = match msg.into_ws_message() {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!(error = %e, "dropping unencodable outbound message");
                                continue;
                            }
                        };
                        if let Err(e) = ws_write.send(msg).await {
                            break Err(TransportError::Disconnected(e.to_string()));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client closing".into(),
                        };
                        let _ = ws_write.send(Message::Close(Some(frame))).await;
                        // Wait for the server's close acknowledgement.
                        let _ = timeout(timings.close_timeout, async {
                            while let Some(Ok(msg)) = ws_read.next().await {
                                if msg.is_close() {
                                    break;
                                }
                            }
                        })
                        .await;
                        break Ok(());
                    }
                }
            }
            item = ws_read.next() => {
                last_seen = Instant::now();
                let forward = match item {
                    None => break Err(TransportError::Disconnected(
                        "connection closed without close frame".to_string(),
                    )),
                    Some(Err(e)) => break Err(TransportError::Disconnected(e.to_string())),
                    Some(Ok(Message::Binary(bytes))) => Ok(WireMessage::AudioChunk(bytes)),
                    Some(Ok(Message::Text(text))) => WireMessage::from_text(text.as_str()),
                    Some(Ok(Message::Close(frame))) => break Err(close_error(frame)),
                    Some(Ok(_)) => continue,
                };
                if let Err(e) = &forward {
                    warn!(error = %e, "dropping malformed inbound message");
                }
                if inbound_tx.send(forward).await.is_err() {
                    break Ok(());
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timings.heartbeat_timeout {
                    break Err(TransportError::Disconnected(format!(
                        "no data from server for {} ms",
                        last_seen.elapsed().as_millis()
                    )));
                }
                if let Err(e) = ws_write.send(Message::Ping(Bytes::new())).await {
                    break Err(TransportError::Disconnected(e.to_string()));
                }
            }
        }
    };

    open.store(false, Ordering::Release);
    match result {
        Ok(()) => {
            debug!("transport closed");
            state_tx.send_replace(TransportState::Closed);
        }
        Err(err) => {
            warn!(error = %err, "transport failed");
            state_tx.send_replace(TransportState::Failed);
            let _ = inbound_tx.send(Err(err)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlKind;
    use crate::test_support::{accept_setup, serve_once};

    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    fn endpoint(url: String) -> EndpointConfig {
        EndpointConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 5_000,
            close_timeout_ms: 1_000,
            ..EndpointConfig::new(url)
        }
    }

    #[test]
    fn query_token_is_appended_and_redacted() {
        let endpoint = EndpointConfig {
            query_token: Some("s3cret".to_string()),
            ..EndpointConfig::new("wss://voice.example.com/live?lang=en")
        };
        let url = build_ws_url(&endpoint).unwrap();
        assert!(url.as_str().contains("token=s3cret"));
        let redacted = redact_ws_url(&url);
        assert!(!redacted.contains("s3cret"));
        assert!(redacted.contains("lang=en"));
    }

    #[test]
    fn non_websocket_scheme_is_invalid() {
        let endpoint = EndpointConfig::new("https://voice.example.com/live");
        assert!(matches!(
            build_ws_url(&endpoint),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn close_frames_map_to_errors() {
        let frame = |code: u16| {
            Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })
        };
        assert!(matches!(close_error(frame(4001)), TransportError::Unauthorized(_)));
        assert!(matches!(close_error(frame(1000)), TransportError::Disconnected(_)));
        assert!(matches!(
            close_error(frame(4000)),
            TransportError::RemoteClosed { code: 4000, .. }
        ));
    }

    #[tokio::test]
    async fn handshake_presents_credentials_and_rates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_auth = Arc::new(Mutex::new(None::<String>));
        let seen_query = Arc::new(Mutex::new(None::<String>));

        let (auth, query) = (seen_auth.clone(), seen_query.clone());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
                *auth.lock().unwrap() = req
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *query.lock().unwrap() = req.uri().query().map(str::to_string);
                Ok(resp)
            })
            .await
            .unwrap();
            let setup = accept_setup(&mut ws).await;
            // Wait for the client's close frame.
            let _ = ws.next().await;
            setup
        });

        let endpoint = EndpointConfig {
            auth_token: Some("bearer-key".to_string()),
            query_token: Some("query-key".to_string()),
            ..endpoint(format!("ws://{addr}/live"))
        };
        let transport = StreamTransport::open(&endpoint, &AudioConfig::default())
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Open);
        transport.close().await;

        let setup = server.await.unwrap();
        assert_eq!(setup["protocol_version"], 1);
        assert_eq!(setup["input_sample_rate"], 16_000);
        assert_eq!(setup["output_sample_rate"], 24_000);
        assert_eq!(seen_auth.lock().unwrap().as_deref(), Some("Bearer bearer-key"));
        assert_eq!(seen_query.lock().unwrap().as_deref(), Some("token=query-key"));
    }

    #[tokio::test]
    async fn protocol_version_mismatch_fails_handshake() {
        let url = serve_once(|mut ws| async move {
            let _ = ws.next().await;
            let ready = r#"{"type":"ready","protocol_version":2}"#;
            let _ = ws.send(Message::Text(ready.into())).await;
            let _ = ws.next().await;
        })
        .await;

        let err = StreamTransport::open(&endpoint(url), &AudioConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)), "{err:?}");
    }

    #[tokio::test]
    async fn error_before_ready_is_rejection() {
        let url = serve_once(|mut ws| async move {
            let _ = ws.next().await;
            let error = r#"{"type":"error","code":503,"message":"no voices left"}"#;
            let _ = ws.send(Message::Text(error.into())).await;
            let _ = ws.next().await;
        })
        .await;

        let err = StreamTransport::open(&endpoint(url), &AudioConfig::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Rejected {
                code: 503,
                message: "no voices left".to_string()
            }
        );
    }

    #[tokio::test]
    async fn auth_close_during_handshake_is_unauthorized() {
        let url = serve_once(|mut ws| async move {
            let _ = ws.next().await;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(4001),
                    reason: "bad key".into(),
                }))
                .await;
        })
        .await;

        let err = StreamTransport::open(&endpoint(url), &AudioConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized(_)), "{err:?}");
    }

    #[tokio::test]
    async fn inbound_messages_keep_server_order() {
        let url = serve_once(|mut ws| async move {
            accept_setup(&mut ws).await;
            for i in 1..=3u8 {
                ws.send(Message::Binary(vec![i, 0].into())).await.unwrap();
            }
            ws.send(Message::Text("{not json".into())).await.unwrap();
            let event = r#"{"type":"event","kind":"turn_complete"}"#;
            ws.send(Message::Text(event.into())).await.unwrap();
            ws.send(Message::Binary(vec![4, 0].into())).await.unwrap();
            let _ = ws.next().await;
        })
        .await;

        let mut transport = StreamTransport::open(&endpoint(url), &AudioConfig::default())
            .await
            .unwrap();

        for i in 1..=3u8 {
            let msg = transport.recv().await.unwrap().unwrap();
            assert_eq!(msg, WireMessage::AudioChunk(Bytes::from(vec![i, 0])));
        }
        let err = transport.recv().await.unwrap().unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            WireMessage::ControlEvent(ControlKind::TurnComplete)
        );
        assert_eq!(
            transport.recv().await.unwrap().unwrap(),
            WireMessage::AudioChunk(Bytes::from(vec![4, 0]))
        );
        transport.close().await;
    }

    #[tokio::test]
    async fn close_flushes_queued_sends() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let url = serve_once(|mut ws| async move {
            accept_setup(&mut ws).await;
            let mut received = Vec::new();
            let mut saw_close = false;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(bytes) => received.push(bytes.to_vec()),
                    Message::Close(_) => {
                        saw_close = true;
                        break;
                    }
                    _ => {}
                }
            }
            let _ = done_tx.send((received, saw_close));
        })
        .await;

        let transport = StreamTransport::open(&endpoint(url), &AudioConfig::default())
            .await
            .unwrap();
        let sender = transport.sender();
        for i in 0..3u8 {
            let status = sender.send(WireMessage::AudioChunk(Bytes::from(vec![i, i])));
            assert_eq!(status, SendStatus::Queued);
        }
        transport.close().await;

        let (received, saw_close) = done_rx.await.unwrap();
        assert_eq!(received, vec![vec![0, 0], vec![1, 1], vec![2, 2]]);
        assert!(saw_close);
        assert_eq!(
            sender.send(WireMessage::AudioChunk(Bytes::from_static(&[0, 0]))),
            SendStatus::Closed
        );
    }

    #[tokio::test]
    async fn abort_discards_queued_sends_without_close_frame() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let url = serve_once(|mut ws| async move {
            accept_setup(&mut ws).await;
            let mut received = 0;
            let mut saw_close = false;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(_) => received += 1,
                    Message::Close(_) => {
                        saw_close = true;
                        break;
                    }
                    _ => {}
                }
            }
            let _ = done_tx.send((received, saw_close));
        })
        .await;

        let transport = StreamTransport::open(&endpoint(url), &AudioConfig::default())
            .await
            .unwrap();
        let mut state = transport.subscribe_state();
        assert_eq!(*state.borrow_and_update(), TransportState::Open);

        // The io task has not run yet on this thread, so all three stay queued.
        let sender = transport.sender();
        for i in 0..3u8 {
            let status = sender.send(WireMessage::AudioChunk(Bytes::from(vec![i, i])));
            assert_eq!(status, SendStatus::Queued);
        }
        transport.abort();

        assert_eq!(*state.borrow(), TransportState::Closed);
        assert!(!sender.is_open());
        assert_eq!(
            sender.send(WireMessage::AudioChunk(Bytes::from_static(&[0, 0]))),
            SendStatus::Closed
        );

        let (received, saw_close) = timeout(Duration::from_secs(2), done_rx)
            .await
            .expect("server should see the connection drop")
            .unwrap();
        assert_eq!(received, 0);
        assert!(!saw_close);
    }

    #[tokio::test]
    async fn dropped_connection_surfaces_disconnected() {
        let url = serve_once(|mut ws| async move {
            accept_setup(&mut ws).await;
            drop(ws);
        })
        .await;

        let mut transport = StreamTransport::open(&endpoint(url), &AudioConfig::default())
            .await
            .unwrap();
        let err = transport.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)), "{err:?}");
        assert!(transport.recv().await.is_none());
        assert_eq!(transport.state(), TransportState::Failed);
        assert_eq!(
            transport.send(WireMessage::AudioChunk(Bytes::from_static(&[0, 0]))),
            SendStatus::Closed
        );
    }

    #[tokio::test]
    async fn silent_server_trips_heartbeat() {
        let url = serve_once(|mut ws| async move {
            accept_setup(&mut ws).await;
            // Hold the socket without reading, so pings go unanswered.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(ws);
        })
        .await;

        let endpoint = EndpointConfig {
            heartbeat_interval_ms: 50,
            heartbeat_timeout_ms: 150,
            ..endpoint(url)
        };
        let mut transport = StreamTransport::open(&endpoint, &AudioConfig::default())
            .await
            .unwrap();

        let item = timeout(Duration::from_secs(2), transport.recv())
            .await
            .expect("heartbeat should fire before the server gives up");
        let err = item.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Disconnected(_)), "{err:?}");
    }
}
