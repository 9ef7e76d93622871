use thiserror::Error;

/// How a caller should react to a failed or stopped session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The user has to fix something first (grant microphone access, plug in a
    /// device, provide valid credentials).
    UserActionRequired,
    /// Transient; starting a new session later may succeed.
    RetryLater,
    /// The remote service refused or is not reachable.
    ServiceUnavailable,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("audio frame must contain at least one sample")]
    Empty,

    #[error("audio frame sample rate must be non-zero")]
    ZeroRate,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no input device available: {0}")]
    DeviceUnavailable(String),

    #[error("input device lost: {0}")]
    DeviceLost(String),

    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("capture backend error: {0}")]
    Backend(String),
}

impl CaptureError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CaptureError::PermissionDenied(_)
            | CaptureError::DeviceUnavailable(_)
            | CaptureError::UnsupportedFormat(_) => FailureKind::UserActionRequired,
            CaptureError::DeviceLost(_) | CaptureError::Backend(_) => FailureKind::RetryLater,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("frame sample rate {got} Hz does not match capture rate {expected} Hz")]
    RateMismatch { expected: u32, got: u32 },

    #[error("resampling failed: {0}")]
    Resample(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty audio payload")]
    Empty,

    #[error("truncated audio payload: {len} bytes is not a whole number of 16-bit samples")]
    Truncated { len: usize },

    #[error("invalid sample rate: {0} Hz")]
    InvalidRate(u32),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("session rejected by server (code {code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("{message}")]
    RemoteClosed { code: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl TransportError {
    /// Per-message errors that leave the session running.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Protocol(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::InvalidUrl(_) | TransportError::Unauthorized(_) => {
                FailureKind::UserActionRequired
            }
            TransportError::Connect(_)
            | TransportError::Handshake(_)
            | TransportError::Rejected { .. } => FailureKind::ServiceUnavailable,
            TransportError::RemoteClosed { code, .. } => {
                if is_retryable_close_code(*code) {
                    FailureKind::RetryLater
                } else {
                    FailureKind::ServiceUnavailable
                }
            }
            TransportError::Disconnected(_)
            | TransportError::Protocol(_)
            | TransportError::Timeout(_) => FailureKind::RetryLater,
        }
    }
}

pub(crate) fn is_retryable_close_code(code: u16) -> bool {
    matches!(code, 4000 | 4004 | 4005 | 4006 | 1012 | 1013)
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("no output device available: {0}")]
    OutputUnavailable(String),

    #[error("output device refused to start: {0}")]
    OutputSuspended(String),

    #[error("playback backend error: {0}")]
    Backend(String),

    #[error("invalid playback buffer: {0}")]
    InvalidBuffer(String),

    #[error("playback intake is closed")]
    Closed,
}

impl PlaybackError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PlaybackError::OutputUnavailable(_)
            | PlaybackError::OutputSuspended(_)
            | PlaybackError::InvalidBuffer(_) => FailureKind::UserActionRequired,
            PlaybackError::Backend(_) | PlaybackError::Closed => FailureKind::RetryLater,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Error surfaced by `connect()` and carried by `ConnectionState::Failed`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("a session is already connecting or active")]
    Busy,

    #[error("connect cancelled by disconnect")]
    Cancelled,
}

impl ConnectError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConnectError::Capture(e) => e.kind(),
            ConnectError::Transport(e) => e.kind(),
            ConnectError::Playback(e) => e.kind(),
            ConnectError::Config(_) => FailureKind::UserActionRequired,
            ConnectError::Busy | ConnectError::Cancelled => FailureKind::RetryLater,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ConnectError::Capture(CaptureError::PermissionDenied(_)))
    }
}
