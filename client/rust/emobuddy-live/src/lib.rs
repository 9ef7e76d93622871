//! Duplex live-voice streaming: microphone capture, PCM16 framing over a
//! WebSocket, and gapless playback of the reply.

mod error;

pub mod audio;
pub mod codec;
pub mod config;
pub mod controller;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use audio::level::{VolumeMeter, VolumeSample};
pub use audio::playback::{
    OutputBackend, OutputDevice, PlaybackScheduler, ScheduledSpan, play_buffer,
};
pub use audio::capture::{CaptureBackend, CaptureHandle, CaptureSink};
pub use audio::{AudioFrame, ResampleQuality};
pub use codec::{Decoder, Encoder};
pub use config::{AudioConfig, CaptureConfig, EndpointConfig, PlaybackConfig, SessionConfig};
pub use controller::{ConnectionController, ConnectionState, DropReason, SessionEvent, VolumeGuard};
pub use error::{
    CaptureError, ConfigError, ConnectError, DecodeError, EncodeError, FailureKind, FrameError,
    PlaybackError, TransportError,
};
pub use protocol::{ControlKind, WireMessage};
pub use transport::{SendStatus, StreamTransport, TransportSender, TransportState};

#[cfg(feature = "cpal-backend")]
pub use audio::capture::CpalCapture;
#[cfg(feature = "cpal-backend")]
pub use audio::playback::CpalOutput;
