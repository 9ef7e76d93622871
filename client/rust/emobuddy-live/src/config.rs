//! Session configuration, loadable from TOML.
//!
//! Every section has defaults so an empty file (or `SessionConfig::default()`)
//! describes a usable session apart from the endpoint url.

use crate::audio::ResampleQuality;
use crate::error::ConfigError;

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_INPUT_SAMPLE_RATE_HZ: u32 = 16_000;
pub const DEFAULT_OUTPUT_SAMPLE_RATE_HZ: u32 = 24_000;
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub endpoint: EndpointConfig,
    pub capture: CaptureConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
    /// Feed decoded output frames to the volume meter as well as the mic.
    pub meter_output: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    /// Sent as the `token` query parameter.
    pub query_token: Option<String>,
    pub protocol_version: u32,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub outbound_queue: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: None,
            query_token: None,
            protocol_version: PROTOCOL_VERSION,
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            close_timeout_ms: 2_000,
            outbound_queue: 64,
        }
    }
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint.url is empty".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "endpoint.heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "endpoint.heartbeat_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "endpoint.outbound_queue must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub frame_ms: u32,
    pub resample_quality: ResampleQuality,
    /// Frames buffered between the device callback and the capture pump.
    pub queue_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_ms: 40,
            resample_quality: ResampleQuality::Linear,
            queue_frames: 8,
        }
    }
}

impl CaptureConfig {
    pub fn frame_samples(&self, sample_rate_hz: u32) -> usize {
        ((sample_rate_hz as u64 * self.frame_ms as u64) / 1000).max(1) as usize
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    /// Rate of outbound (microphone) audio on the wire.
    pub input_sample_rate_hz: u32,
    /// Rate of inbound (synthesized) audio on the wire.
    pub output_sample_rate_hz: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate_hz: DEFAULT_INPUT_SAMPLE_RATE_HZ,
            output_sample_rate_hz: DEFAULT_OUTPUT_SAMPLE_RATE_HZ,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PlaybackConfig {
    /// How far ahead of its start time a queued entry is handed to the device.
    pub lookahead_ms: u64,
    pub drain_timeout_ms: u64,
    /// Capacity of the device ring buffer.
    pub max_buffer_ms: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 120,
            drain_timeout_ms: 3_000,
            max_buffer_ms: 10_000,
        }
    }
}

impl PlaybackConfig {
    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl SessionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks everything except the endpoint, which `connect()` receives
    /// separately.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.input_sample_rate_hz == 0 || self.audio.output_sample_rate_hz == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".to_string()));
        }
        if self.capture.frame_ms == 0 {
            return Err(ConfigError::Invalid("capture.frame_ms must be non-zero".to_string()));
        }
        if self.capture.queue_frames == 0 {
            return Err(ConfigError::Invalid(
                "capture.queue_frames must be non-zero".to_string(),
            ));
        }
        if self.playback.max_buffer_ms == 0 {
            return Err(ConfigError::Invalid(
                "playback.max_buffer_ms must be non-zero".to_string(),
            ));
        }
        #[cfg(not(feature = "hq-resample"))]
        if self.capture.resample_quality == ResampleQuality::High {
            return Err(ConfigError::Invalid(
                "capture.resample_quality = \"high\" needs the hq-resample feature".to_string(),
            ));
        }
        Ok(())
    }
}
