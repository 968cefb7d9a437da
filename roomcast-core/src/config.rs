//! Client configuration

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Top-level configuration for a roomcast participant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Signaling server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the Janus gateway
    pub server_url: String,
    /// Interval between session keepalives
    pub keepalive_interval_secs: u64,
    /// Upper bound on a single request round trip
    pub request_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8188/janus".to_string(),
            keepalive_interval_secs: 25,
            request_timeout_secs: 10,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// STUN/TURN server supplied to every peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// How a disabled outbound track is represented on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstitutionPolicy {
    /// Keep the device track and flip its enabled flag
    #[default]
    Disable,
    /// Swap in a generated blank/silent track and release the device
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub enabled: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            enabled: true,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConstraints {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 640,
            height: 480,
            frame_rate: 30,
        }
    }
}

/// Local capture request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: VideoConstraints,
}

/// Parameters of the blank-frame and silent-audio generators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Kept low; the frames only keep the sender's media flow alive
    pub frame_rate: u32,
    /// RGB fill colour
    pub color: [u8; 3],
    pub audio_sample_rate: u32,
    pub audio_frame_ms: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 5,
            color: [0, 0, 0],
            audio_sample_rate: 48_000,
            audio_frame_ms: 20,
        }
    }
}

/// Behaviour of one room session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
    /// Publisher slots requested when this client creates the room
    pub max_publishers: u32,
    /// Display name sent on join; generated when absent
    pub display_name: Option<String>,
    pub audio_policy: SubstitutionPolicy,
    pub video_policy: SubstitutionPolicy,
    /// Treat a remote stream that loses its last track as an unpublish
    pub implicit_leave_on_empty_stream: bool,
    pub negotiation_timeout_secs: u64,
    pub media: MediaConstraints,
    pub synthetic: SyntheticConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            max_publishers: 20,
            display_name: None,
            audio_policy: SubstitutionPolicy::Disable,
            video_policy: SubstitutionPolicy::Disable,
            implicit_leave_on_empty_stream: true,
            negotiation_timeout_secs: 15,
            media: MediaConstraints::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Configured display name, or a random `user-xxxx` one
    #[must_use]
    pub fn display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("user-{}", nanoid::nanoid!(6)))
    }
}

/// Log line layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event, for log collectors
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    /// Append to this file instead of writing to stdout
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMCAST_SIGNALING__SERVER_URL, ROOMCAST_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Collect configuration problems; empty when the config is usable
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.signaling.server_url.trim().is_empty() {
            errors.push("signaling.server_url must not be empty".to_string());
        }
        if self.signaling.request_timeout_secs == 0 {
            errors.push("signaling.request_timeout_secs must be positive".to_string());
        }
        if self.session.synthetic.frame_rate == 0 {
            errors.push("session.synthetic.frame_rate must be positive".to_string());
        }
        if self.session.synthetic.audio_frame_ms == 0 {
            errors.push("session.synthetic.audio_frame_ms must be positive".to_string());
        }
        if let Err(e) = crate::logging::parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        for (i, server) in self.session.ice_servers.iter().enumerate() {
            if server.urls.is_empty() {
                errors.push(format!("session.ice_servers[{i}] has no urls"));
            }
        }

        errors
    }
}
