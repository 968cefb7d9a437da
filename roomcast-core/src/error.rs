use thiserror::Error;

use crate::negotiator::NegotiationState;
use crate::types::TrackKind;

/// Videoroom plugin error code for a create request naming an existing room
pub const ERROR_ROOM_EXISTS: i64 = 427;

/// Videoroom plugin error code for a subscription to an unknown feed
pub const ERROR_NO_SUCH_FEED: i64 = 428;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Room join failed: {0}")]
    RoomJoinFailed(String),

    #[error("{kind} device unavailable: {reason}")]
    DeviceUnavailable { kind: TrackKind, reason: String },

    #[error("Negotiation already in progress")]
    NegotiationInProgress,

    #[error("Unexpected answer in state {state:?}")]
    UnexpectedAnswer { state: NegotiationState },

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Plugin error {code}: {reason}")]
    Plugin { code: i64, reason: String },

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Session not started")]
    NotStarted,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("RTC error: {0}")]
    Rtc(String),
}

impl Error {
    #[must_use]
    pub const fn is_room_exists(&self) -> bool {
        matches!(self, Self::Plugin { code, .. } if *code == ERROR_ROOM_EXISTS)
    }

    #[must_use]
    pub const fn is_no_such_feed(&self) -> bool {
        matches!(self, Self::Plugin { code, .. } if *code == ERROR_NO_SUCH_FEED)
    }

    /// Protocol-sequencing errors: the operation is rejected, the session carries on
    #[must_use]
    pub const fn is_sequencing(&self) -> bool {
        matches!(self, Self::NegotiationInProgress | Self::UnexpectedAnswer { .. })
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Rtc(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
