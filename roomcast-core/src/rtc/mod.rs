//! Peer connection abstraction
//!
//! The session core drives peer connections only through [`PeerConnection`]
//! and creates them through [`PeerConnectionFactory`]; [`webrtc`] holds the
//! production backend.

pub mod webrtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::IceServer;
use crate::error::Result;
use crate::media::MediaTrack;
use crate::types::{TrackId, TrackKind};

pub use self::webrtc::WebRtcPeerFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Session description in the `jsep` shape the signaling server expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub const fn is_offer(&self) -> bool {
        matches!(self.sdp_type, SdpType::Offer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Which side of the SFU exchange a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorRole {
    /// Sends local media; this side offers
    Publisher,
    /// Receives one remote feed; the SFU offers
    Subscriber,
}

impl fmt::Display for NegotiatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Subscriber => f.write_str("subscriber"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// The connection will not carry media again
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Media directions requested for an offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationConstraints {
    pub send_audio: bool,
    pub send_video: bool,
    pub receive_audio: bool,
    pub receive_video: bool,
    /// Emit candidates as they are gathered instead of embedding them in the SDP
    pub trickle: bool,
}

impl NegotiationConstraints {
    /// Send whatever is attached, receive nothing
    #[must_use]
    pub const fn publisher(send_audio: bool, send_video: bool) -> Self {
        Self {
            send_audio,
            send_video,
            receive_audio: false,
            receive_video: false,
            trickle: true,
        }
    }

    /// Receive both kinds, send nothing
    #[must_use]
    pub const fn subscriber() -> Self {
        Self {
            send_audio: false,
            send_video: false,
            receive_audio: true,
            receive_video: true,
            trickle: true,
        }
    }
}

/// Notifications raised by a peer connection backend
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A gathered local candidate; `None` marks the end of gathering
    LocalCandidate(Option<IceCandidate>),
    TrackAdded {
        track: Arc<MediaTrack>,
        mid: Option<String>,
    },
    TrackRemoved {
        track_id: TrackId,
    },
    ConnectionState(PeerConnectionState),
}

pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Media ids (`a=mid:` values) of an SDP body, in media-line order
#[must_use]
pub fn media_ids(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix("a=mid:"))
        .map(|mid| mid.trim().to_string())
        .collect()
}

/// One WebRTC peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach an outbound track as the sender for its kind
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()>;

    /// Swap the source of the `kind` sender without renegotiating
    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<()>;

    /// Create an offer and install it as the local description
    async fn create_offer(
        &self,
        constraints: &NegotiationConstraints,
    ) -> Result<SessionDescription>;

    /// Create an answer to the installed remote offer and install it locally
    async fn create_answer(
        &self,
        constraints: &NegotiationConstraints,
    ) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        role: NegotiatorRole,
        ice_servers: &[IceServer],
        on_event: PeerEventHandler,
    ) -> Result<Arc<dyn PeerConnection>>;
}
