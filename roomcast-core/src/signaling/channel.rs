use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::protocol::{VideoRoomEvent, VideoRoomRequest};
use crate::error::Result;
use crate::rtc::{IceCandidate, SessionDescription};
use crate::types::{HandleId, TrackKind};

/// Plugin answer to a request: its data and any attached session description
#[derive(Debug, Clone)]
pub struct PluginReply {
    pub data: Value,
    pub jsep: Option<SessionDescription>,
}

impl PluginReply {
    pub fn event(&self) -> Result<VideoRoomEvent> {
        VideoRoomEvent::parse(&self.data)
    }
}

/// Server-pushed notification not correlated with a pending request
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Asynchronous plugin event
    Message {
        handle: HandleId,
        data: Value,
        jsep: Option<SessionDescription>,
    },
    /// Remote candidate; `None` marks the end of the remote candidates
    Trickle {
        handle: HandleId,
        candidate: Option<IceCandidate>,
    },
    HangUp {
        handle: HandleId,
        reason: String,
    },
    WebRtcUp {
        handle: HandleId,
    },
    Media {
        handle: HandleId,
        kind: TrackKind,
        receiving: bool,
    },
    Detached {
        handle: HandleId,
    },
    /// The channel is gone; no further events follow
    Closed {
        reason: String,
    },
}

impl SignalingEvent {
    #[must_use]
    pub const fn handle(&self) -> Option<&HandleId> {
        match self {
            Self::Message { handle, .. }
            | Self::Trickle { handle, .. }
            | Self::HangUp { handle, .. }
            | Self::WebRtcUp { handle }
            | Self::Media { handle, .. }
            | Self::Detached { handle } => Some(handle),
            Self::Closed { .. } => None,
        }
    }
}

/// An open signaling session on the SFU
///
/// Every plugin request resolves exactly once, with the plugin's reply or an
/// error. Plugin-level rejections come back as [`crate::Error::Plugin`].
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Attach a new videoroom plugin handle
    async fn attach(&self) -> Result<HandleId>;

    async fn send(
        &self,
        handle: &HandleId,
        request: VideoRoomRequest,
        jsep: Option<SessionDescription>,
    ) -> Result<PluginReply>;

    /// Send a local candidate; `None` signals end of gathering
    async fn trickle(&self, handle: &HandleId, candidate: Option<IceCandidate>) -> Result<()>;

    async fn detach(&self, handle: &HandleId) -> Result<()>;

    /// Destroy the signaling session and close the transport. Idempotent.
    async fn close(&self);
}

/// Opens signaling channels
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        auth_token: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::UnboundedReceiver<SignalingEvent>)>;
}
