//! Signaling: the videoroom message model, the channel seam and the Janus transport

pub mod channel;
pub mod janus;
pub mod protocol;

pub use channel::{PluginReply, SignalingChannel, SignalingConnector, SignalingEvent};
pub use janus::{JanusChannel, JanusConnector};
pub use protocol::{ParticipantType, Publisher, PublisherStream, VideoRoomEvent, VideoRoomRequest};
