//! Roomcast session core
//!
//! Joins a videoroom on a Janus SFU, publishes the local participant's
//! audio/video and keeps one subscriber connection per remote feed, driven by
//! the server's event stream.
//!
//! ## Architecture
//!
//! - **`SignalingSession`**: top-level state machine and control surface
//! - **`FeedRegistry`**: remote feeds, one worker task per feed
//! - **`PeerNegotiator`**: offer/answer/candidate exchange on one connection
//! - **`MediaSourceController`**: local capture and the synthetic sources
//! - **`TrackSubstitutionController`**: real/synthetic swaps on the live sender
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_core::{
//!     ClientConfig, JanusConnector, RoomId, SignalingSession, TestPatternDevices,
//!     WebRtcPeerFactory,
//! };
//!
//! let config = ClientConfig::load(None)?;
//! let session = SignalingSession::new(
//!     config.session,
//!     Arc::new(JanusConnector::new(config.signaling)),
//!     Arc::new(WebRtcPeerFactory::new()?),
//!     Arc::new(TestPatternDevices::new()),
//! );
//! session.start(RoomId::from(42u64), &token).await?;
//! session.toggle_local_video().await?;
//! ```

pub mod config;
pub mod error;
pub mod feeds;
pub mod logging;
pub mod media;
pub mod negotiator;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod substitution;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{ClientConfig, IceServer, SessionConfig, SignalingConfig, SubstitutionPolicy};
pub use error::{Error, Result};
pub use feeds::{FeedRegistry, FeedView};
pub use logging::init_logging;
pub use media::{
    LocalMedia, MediaDevices, MediaSourceController, MediaStream, MediaTrack, TestPatternDevices,
};
pub use negotiator::{NegotiationState, PeerNegotiator};
pub use rtc::WebRtcPeerFactory;
pub use session::{SessionEvent, SignalingSession};
pub use signaling::{JanusConnector, SignalingChannel, SignalingConnector};
pub use substitution::TrackSubstitutionController;
pub use types::{FeedId, HandleId, RoomId, TrackId, TrackKind};
