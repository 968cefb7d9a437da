//! Videoroom plugin messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{FeedId, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Publisher,
    Subscriber,
}

/// Request body sent to the videoroom plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum VideoRoomRequest {
    Create {
        room: RoomId,
        description: String,
        publishers: u32,
    },
    Join {
        room: RoomId,
        ptype: ParticipantType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feed: Option<FeedId>,
    },
    Publish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video: Option<bool>,
    },
    Configure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video: Option<bool>,
    },
    Start {
        room: RoomId,
    },
    Leave,
}

impl VideoRoomRequest {
    pub fn create(room: &RoomId, publishers: u32) -> Self {
        Self::Create {
            room: room.clone(),
            description: format!("Room {room}"),
            publishers,
        }
    }

    pub fn join_publisher(room: &RoomId, display: impl Into<String>) -> Self {
        Self::Join {
            room: room.clone(),
            ptype: ParticipantType::Publisher,
            display: Some(display.into()),
            feed: None,
        }
    }

    pub fn join_subscriber(room: &RoomId, feed: &FeedId) -> Self {
        Self::Join {
            room: room.clone(),
            ptype: ParticipantType::Subscriber,
            display: None,
            feed: Some(feed.clone()),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Join { .. } => "join",
            Self::Publish { .. } => "publish",
            Self::Configure { .. } => "configure",
            Self::Start { .. } => "start",
            Self::Leave => "leave",
        }
    }
}

/// One media stream advertised by a publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStream {
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(default)]
    pub mid: Option<Value>,
}

/// Entry of a `publishers` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub id: FeedId,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub streams: Vec<PublisherStream>,
}

impl Publisher {
    /// Mids of the feed's audio and video streams; `["0", "1"]` when the
    /// server does not advertise any
    #[must_use]
    pub fn mids(&self) -> Vec<String> {
        let mids: Vec<String> = self
            .streams
            .iter()
            .filter(|s| s.media_type == "audio" || s.media_type == "video")
            .filter_map(|s| match s.mid.as_ref()? {
                Value::String(mid) => Some(mid.clone()),
                Value::Number(mid) => Some(mid.to_string()),
                _ => None,
            })
            .collect();

        if mids.is_empty() {
            vec!["0".to_string(), "1".to_string()]
        } else {
            mids
        }
    }
}

/// Plugin data pushed by the videoroom, classified by its `videoroom` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoRoomEvent {
    Joined {
        participant_id: FeedId,
        publishers: Vec<Publisher>,
    },
    /// Subscriber handle bound to a feed
    Attached { feed: Option<FeedId> },
    Event {
        publishers: Option<Vec<Publisher>>,
        unpublished: Option<FeedId>,
        leaving: Option<FeedId>,
        error_code: Option<i64>,
        error: Option<String>,
    },
    Created { room: Option<RoomId> },
    Other(String),
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    videoroom: Option<String>,
    #[serde(default)]
    id: Option<FeedId>,
    #[serde(default)]
    room: Option<RoomId>,
    #[serde(default)]
    publishers: Option<Vec<Publisher>>,
    #[serde(default)]
    unpublished: Option<Value>,
    #[serde(default)]
    leaving: Option<Value>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

/// `unpublished`/`leaving` carry either a feed id or `"ok"` for our own departure
fn departed_feed(value: Option<Value>) -> Result<Option<FeedId>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s == "ok" => Ok(None),
        Some(other) => Ok(Some(serde_json::from_value(other)?)),
    }
}

impl VideoRoomEvent {
    pub fn parse(data: &Value) -> Result<Self> {
        let raw: RawEvent = serde_json::from_value(data.clone())?;
        let kind = raw.videoroom.unwrap_or_default();

        Ok(match kind.as_str() {
            "joined" => Self::Joined {
                participant_id: raw
                    .id
                    .ok_or_else(|| Error::Signaling("joined event without id".to_string()))?,
                publishers: raw.publishers.unwrap_or_default(),
            },
            "attached" => Self::Attached { feed: raw.id },
            "event" => Self::Event {
                publishers: raw.publishers,
                unpublished: departed_feed(raw.unpublished)?,
                leaving: departed_feed(raw.leaving)?,
                error_code: raw.error_code,
                error: raw.error,
            },
            "created" => Self::Created { room: raw.room },
            _ => Self::Other(kind),
        })
    }

    /// Feed that announced its departure, if any
    #[must_use]
    pub fn departed(&self) -> Option<&FeedId> {
        match self {
            Self::Event {
                unpublished, leaving, ..
            } => unpublished.as_ref().or(leaving.as_ref()),
            _ => None,
        }
    }
}
