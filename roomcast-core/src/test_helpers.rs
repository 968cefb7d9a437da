//! Scripted fakes for the signaling and peer-connection seams

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::IceServer;
use crate::error::{Error, Result, ERROR_NO_SUCH_FEED, ERROR_ROOM_EXISTS};
use crate::media::MediaTrack;
use crate::rtc::{
    IceCandidate, NegotiationConstraints, NegotiatorRole, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerEventHandler, SessionDescription,
};
use crate::signaling::{
    ParticipantType, PluginReply, SignalingChannel, SignalingConnector, SignalingEvent,
    VideoRoomRequest,
};
use crate::types::{FeedId, HandleId, TrackKind};

/// Participant id the fake server assigns to the local publisher
pub const PARTICIPANT_ID: u64 = 1001;

#[derive(Default)]
struct Senders {
    audio: Option<Arc<MediaTrack>>,
    video: Option<Arc<MediaTrack>>,
}

impl Senders {
    fn slot(&mut self, kind: TrackKind) -> &mut Option<Arc<MediaTrack>> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }
}

/// Peer connection that records what is done to it
pub struct FakePeerConnection {
    role: NegotiatorRole,
    handler: Mutex<Option<PeerEventHandler>>,
    calls: Mutex<Vec<String>>,
    senders: Mutex<Senders>,
    replaced: Mutex<Vec<Arc<MediaTrack>>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closes: AtomicUsize,
    /// Replacements made while the outgoing or incoming track was not live
    sender_gaps: AtomicUsize,
    fail_remote: AtomicBool,
}

impl FakePeerConnection {
    pub fn new(role: NegotiatorRole) -> Arc<Self> {
        Arc::new(Self {
            role,
            handler: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            senders: Mutex::new(Senders::default()),
            replaced: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            sender_gaps: AtomicUsize::new(0),
            fail_remote: AtomicBool::new(false),
        })
    }

    pub const fn offer_sdp() -> &'static str {
        "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=sendonly\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=sendonly\r\n"
    }

    pub const fn answer_sdp() -> &'static str {
        "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=recvonly\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=recvonly\r\n"
    }

    #[must_use]
    pub const fn role(&self) -> NegotiatorRole {
        self.role
    }

    fn set_handler(&self, handler: PeerEventHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Raise a backend event as the engine would
    pub fn emit(&self, event: PeerEvent) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Track currently feeding the `kind` sender
    pub fn sender(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.senders.lock().slot(kind).clone()
    }

    pub fn replaced_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.replaced.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn sender_gaps(&self) -> usize {
        self.sender_gaps.load(Ordering::SeqCst)
    }

    pub fn fail_next_remote_description(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        let kind = track.kind();
        self.record(format!("add_track:{kind}"));
        *self.senders.lock().slot(kind) = Some(track);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<()> {
        self.record(format!("replace_track:{kind}"));
        let mut senders = self.senders.lock();
        let slot = senders.slot(kind);
        let Some(previous) = slot.as_ref() else {
            return Err(Error::Rtc(format!("no {kind} sender")));
        };
        if previous.is_ended() || track.is_ended() {
            self.sender_gaps.fetch_add(1, Ordering::SeqCst);
        }
        *slot = Some(Arc::clone(&track));
        self.replaced.lock().push(track);
        Ok(())
    }

    async fn create_offer(
        &self,
        _constraints: &NegotiationConstraints,
    ) -> Result<SessionDescription> {
        self.record("create_offer");
        Ok(SessionDescription::offer(Self::offer_sdp()))
    }

    async fn create_answer(
        &self,
        _constraints: &NegotiationConstraints,
    ) -> Result<SessionDescription> {
        self.record("create_answer");
        Ok(SessionDescription::answer(Self::answer_sdp()))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(format!("set_remote:{}", description.sdp_type.as_str()));
        if self.fail_remote.swap(false, Ordering::SeqCst) {
            return Err(Error::Rtc("remote description rejected".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record("add_ice_candidate");
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory keeping every connection it created
#[derive(Default)]
pub struct FakePeerFactory {
    connections: Mutex<Vec<Arc<FakePeerConnection>>>,
    fail_publisher_answer: AtomicBool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publisher connections created from now on reject the remote answer
    pub fn fail_publisher_answers(&self) {
        self.fail_publisher_answer.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakePeerConnection>> {
        self.connections.lock().clone()
    }

    pub fn publisher(&self) -> Option<Arc<FakePeerConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.role() == NegotiatorRole::Publisher)
            .cloned()
    }

    pub fn subscribers(&self) -> Vec<Arc<FakePeerConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.role() == NegotiatorRole::Subscriber)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        role: NegotiatorRole,
        _ice_servers: &[IceServer],
        on_event: PeerEventHandler,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = FakePeerConnection::new(role);
        connection.set_handler(on_event);
        if role == NegotiatorRole::Publisher && self.fail_publisher_answer.load(Ordering::SeqCst) {
            connection.fail_next_remote_description();
        }
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }
}

/// A request as the fake server received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub handle: HandleId,
    pub request: VideoRoomRequest,
    pub jsep: Option<SessionDescription>,
}

#[derive(Default)]
struct ServerState {
    requests: Mutex<Vec<RecordedRequest>>,
    trickles: Mutex<Vec<(HandleId, Option<IceCandidate>)>>,
    attached: Mutex<Vec<HandleId>>,
    detached: Mutex<Vec<HandleId>>,
    missing_feeds: Mutex<HashSet<FeedId>>,
    publishers: Mutex<Vec<Value>>,
    events: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    tokens: Mutex<Vec<String>>,
    next_handle: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    room_exists: AtomicBool,
    create_fails: AtomicBool,
    reject_join: AtomicBool,
    unreachable: AtomicBool,
    stall_connect: AtomicBool,
    withhold_publish_answer: AtomicBool,
    async_publish_answer: AtomicBool,
    attach_gate: Mutex<Option<CancellationToken>>,
    detach_gate: Mutex<Option<CancellationToken>>,
}

/// Scripted videoroom server, acting as both connector and channel
#[derive(Clone, Default)]
pub struct FakeSignaling {
    state: Arc<ServerState>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        let signaling = Self::default();
        signaling.state.next_handle.store(100, Ordering::SeqCst);
        signaling
    }

    pub fn set_room_exists(&self) {
        self.state.room_exists.store(true, Ordering::SeqCst);
    }

    /// Create fails with an error other than "room exists"
    pub fn set_create_fails(&self) {
        self.state.create_fails.store(true, Ordering::SeqCst);
    }

    pub fn set_reject_join(&self) {
        self.state.reject_join.store(true, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self) {
        self.state.unreachable.store(true, Ordering::SeqCst);
    }

    /// `connect` never completes
    pub fn set_stall_connect(&self) {
        self.state.stall_connect.store(true, Ordering::SeqCst);
    }

    /// `publish` never gets a reply
    pub fn set_withhold_publish_answer(&self) {
        self.state.withhold_publish_answer.store(true, Ordering::SeqCst);
    }

    /// `publish` replies without a jsep; the answer comes later as an event
    pub fn set_async_publish_answer(&self) {
        self.state.async_publish_answer.store(true, Ordering::SeqCst);
    }

    /// Attach requests wait until the returned token is cancelled
    pub fn hold_attaches(&self) -> CancellationToken {
        let gate = CancellationToken::new();
        *self.state.attach_gate.lock() = Some(gate.clone());
        gate
    }

    /// Detach requests wait until the returned token is cancelled
    pub fn hold_detaches(&self) -> CancellationToken {
        let gate = CancellationToken::new();
        *self.state.detach_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn set_missing_feed(&self, feed: FeedId) {
        self.state.missing_feeds.lock().insert(feed);
    }

    /// Feeds listed in the publisher's `joined` reply
    pub fn set_initial_publishers(&self, feeds: &[u64]) {
        *self.state.publishers.lock() = feeds
            .iter()
            .map(|id| json!({"id": id, "display": format!("user-{id}")}))
            .collect();
    }

    /// Push a server event to the connected session
    pub fn push(&self, event: SignalingEvent) -> bool {
        self.state
            .events
            .lock()
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    /// Push a videoroom event on the publisher handle
    pub fn push_publisher_event(&self, data: Value) -> bool {
        match self.publisher_handle() {
            Some(handle) => self.push(SignalingEvent::Message { handle, data, jsep: None }),
            None => false,
        }
    }

    /// Announce new publishers on the publisher handle
    pub fn announce(&self, feeds: &[u64]) -> bool {
        let publishers: Vec<Value> = feeds.iter().map(|id| json!({"id": id})).collect();
        let data = json!({"videoroom": "event", "room": 42, "publishers": publishers});
        self.push_publisher_event(data)
    }

    /// Deliver the publisher's answer as an unsolicited event
    pub fn push_publisher_answer(&self) -> bool {
        match self.publisher_handle() {
            Some(handle) => self.push(SignalingEvent::Message {
                handle,
                data: json!({"videoroom": "event", "room": 42, "configured": "ok"}),
                jsep: Some(SessionDescription::answer(FakePeerConnection::answer_sdp())),
            }),
            None => false,
        }
    }

    pub fn lose_connection(&self, reason: &str) -> bool {
        self.push(SignalingEvent::Closed {
            reason: reason.to_string(),
        })
    }

    pub fn publisher_handle(&self) -> Option<HandleId> {
        self.state.attached.lock().first().cloned()
    }

    pub fn attached(&self) -> Vec<HandleId> {
        self.state.attached.lock().clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub fn request_names(&self) -> Vec<&'static str> {
        self.state.requests.lock().iter().map(|r| r.request.name()).collect()
    }

    pub fn configures(&self) -> Vec<(Option<bool>, Option<bool>)> {
        self.state
            .requests
            .lock()
            .iter()
            .filter_map(|r| match r.request {
                VideoRoomRequest::Configure { audio, video } => Some((audio, video)),
                _ => None,
            })
            .collect()
    }

    pub fn subscriber_joins(&self) -> Vec<FeedId> {
        self.state
            .requests
            .lock()
            .iter()
            .filter_map(|r| match &r.request {
                VideoRoomRequest::Join {
                    ptype: ParticipantType::Subscriber,
                    feed: Some(feed),
                    ..
                } => Some(feed.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn handle_for_feed(&self, feed: &FeedId) -> Option<HandleId> {
        self.state
            .requests
            .lock()
            .iter()
            .find(|r| {
                matches!(&r.request, VideoRoomRequest::Join { feed: Some(f), .. } if f == feed)
            })
            .map(|r| r.handle.clone())
    }

    pub fn trickles(&self) -> Vec<(HandleId, Option<IceCandidate>)> {
        self.state.trickles.lock().clone()
    }

    pub fn detached(&self) -> Vec<HandleId> {
        self.state.detached.lock().clone()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    fn reply(&self, request: &VideoRoomRequest) -> Result<PluginReply> {
        let state = &self.state;
        let ok = |data: Value| PluginReply { data, jsep: None };

        match request {
            VideoRoomRequest::Create { room, .. } => {
                if state.room_exists.load(Ordering::SeqCst) {
                    return Err(Error::Plugin {
                        code: ERROR_ROOM_EXISTS,
                        reason: format!("Room {room} already exists"),
                    });
                }
                if state.create_fails.load(Ordering::SeqCst) {
                    return Err(Error::Plugin {
                        code: 403,
                        reason: "Unauthorized (not an admin)".to_string(),
                    });
                }
                state.room_exists.store(true, Ordering::SeqCst);
                Ok(ok(json!({"videoroom": "created", "room": room})))
            }
            VideoRoomRequest::Join {
                room,
                ptype: ParticipantType::Publisher,
                ..
            } => {
                if state.reject_join.load(Ordering::SeqCst) {
                    return Err(Error::Plugin {
                        code: 426,
                        reason: format!("No such room ({room})"),
                    });
                }
                let publishers = state.publishers.lock().clone();
                Ok(ok(json!({
                    "videoroom": "joined",
                    "room": room,
                    "id": PARTICIPANT_ID,
                    "publishers": publishers,
                })))
            }
            VideoRoomRequest::Join {
                room,
                ptype: ParticipantType::Subscriber,
                feed,
                ..
            } => {
                if let Some(feed) = feed {
                    if state.missing_feeds.lock().contains(feed) {
                        return Err(Error::Plugin {
                            code: ERROR_NO_SUCH_FEED,
                            reason: format!("No such feed ({feed})"),
                        });
                    }
                }
                Ok(PluginReply {
                    data: json!({"videoroom": "attached", "room": room, "id": feed}),
                    jsep: Some(SessionDescription::offer(FakePeerConnection::offer_sdp())),
                })
            }
            VideoRoomRequest::Publish { .. } => Ok(PluginReply {
                data: json!({"videoroom": "event", "room": 42, "configured": "ok"}),
                jsep: (!state.async_publish_answer.load(Ordering::SeqCst))
                    .then(|| SessionDescription::answer(FakePeerConnection::answer_sdp())),
            }),
            VideoRoomRequest::Configure { .. } => {
                Ok(ok(json!({"videoroom": "event", "configured": "ok"})))
            }
            VideoRoomRequest::Start { .. } => {
                Ok(ok(json!({"videoroom": "event", "started": "ok"})))
            }
            VideoRoomRequest::Leave => Ok(ok(json!({"videoroom": "event", "leaving": "ok"}))),
        }
    }
}

#[async_trait]
impl SignalingConnector for FakeSignaling {
    async fn connect(
        &self,
        auth_token: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::UnboundedReceiver<SignalingEvent>)> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.state.tokens.lock().push(auth_token.to_string());
        if self.state.stall_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(Error::SignalingUnavailable("connection refused".to_string()));
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        *self.state.events.lock() = Some(events);
        Ok((Arc::new(self.clone()), events_rx))
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn attach(&self) -> Result<HandleId> {
        let gate = self.state.attach_gate.lock().clone();
        if let Some(gate) = gate {
            gate.cancelled().await;
        }
        let handle = HandleId::from(self.state.next_handle.fetch_add(1, Ordering::SeqCst));
        self.state.attached.lock().push(handle.clone());
        Ok(handle)
    }

    async fn send(
        &self,
        handle: &HandleId,
        request: VideoRoomRequest,
        jsep: Option<SessionDescription>,
    ) -> Result<PluginReply> {
        self.state.requests.lock().push(RecordedRequest {
            handle: handle.clone(),
            request: request.clone(),
            jsep,
        });
        if matches!(request, VideoRoomRequest::Publish { .. })
            && self.state.withhold_publish_answer.load(Ordering::SeqCst)
        {
            std::future::pending::<()>().await;
        }
        self.reply(&request)
    }

    async fn trickle(&self, handle: &HandleId, candidate: Option<IceCandidate>) -> Result<()> {
        self.state.trickles.lock().push((handle.clone(), candidate));
        Ok(())
    }

    async fn detach(&self, handle: &HandleId) -> Result<()> {
        let gate = self.state.detach_gate.lock().clone();
        if let Some(gate) = gate {
            gate.cancelled().await;
        }
        self.state.detached.lock().push(handle.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.events.lock().take();
    }
}
