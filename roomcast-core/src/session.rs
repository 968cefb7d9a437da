//! Room session: join, publish, feed discovery and the user control surface

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::feeds::{FeedContext, FeedRegistry, FeedView};
use crate::media::{LocalMedia, MediaDevices, MediaSourceController, MediaStream};
use crate::negotiator::{NegotiationState, PeerNegotiator};
use crate::rtc::{
    NegotiationConstraints, NegotiatorRole, PeerConnectionFactory, PeerEvent, PeerEventHandler,
    SessionDescription,
};
use crate::signaling::{
    Publisher, SignalingChannel, SignalingConnector, SignalingEvent, VideoRoomEvent,
    VideoRoomRequest,
};
use crate::substitution::TrackSubstitutionController;
use crate::types::{FeedId, HandleId, RoomId, TrackKind};

/// Capacity of the session event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on the farewell `leave` request during a graceful stop
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Notifications about session state, for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { participant_id: FeedId },
    FeedsChanged,
    LocalMediaChanged,
    /// The publisher connection is gone; the session continues receive-only
    PublisherFailed { reason: String },
    /// The signaling channel dropped; the session has torn itself down
    SignalingLost { reason: String },
    Stopped,
}

/// Resources of one started (or starting) session
struct ActiveSession {
    room: RoomId,
    channel: Arc<dyn SignalingChannel>,
    participant_id: OnceLock<FeedId>,
    publisher_handle: OnceLock<HandleId>,
    publisher: Mutex<Option<Arc<PeerNegotiator>>>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    cancel: CancellationToken,
    lost: Mutex<Option<String>>,
    torn_down: AtomicBool,
}

impl ActiveSession {
    fn publisher(&self) -> Option<Arc<PeerNegotiator>> {
        self.publisher.lock().clone()
    }
}

enum Lifecycle {
    Idle,
    Starting(CancellationToken),
    Running(Arc<ActiveSession>),
}

struct SessionInner {
    config: SessionConfig,
    connector: Arc<dyn SignalingConnector>,
    peers: Arc<dyn PeerConnectionFactory>,
    media: Arc<MediaSourceController>,
    substitution: TrackSubstitutionController,
    feeds: Arc<FeedRegistry>,
    lifecycle: Mutex<Lifecycle>,
    /// Serialises `start` calls; `stop` takes it to wait out a cancelled start
    start_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

/// One participant's session in a videoroom
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct SignalingSession {
    inner: Arc<SessionInner>,
}

impl SignalingSession {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn SignalingConnector>,
        peers: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let media = Arc::new(MediaSourceController::new(
            devices,
            config.media.clone(),
            config.synthetic.clone(),
        ));
        let substitution = TrackSubstitutionController::new(
            Arc::clone(&media),
            config.audio_policy,
            config.video_policy,
        );
        let feeds = FeedRegistry::new(config.implicit_leave_on_empty_stream);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                peers,
                media,
                substitution,
                feeds,
                lifecycle: Mutex::new(Lifecycle::Idle),
                start_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Join `room`, creating it if needed, and publish local media.
    ///
    /// A no-op once started. Local media or publisher failures leave the
    /// session running without publishing; signaling and join failures
    /// release everything and return the error.
    pub async fn start(&self, room: RoomId, auth_token: &str) -> Result<()> {
        self.inner.start(room, auth_token).await
    }

    /// Leave the room and release every resource. Safe to call in any state.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Returns the new audio enablement
    pub async fn toggle_local_audio(&self) -> Result<bool> {
        self.inner.toggle_local(TrackKind::Audio).await
    }

    /// Returns the new video enablement
    pub async fn toggle_local_video(&self) -> Result<bool> {
        self.inner.toggle_local(TrackKind::Video).await
    }

    /// Flip playback of all remote audio, including feeds that join later.
    /// Returns the new mute flag.
    pub fn toggle_remote_mute_all(&self) -> bool {
        let muted = !self.inner.feeds.remote_muted();
        self.inner.feeds.set_remote_muted(muted);
        info!(muted, "Remote audio mute toggled");
        muted
    }

    #[must_use]
    pub fn participant_id(&self) -> Option<FeedId> {
        self.inner.running().and_then(|active| active.participant_id.get().cloned())
    }

    /// Local preview stream
    #[must_use]
    pub fn local_tracks(&self) -> MediaStream {
        self.inner.substitution.preview()
    }

    /// Remote feeds in discovery order
    #[must_use]
    pub fn remote_feeds(&self) -> Arc<[FeedView]> {
        self.inner.feeds.snapshot()
    }

    #[must_use]
    pub fn watch_feeds(&self) -> watch::Receiver<Arc<[FeedView]>> {
        self.inner.feeds.watch()
    }

    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.inner.substitution.enabled(TrackKind::Audio)
    }

    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.inner.substitution.enabled(TrackKind::Video)
    }

    #[must_use]
    pub fn remote_muted(&self) -> bool {
        self.inner.feeds.remote_muted()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.running().is_some()
    }

    /// Whether a publisher connection is up
    #[must_use]
    pub fn publishing(&self) -> bool {
        self.inner
            .running()
            .is_some_and(|active| active.publisher().is_some())
    }

    #[must_use]
    pub fn publisher_state(&self) -> Option<NegotiationState> {
        self.inner
            .running()
            .and_then(|active| active.publisher())
            .map(|publisher| publisher.state())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }
}

impl SessionInner {
    fn running(&self) -> Option<Arc<ActiveSession>> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(active) => Some(Arc::clone(active)),
            _ => None,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn start(self: &Arc<Self>, room: RoomId, auth_token: &str) -> Result<()> {
        let _guard = self.start_lock.lock().await;

        let cancel = {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Idle) {
                debug!(room = %room, "Session already started");
                return Ok(());
            }
            let cancel = CancellationToken::new();
            *lifecycle = Lifecycle::Starting(cancel.clone());
            cancel
        };

        info!(room = %room, "Starting session");
        let mut slot = None;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            outcome = self.establish(&room, auth_token, &cancel, &mut slot) => outcome,
        };

        let outcome = outcome.and_then(|()| {
            let mut lifecycle = self.lifecycle.lock();
            match &slot {
                Some(active) if !cancel.is_cancelled() => {
                    *lifecycle = Lifecycle::Running(Arc::clone(active));
                    Ok(Arc::clone(active))
                }
                _ => Err(Error::Cancelled),
            }
        });

        match outcome {
            Ok(active) => {
                let participant_id =
                    active.participant_id.get().cloned().unwrap_or_else(|| FeedId::new(""));
                info!(
                    room = %room,
                    participant_id = %participant_id,
                    publishing = active.publisher().is_some(),
                    "Session started"
                );
                self.emit(SessionEvent::Started { participant_id });
                Ok(())
            }
            Err(e) => {
                let lost = slot.as_ref().and_then(|active| active.lost.lock().clone());
                let e = match (e, lost) {
                    (Error::Cancelled, Some(reason)) => Error::SignalingUnavailable(reason),
                    (e, _) => e,
                };
                warn!(room = %room, error = %e, "Session start failed");
                if let Some(active) = &slot {
                    self.teardown(active, false).await;
                }
                *self.lifecycle.lock() = Lifecycle::Idle;
                Err(e)
            }
        }
    }

    async fn establish(
        self: &Arc<Self>,
        room: &RoomId,
        auth_token: &str,
        cancel: &CancellationToken,
        slot: &mut Option<Arc<ActiveSession>>,
    ) -> Result<()> {
        let (channel, events) = self.connector.connect(auth_token).await.map_err(|e| match e {
            e @ Error::SignalingUnavailable(_) => e,
            other => Error::SignalingUnavailable(other.to_string()),
        })?;

        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let active = Arc::new(ActiveSession {
            room: room.clone(),
            channel,
            participant_id: OnceLock::new(),
            publisher_handle: OnceLock::new(),
            publisher: Mutex::new(None),
            peer_events,
            cancel: cancel.clone(),
            lost: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });
        *slot = Some(Arc::clone(&active));
        tokio::spawn(Arc::clone(self).run_events(Arc::clone(&active), events, peer_rx));

        let handle = active
            .channel
            .attach()
            .await
            .map_err(|e| Error::SignalingUnavailable(format!("attach failed: {e}")))?;
        let _ = active.publisher_handle.set(handle.clone());

        self.feeds.bind(FeedContext {
            room: room.clone(),
            channel: Arc::clone(&active.channel),
            peers: Arc::clone(&self.peers),
            ice_servers: Arc::from(self.config.ice_servers.clone()),
            negotiation_timeout: self.config.negotiation_timeout(),
        });

        let create = VideoRoomRequest::create(room, self.config.max_publishers);
        match active.channel.send(&handle, create, None).await {
            Ok(_) => info!(room = %room, "Room created"),
            Err(e) if e.is_room_exists() => debug!(room = %room, "Room already exists"),
            Err(e) => warn!(room = %room, error = %e, "Room create failed, joining anyway"),
        }

        let join = VideoRoomRequest::join_publisher(room, self.config.display_name());
        let reply = active
            .channel
            .send(&handle, join, None)
            .await
            .map_err(|e| Error::RoomJoinFailed(e.to_string()))?;
        let publishers = match reply.event() {
            Ok(VideoRoomEvent::Joined {
                participant_id,
                publishers,
            }) => {
                info!(
                    room = %room,
                    participant_id = %participant_id,
                    publishers = publishers.len(),
                    "Joined room"
                );
                let _ = active.participant_id.set(participant_id);
                publishers
            }
            Ok(other) => {
                let reason = format!("unexpected join reply: {other:?}");
                return Err(Error::RoomJoinFailed(reason));
            }
            Err(e) => return Err(Error::RoomJoinFailed(e.to_string())),
        };
        for publisher in publishers {
            self.ensure_remote(&active, publisher);
        }

        let Some(local) = self.acquire_local_media().await else {
            return Ok(());
        };
        if !cancel.is_cancelled() {
            let deadline = Instant::now() + self.config.negotiation_timeout();
            match self.publish(&active, &handle, &local, deadline).await {
                Ok(()) => self.expect_publisher_answer(&active, deadline),
                Err(e) => self.publisher_failed(&active, e.to_string()).await,
            }
        }
        Ok(())
    }

    async fn acquire_local_media(&self) -> Option<LocalMedia> {
        let constraints = &self.config.media;
        if !constraints.audio.enabled && !constraints.video.enabled {
            info!("No local media requested, joining receive-only");
            return None;
        }
        match self.media.acquire_local_media(constraints).await {
            Ok(local) => {
                self.substitution.install_local(&local).await;
                self.emit(SessionEvent::LocalMediaChanged);
                Some(local)
            }
            Err(e) => {
                warn!(error = %e, "No local media, continuing signaling-only");
                None
            }
        }
    }

    /// Run the publisher offer/answer cycle
    async fn publish(
        &self,
        active: &ActiveSession,
        handle: &HandleId,
        local: &LocalMedia,
        deadline: Instant,
    ) -> Result<()> {
        let peer_events = active.peer_events.clone();
        let on_event: PeerEventHandler = Arc::new(move |event| {
            let _ = peer_events.send(event);
        });
        let connection = self
            .peers
            .create(NegotiatorRole::Publisher, &self.config.ice_servers, on_event)
            .await?;
        let negotiator = Arc::new(PeerNegotiator::new(NegotiatorRole::Publisher, connection));
        *active.publisher.lock() = Some(Arc::clone(&negotiator));

        for track in local.tracks() {
            negotiator.add_outbound_track(Arc::clone(track)).await?;
        }

        let constraints =
            NegotiationConstraints::publisher(local.audio.is_some(), local.video.is_some());
        let request = VideoRoomRequest::Publish {
            audio: Some(local.audio.is_some() && self.substitution.enabled(TrackKind::Audio)),
            video: Some(local.video.is_some() && self.substitution.enabled(TrackKind::Video)),
        };
        let round_trip = async {
            let offer = negotiator.create_offer(&constraints).await?;
            negotiator.offer_sent()?;
            let reply = active.channel.send(handle, request, Some(offer)).await?;
            match reply.jsep {
                Some(answer) => negotiator.apply_remote_answer(answer).await,
                None => {
                    debug!("Publish acknowledged, answer to follow");
                    Ok(())
                }
            }
        };

        tokio::time::timeout_at(deadline, round_trip)
            .await
            .map_err(|_| Error::NegotiationFailed("publish timed out".to_string()))??;
        info!(state = ?negotiator.state(), "Publishing local media");
        Ok(())
    }

    /// An answer still owed after `publish` must arrive by `deadline`
    fn expect_publisher_answer(self: &Arc<Self>, active: &Arc<ActiveSession>, deadline: Instant) {
        let Some(publisher) = active.publisher() else {
            return;
        };
        if publisher.state() != NegotiationState::OfferSent {
            return;
        }

        let inner = Arc::clone(self);
        let active = Arc::clone(active);
        tokio::spawn(async move {
            tokio::select! {
                () = active.cancel.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    let pending = active.publisher().is_some_and(|current| {
                        Arc::ptr_eq(&current, &publisher)
                            && current.state() == NegotiationState::OfferSent
                    });
                    if pending {
                        let reason = "publisher answer timed out".to_string();
                        inner.publisher_failed(&active, reason).await;
                    }
                }
            }
        });
    }

    /// Drop the publisher and carry on receive-only
    async fn publisher_failed(&self, active: &ActiveSession, reason: String) {
        let Some(publisher) = active.publisher.lock().take() else {
            return;
        };
        warn!(reason = %reason, "Publisher failed, continuing receive-only");
        publisher.close().await;
        self.emit(SessionEvent::PublisherFailed { reason });
    }

    fn ensure_remote(&self, active: &ActiveSession, publisher: Publisher) {
        if active.participant_id.get() == Some(&publisher.id) {
            return;
        }
        let mids = publisher.mids();
        if let Err(e) = self.feeds.ensure_feed(publisher.id.clone(), mids, publisher.display) {
            debug!(feed_id = %publisher.id, error = %e, "Feed not tracked");
        }
    }

    async fn run_events(
        self: Arc<Self>,
        active: Arc<ActiveSession>,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let mut feeds = self.feeds.watch();
        loop {
            tokio::select! {
                biased;
                () = active.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(SignalingEvent::Closed { reason }) => {
                        self.signaling_lost(&active, reason).await;
                        break;
                    }
                    Some(event) => self.dispatch(&active, event).await,
                    None => {
                        self.signaling_lost(&active, "signaling channel dropped".to_string()).await;
                        break;
                    }
                },
                Some(event) = peer_events.recv() => self.on_publisher_peer(&active, event).await,
                Ok(()) = feeds.changed() => self.emit(SessionEvent::FeedsChanged),
            }
        }
        debug!(room = %active.room, "Session event loop finished");
    }

    async fn dispatch(&self, active: &ActiveSession, event: SignalingEvent) {
        let Some(handle) = event.handle().cloned() else {
            return;
        };
        if active.publisher_handle.get() == Some(&handle) {
            self.on_publisher_signal(active, event).await;
        } else if !self.feeds.route_signal(&handle, event) {
            debug!(handle_id = %handle, "Event for unknown handle ignored");
        }
    }

    async fn on_publisher_signal(&self, active: &ActiveSession, event: SignalingEvent) {
        match event {
            SignalingEvent::Message { data, jsep, .. } => {
                match VideoRoomEvent::parse(&data) {
                    Ok(event) => self.on_room_event(active, event),
                    Err(e) => warn!(error = %e, "Unparseable room event"),
                }
                if let Some(answer) = jsep.filter(|jsep| !jsep.is_offer()) {
                    self.apply_publisher_answer(active, answer).await;
                }
            }
            SignalingEvent::Trickle {
                candidate: Some(candidate),
                ..
            } => {
                if let Some(publisher) = active.publisher() {
                    if let Err(e) = publisher.add_ice_candidate(candidate).await {
                        warn!(error = %e, "Publisher candidate rejected");
                    }
                }
            }
            SignalingEvent::Trickle { candidate: None, .. } => debug!("Remote candidates complete"),
            SignalingEvent::HangUp { reason, .. } => {
                self.publisher_failed(active, format!("hang-up: {reason}")).await;
            }
            SignalingEvent::Detached { .. } => {
                self.publisher_failed(active, "publisher handle detached".to_string()).await;
            }
            SignalingEvent::WebRtcUp { .. } => info!("Publisher media path up"),
            SignalingEvent::Media { kind, receiving, .. } => {
                debug!(kind = %kind, receiving, "Server media state");
            }
            SignalingEvent::Closed { .. } => {}
        }
    }

    fn on_room_event(&self, active: &ActiveSession, event: VideoRoomEvent) {
        if let Some(feed_id) = event.departed() {
            if !self.feeds.spawn_teardown(feed_id) {
                debug!(feed_id = %feed_id, "Departure of unknown feed ignored");
            }
        }
        if let VideoRoomEvent::Event {
            publishers,
            error_code,
            error,
            ..
        } = event
        {
            if let Some(code) = error_code {
                warn!(code, reason = ?error, "Room error event");
            }
            for publisher in publishers.unwrap_or_default() {
                self.ensure_remote(active, publisher);
            }
        }
    }

    async fn apply_publisher_answer(&self, active: &ActiveSession, answer: SessionDescription) {
        let Some(publisher) = active.publisher() else {
            debug!("Answer without a publisher ignored");
            return;
        };
        match publisher.apply_remote_answer(answer).await {
            Ok(()) => {}
            Err(e) if e.is_sequencing() => warn!(error = %e, "Ignoring publisher answer"),
            Err(e) => self.publisher_failed(active, e.to_string()).await,
        }
    }

    async fn on_publisher_peer(&self, active: &ActiveSession, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(handle) = active.publisher_handle.get() {
                    if let Err(e) = active.channel.trickle(handle, candidate).await {
                        debug!(error = %e, "Publisher trickle failed");
                    }
                }
            }
            PeerEvent::ConnectionState(state) if state.is_terminal() => {
                self.publisher_failed(active, format!("publisher connection {state:?}")).await;
            }
            PeerEvent::ConnectionState(state) => {
                debug!(state = ?state, "Publisher connection state");
            }
            PeerEvent::TrackAdded { .. } | PeerEvent::TrackRemoved { .. } => {}
        }
    }

    async fn toggle_local(&self, kind: TrackKind) -> Result<bool> {
        let active = self.running().ok_or(Error::NotStarted)?;
        let publisher = active.publisher();
        let enabled = self.substitution.toggle(kind, publisher.as_deref()).await?;
        self.emit(SessionEvent::LocalMediaChanged);

        if let (Some(_), Some(handle)) = (&publisher, active.publisher_handle.get()) {
            let request = match kind {
                TrackKind::Audio => VideoRoomRequest::Configure {
                    audio: Some(enabled),
                    video: None,
                },
                TrackKind::Video => VideoRoomRequest::Configure {
                    audio: None,
                    video: Some(enabled),
                },
            };
            if let Err(e) = active.channel.send(handle, request, None).await {
                warn!(kind = %kind, error = %e, "Configure request failed");
            }
        }
        info!(kind = %kind, enabled, "Local media toggled");
        Ok(enabled)
    }

    async fn stop(&self) {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                Lifecycle::Idle => None,
                Lifecycle::Starting(cancel) => {
                    cancel.cancel();
                    *lifecycle = Lifecycle::Starting(cancel);
                    None
                }
                Lifecycle::Running(active) => Some(active),
            }
        };

        match running {
            Some(active) => {
                info!(room = %active.room, "Stopping session");
                self.teardown(&active, true).await;
                self.emit(SessionEvent::Stopped);
            }
            // Wait for a cancelled start to finish releasing
            None => drop(self.start_lock.lock().await),
        }
    }

    async fn signaling_lost(&self, active: &Arc<ActiveSession>, reason: String) {
        warn!(room = %active.room, reason = %reason, "Signaling lost");
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match &*lifecycle {
                Lifecycle::Running(current) if Arc::ptr_eq(current, active) => {
                    *lifecycle = Lifecycle::Idle;
                    true
                }
                _ => false,
            }
        };

        if running {
            self.teardown(active, false).await;
            self.emit(SessionEvent::SignalingLost { reason });
            self.emit(SessionEvent::Stopped);
        } else {
            *active.lost.lock() = Some(reason);
            active.cancel.cancel();
        }
    }

    /// Release everything `active` holds. Runs once per session.
    async fn teardown(&self, active: &ActiveSession, graceful: bool) {
        if active.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        active.cancel.cancel();

        self.feeds.unbind();
        self.feeds.teardown_all().await;

        let publisher = active.publisher.lock().take();
        if let Some(publisher) = publisher {
            publisher.close().await;
        }

        if let Some(handle) = active.publisher_handle.get() {
            if graceful {
                let leave = active.channel.send(handle, VideoRoomRequest::Leave, None);
                match tokio::time::timeout(LEAVE_TIMEOUT, leave).await {
                    Ok(Ok(_)) => debug!("Left room"),
                    Ok(Err(e)) => debug!(error = %e, "Leave failed"),
                    Err(_) => debug!("Leave timed out"),
                }
            }
            if let Err(e) = active.channel.detach(handle).await {
                debug!(handle_id = %handle, error = %e, "Publisher detach failed");
            }
        }

        self.substitution.release().await;
        self.media.release_all();
        active.channel.close().await;
        info!(room = %active.room, "Session resources released");
    }
}
