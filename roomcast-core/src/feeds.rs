//! Remote feed registry
//!
//! The registry's map is the single source of truth for remote state. Each
//! feed is served by its own worker task that owns the subscriber negotiator
//! and plugin handle, and processes that feed's signaling and peer events in
//! arrival order. Removal from the map happens exactly once, under the lock;
//! the worker then releases its resources and signals completion.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IceServer;
use crate::error::{Error, Result, ERROR_NO_SUCH_FEED};
use crate::media::{MediaStream, MediaTrack};
use crate::negotiator::PeerNegotiator;
use crate::rtc::{
    NegotiationConstraints, NegotiatorRole, PeerConnectionFactory, PeerEvent, PeerEventHandler,
    SessionDescription,
};
use crate::signaling::{
    PluginReply, SignalingChannel, SignalingEvent, VideoRoomEvent, VideoRoomRequest,
};
use crate::types::{FeedId, HandleId, RoomId, TrackId, TrackKind};

/// Read-only presentation entry of one remote feed
#[derive(Debug, Clone)]
pub struct FeedView {
    pub feed_id: FeedId,
    pub display: Option<String>,
    pub tracks: Vec<Arc<MediaTrack>>,
}

/// Session resources a feed worker needs
#[derive(Clone)]
pub struct FeedContext {
    pub room: RoomId,
    pub channel: Arc<dyn SignalingChannel>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub ice_servers: Arc<[IceServer]>,
    pub negotiation_timeout: Duration,
}

enum FeedInput {
    Signaling(SignalingEvent),
    Peer(PeerEvent),
}

struct FeedEntry {
    generation: u64,
    display: Option<String>,
    stream: MediaStream,
    inbox: mpsc::UnboundedSender<FeedInput>,
    cancel: CancellationToken,
    done: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    feeds: IndexMap<FeedId, FeedEntry>,
    handles: HashMap<HandleId, FeedId>,
    /// Feeds removed from the map whose worker is still releasing resources
    retiring: HashMap<FeedId, (u64, CancellationToken)>,
    next_generation: u64,
    context: Option<FeedContext>,
}

pub struct FeedRegistry {
    state: Mutex<RegistryState>,
    remote_muted: AtomicBool,
    implicit_leave: bool,
    feeds_tx: watch::Sender<Arc<[FeedView]>>,
    this: Weak<FeedRegistry>,
}

impl FeedRegistry {
    /// `implicit_leave` makes a feed whose stream loses its last track count as departed
    pub fn new(implicit_leave: bool) -> Arc<Self> {
        let (feeds_tx, _) = watch::channel(Arc::from(Vec::new()));
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(RegistryState::default()),
            remote_muted: AtomicBool::new(false),
            implicit_leave,
            feeds_tx,
            this: this.clone(),
        })
    }

    /// Make the registry usable for a joined session
    pub fn bind(&self, context: FeedContext) {
        self.state.lock().context = Some(context);
    }

    pub fn unbind(&self) {
        self.state.lock().context = None;
    }

    /// Start tracking `feed_id` unless it is already known.
    ///
    /// Returns `Ok(false)` for a duplicate announcement. A new feed appears in
    /// the feed list immediately; its worker joins as subscriber right away.
    pub fn ensure_feed(
        &self,
        feed_id: FeedId,
        mids: Vec<String>,
        display: Option<String>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(context) = state.context.clone() else {
            return Err(Error::NotStarted);
        };
        if state.feeds.contains_key(&feed_id) {
            debug!(feed_id = %feed_id, "Feed already known");
            return Ok(false);
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let previous = state.retiring.get(&feed_id).map(|(_, done)| done.clone());
        let (inbox, queue) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        state.feeds.insert(
            feed_id.clone(),
            FeedEntry {
                generation,
                display: display.clone(),
                stream: MediaStream::new(),
                inbox: inbox.clone(),
                cancel: cancel.clone(),
                done: done.clone(),
            },
        );
        drop(state);

        info!(feed_id = %feed_id, generation, mids = ?mids, "Feed discovered");
        self.publish();

        let worker = FeedWorker {
            registry: self.this.clone(),
            feed_id,
            generation,
            mids,
            context,
            inbox,
            cancel,
            done,
            previous,
            handle: None,
            negotiator: None,
        };
        tokio::spawn(worker.run(queue));
        Ok(true)
    }

    #[must_use]
    pub fn contains(&self, feed_id: &FeedId) -> bool {
        self.state.lock().feeds.contains_key(feed_id)
    }

    #[must_use]
    pub fn feed_for_handle(&self, handle: &HandleId) -> Option<FeedId> {
        self.state.lock().handles.get(handle).cloned()
    }

    /// Queue a signaling event for the feed owning `handle`. Returns false for
    /// unknown handles.
    pub fn route_signal(&self, handle: &HandleId, event: SignalingEvent) -> bool {
        let state = self.state.lock();
        let Some(entry) = state.handles.get(handle).and_then(|feed| state.feeds.get(feed)) else {
            return false;
        };
        entry.inbox.send(FeedInput::Signaling(event)).is_ok()
    }

    /// Add a received track to the feed's stream
    pub fn on_remote_track_added(
        &self,
        feed_id: &FeedId,
        track: Arc<MediaTrack>,
        mid: Option<String>,
    ) -> bool {
        if track.kind() == TrackKind::Audio && self.remote_muted() {
            track.set_enabled(false);
        }

        let added = {
            let state = self.state.lock();
            match state.feeds.get(feed_id) {
                Some(entry) => entry.stream.add_track(Arc::clone(&track)),
                None => false,
            }
        };

        if added {
            debug!(
                feed_id = %feed_id,
                track_id = %track.id(),
                kind = %track.kind(),
                mid = ?mid,
                "Remote track added"
            );
            self.publish();
        } else if !self.contains(feed_id) {
            track.stop();
        }
        added
    }

    /// Drop a track from the feed's stream. Returns true when this emptied
    /// the stream and the feed was torn down as an implicit leave.
    pub fn on_remote_track_removed(&self, feed_id: &FeedId, track_id: &TrackId) -> bool {
        let (removed, empty) = {
            let state = self.state.lock();
            let Some(entry) = state.feeds.get(feed_id) else {
                return false;
            };
            let removed = entry.stream.remove_track(track_id);
            (removed, entry.stream.is_empty())
        };

        let Some(track) = removed else {
            return false;
        };
        track.stop();
        debug!(feed_id = %feed_id, track_id = %track_id, "Remote track removed");

        if empty && self.implicit_leave {
            info!(feed_id = %feed_id, "Remote stream empty, treating as leave");
            return self.retire(feed_id, None).is_some();
        }
        self.publish();
        false
    }

    /// Tear `feed_id` down and wait until its resources are released.
    ///
    /// Returns false when the feed was not present; concurrent calls for the
    /// same feed see exactly one `true`.
    pub async fn teardown_feed(&self, feed_id: &FeedId) -> bool {
        match self.retire(feed_id, None) {
            Some(done) => {
                done.cancelled().await;
                true
            }
            None => false,
        }
    }

    /// Tear `feed_id` down without waiting for the release to finish
    pub fn spawn_teardown(&self, feed_id: &FeedId) -> bool {
        self.retire(feed_id, None).is_some()
    }

    /// Tear every feed down and wait for all of them
    pub async fn teardown_all(&self) {
        let ids: Vec<FeedId> = self.state.lock().feeds.keys().cloned().collect();
        let pending: Vec<CancellationToken> =
            ids.iter().filter_map(|id| self.retire(id, None)).collect();
        futures::future::join_all(pending.iter().map(CancellationToken::cancelled)).await;
    }

    /// Remove the entry under the lock; `generation` restricts removal to one feed instance
    fn retire(&self, feed_id: &FeedId, generation: Option<u64>) -> Option<CancellationToken> {
        let entry = {
            let mut state = self.state.lock();
            let matches = state
                .feeds
                .get(feed_id)
                .is_some_and(|entry| generation.map_or(true, |g| g == entry.generation));
            if !matches {
                return None;
            }
            let entry = state.feeds.shift_remove(feed_id)?;
            state.handles.retain(|_, feed| feed != feed_id);
            state
                .retiring
                .insert(feed_id.clone(), (entry.generation, entry.done.clone()));
            entry
        };

        entry.cancel.cancel();
        entry.stream.stop_all();
        info!(feed_id = %feed_id, generation = entry.generation, "Feed torn down");
        self.publish();
        Some(entry.done)
    }

    fn register_handle(&self, feed_id: &FeedId, generation: u64, handle: HandleId) -> bool {
        let mut state = self.state.lock();
        let current = state
            .feeds
            .get(feed_id)
            .is_some_and(|entry| entry.generation == generation);
        if current {
            state.handles.insert(handle, feed_id.clone());
        }
        current
    }

    fn finish_retirement(&self, feed_id: &FeedId, generation: u64) {
        let mut state = self.state.lock();
        if state.retiring.get(feed_id).is_some_and(|(g, _)| *g == generation) {
            state.retiring.remove(feed_id);
        }
    }

    pub fn set_remote_muted(&self, muted: bool) {
        self.remote_muted.store(muted, Ordering::Release);
        let state = self.state.lock();
        for entry in state.feeds.values() {
            for track in entry.stream.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
        debug!(muted, feeds = state.feeds.len(), "Remote audio mute applied");
    }

    #[must_use]
    pub fn remote_muted(&self) -> bool {
        self.remote_muted.load(Ordering::Acquire)
    }

    /// Current feed list in discovery order
    #[must_use]
    pub fn snapshot(&self) -> Arc<[FeedView]> {
        Arc::clone(&self.feeds_tx.borrow())
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<[FeedView]>> {
        self.feeds_tx.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().feeds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self) {
        let views: Vec<FeedView> = {
            let state = self.state.lock();
            state
                .feeds
                .iter()
                .map(|(feed_id, entry)| FeedView {
                    feed_id: feed_id.clone(),
                    display: entry.display.clone(),
                    tracks: entry.stream.tracks(),
                })
                .collect()
        };
        self.feeds_tx.send_replace(Arc::from(views));
    }
}

/// Why a feed worker stopped
#[derive(Debug)]
enum Exit {
    /// Removed from the registry by someone else
    Retired,
    Departed(String),
    Failed(Error),
}

struct FeedWorker {
    registry: Weak<FeedRegistry>,
    feed_id: FeedId,
    generation: u64,
    mids: Vec<String>,
    context: FeedContext,
    inbox: mpsc::UnboundedSender<FeedInput>,
    cancel: CancellationToken,
    done: CancellationToken,
    previous: Option<CancellationToken>,
    handle: Option<HandleId>,
    negotiator: Option<Arc<PeerNegotiator>>,
}

impl FeedWorker {
    async fn run(mut self, queue: mpsc::UnboundedReceiver<FeedInput>) {
        let exit = self.drive(queue).await;

        match &exit {
            Exit::Retired => {}
            Exit::Departed(reason) => {
                debug!(feed_id = %self.feed_id, reason = %reason, "Feed departed");
            }
            Exit::Failed(e) => {
                warn!(feed_id = %self.feed_id, error = %e, "Feed failed");
            }
        }
        if !matches!(exit, Exit::Retired) {
            if let Some(registry) = self.registry.upgrade() {
                registry.retire(&self.feed_id, Some(self.generation));
            }
        }

        self.release().await;
        // `done` covers every earlier instance of this feed as well
        if let Some(previous) = self.previous.take() {
            previous.cancelled().await;
        }
        self.done.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.finish_retirement(&self.feed_id, self.generation);
        }
    }

    async fn drive(&mut self, queue: mpsc::UnboundedReceiver<FeedInput>) -> Exit {
        let cancel = self.cancel.clone();
        if let Some(previous) = self.previous.clone() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Exit::Retired,
                () = previous.cancelled() => {}
            }
        }

        // Attach runs to completion so a handle the server allocated is
        // always known to `release`.
        let attached = self.attach().await;
        if cancel.is_cancelled() {
            return Exit::Retired;
        }
        if let Err(e) = attached {
            return Exit::Failed(e);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Exit::Retired,
            exit = self.serve(queue) => exit,
        }
    }

    /// Create the subscriber connection and attach a plugin handle for it
    async fn attach(&mut self) -> Result<()> {
        let inbox = self.inbox.clone();
        let on_event: PeerEventHandler = Arc::new(move |event| {
            let _ = inbox.send(FeedInput::Peer(event));
        });
        let connection = self
            .context
            .peers
            .create(NegotiatorRole::Subscriber, &self.context.ice_servers, on_event)
            .await?;
        self.negotiator = Some(Arc::new(PeerNegotiator::new(
            NegotiatorRole::Subscriber,
            connection,
        )));

        let handle = self.context.channel.attach().await?;
        self.handle = Some(handle.clone());
        let registry = self.registry.upgrade().ok_or(Error::NotStarted)?;
        if !registry.register_handle(&self.feed_id, self.generation, handle) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Join the feed, then process its events until it goes away
    async fn serve(&mut self, mut queue: mpsc::UnboundedReceiver<FeedInput>) -> Exit {
        let reply = match self.join().await {
            Ok(reply) => reply,
            Err(e) => return Exit::Failed(e),
        };
        if let Some(exit) = self.on_message(&reply.data, reply.jsep).await {
            return exit;
        }

        while let Some(input) = queue.recv().await {
            let exit = match input {
                FeedInput::Signaling(event) => self.on_signal(event).await,
                FeedInput::Peer(event) => self.on_peer(event).await,
            };
            if let Some(exit) = exit {
                return exit;
            }
        }
        Exit::Retired
    }

    async fn join(&self) -> Result<PluginReply> {
        let handle = self.handle.as_ref().ok_or(Error::NotStarted)?;
        debug!(feed_id = %self.feed_id, handle_id = %handle, "Joining feed as subscriber");
        self.context
            .channel
            .send(
                handle,
                VideoRoomRequest::join_subscriber(&self.context.room, &self.feed_id),
                None,
            )
            .await
    }

    async fn on_signal(&mut self, event: SignalingEvent) -> Option<Exit> {
        match event {
            SignalingEvent::Message { data, jsep, .. } => self.on_message(&data, jsep).await,
            SignalingEvent::Trickle {
                candidate: Some(candidate),
                ..
            } => {
                if let Some(negotiator) = &self.negotiator {
                    if let Err(e) = negotiator.add_ice_candidate(candidate).await {
                        warn!(feed_id = %self.feed_id, error = %e, "Remote candidate rejected");
                    }
                }
                None
            }
            SignalingEvent::Trickle { candidate: None, .. } => None,
            SignalingEvent::HangUp { reason, .. } => {
                Some(Exit::Departed(format!("hang-up: {reason}")))
            }
            SignalingEvent::Detached { .. } => Some(Exit::Departed("handle detached".to_string())),
            SignalingEvent::WebRtcUp { .. } => {
                info!(feed_id = %self.feed_id, "Subscriber media path up");
                None
            }
            SignalingEvent::Media { kind, receiving, .. } => {
                debug!(feed_id = %self.feed_id, kind = %kind, receiving, "Subscriber media state");
                None
            }
            SignalingEvent::Closed { .. } => None,
        }
    }

    async fn on_message(
        &mut self,
        data: &serde_json::Value,
        jsep: Option<SessionDescription>,
    ) -> Option<Exit> {
        match VideoRoomEvent::parse(data) {
            Ok(event @ VideoRoomEvent::Event { .. }) => {
                if let Some(departed) = event.departed() {
                    return Some(Exit::Departed(format!("feed {departed} left")));
                }
                if let VideoRoomEvent::Event {
                    error_code: Some(code),
                    error,
                    ..
                } = event
                {
                    let reason = error.unwrap_or_default();
                    if code == ERROR_NO_SUCH_FEED {
                        return Some(Exit::Failed(Error::Plugin { code, reason }));
                    }
                    warn!(
                        feed_id = %self.feed_id,
                        code,
                        reason = %reason,
                        "Subscriber plugin error"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!(feed_id = %self.feed_id, error = %e, "Unparseable subscriber event"),
        }

        match jsep {
            Some(offer) if offer.is_offer() => self.answer(offer).await,
            _ => None,
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Option<Exit> {
        let (negotiator, handle) = match (&self.negotiator, &self.handle) {
            (Some(negotiator), Some(handle)) => (Arc::clone(negotiator), handle.clone()),
            _ => return None,
        };

        let answer = match tokio::time::timeout(
            self.context.negotiation_timeout,
            negotiator.create_answer(offer, &NegotiationConstraints::subscriber(), &self.mids),
        )
        .await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) if e.is_sequencing() => {
                warn!(feed_id = %self.feed_id, error = %e, "Ignoring offer");
                return None;
            }
            Ok(Err(e)) => return Some(Exit::Failed(e)),
            Err(_) => {
                let reason = "answer timed out".to_string();
                return Some(Exit::Failed(Error::NegotiationFailed(reason)));
            }
        };

        let start = VideoRoomRequest::Start {
            room: self.context.room.clone(),
        };
        match self.context.channel.send(&handle, start, Some(answer)).await {
            Ok(_) => {
                info!(feed_id = %self.feed_id, "Subscription started");
                None
            }
            Err(e) => Some(Exit::Failed(e)),
        }
    }

    async fn on_peer(&mut self, event: PeerEvent) -> Option<Exit> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(handle) = &self.handle {
                    if let Err(e) = self.context.channel.trickle(handle, candidate).await {
                        debug!(feed_id = %self.feed_id, error = %e, "Trickle failed");
                    }
                }
                None
            }
            PeerEvent::TrackAdded { track, mid } => {
                let registry = self.registry.upgrade()?;
                registry.on_remote_track_added(&self.feed_id, track, mid);
                None
            }
            PeerEvent::TrackRemoved { track_id } => {
                let registry = self.registry.upgrade()?;
                registry
                    .on_remote_track_removed(&self.feed_id, &track_id)
                    .then_some(Exit::Retired)
            }
            PeerEvent::ConnectionState(state) if state.is_terminal() => {
                let reason = format!("subscriber connection {state:?}");
                Some(Exit::Failed(Error::NegotiationFailed(reason)))
            }
            PeerEvent::ConnectionState(state) => {
                debug!(feed_id = %self.feed_id, state = ?state, "Subscriber connection state");
                None
            }
        }
    }

    async fn release(&mut self) {
        if let Some(negotiator) = self.negotiator.take() {
            negotiator.close().await;
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.context.channel.detach(&handle).await {
                debug!(feed_id = %self.feed_id, handle_id = %handle, error = %e, "Detach failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::rtc::PeerConnectionState;
    use crate::test_helpers::{FakePeerFactory, FakeSignaling};

    fn setup(implicit_leave: bool) -> (Arc<FeedRegistry>, FakeSignaling, Arc<FakePeerFactory>) {
        let signaling = FakeSignaling::new();
        let peers = FakePeerFactory::new();
        let registry = FeedRegistry::new(implicit_leave);
        registry.bind(FeedContext {
            room: RoomId::from(42u64),
            channel: Arc::new(signaling.clone()),
            peers: peers.clone(),
            ice_servers: Arc::from(Vec::new()),
            negotiation_timeout: Duration::from_secs(5),
        });
        (registry, signaling, peers)
    }

    fn mids() -> Vec<String> {
        vec!["0".to_string(), "1".to_string()]
    }

    fn ids(registry: &FeedRegistry) -> Vec<String> {
        registry
            .snapshot()
            .iter()
            .map(|view| view.feed_id.to_string())
            .collect()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_noop() {
        let (registry, signaling, peers) = setup(true);
        let feed = FeedId::from(7u64);

        assert!(registry.ensure_feed(feed.clone(), mids(), None).unwrap());
        assert!(!registry.ensure_feed(feed.clone(), mids(), None).unwrap());
        settle().await;

        assert_eq!(ids(&registry), vec!["7"]);
        assert_eq!(peers.subscribers().len(), 1);
        assert_eq!(signaling.subscriber_joins(), vec![feed.clone()]);

        // The offer carried by the join reply was answered with start
        assert_eq!(signaling.request_names(), vec!["join", "start"]);
    }

    #[tokio::test]
    async fn test_ensure_before_bind_fails() {
        let registry = FeedRegistry::new(true);
        let err = registry.ensure_feed(FeedId::from(1u64), mids(), None).unwrap_err();
        assert!(matches!(err, Error::NotStarted));
    }

    #[tokio::test]
    async fn test_empty_stream_is_implicit_leave() {
        let (registry, signaling, peers) = setup(true);
        let feed = FeedId::from(7u64);
        registry.ensure_feed(feed.clone(), mids(), None).unwrap();
        settle().await;

        let connection = peers.subscribers()[0].clone();
        let track =
            MediaTrack::remote(TrackId::from("remote-audio"), TrackKind::Audio, Some("0".into()));
        connection.emit(PeerEvent::TrackAdded {
            track: Arc::clone(&track),
            mid: Some("0".to_string()),
        });
        settle().await;
        assert_eq!(registry.snapshot()[0].tracks.len(), 1);

        connection.emit(PeerEvent::TrackRemoved {
            track_id: track.id().clone(),
        });
        settle().await;

        assert!(registry.snapshot().is_empty());
        assert!(track.is_ended());
        assert_eq!(connection.close_count(), 1);
        assert_eq!(signaling.detached().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_stream_kept_without_implicit_leave() {
        let (registry, _signaling, peers) = setup(false);
        let feed = FeedId::from(7u64);
        registry.ensure_feed(feed.clone(), mids(), None).unwrap();
        settle().await;

        let track =
            MediaTrack::remote(TrackId::from("remote-video"), TrackKind::Video, Some("1".into()));
        assert!(registry.on_remote_track_added(&feed, Arc::clone(&track), Some("1".into())));
        assert!(!registry.on_remote_track_removed(&feed, track.id()));

        settle().await;
        assert_eq!(ids(&registry), vec!["7"]);
        assert_eq!(peers.subscribers()[0].close_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_teardown_closes_once() {
        let (registry, _signaling, peers) = setup(true);
        let feed = FeedId::from(7u64);
        registry.ensure_feed(feed.clone(), mids(), None).unwrap();
        settle().await;

        let mut feeds = registry.watch();
        feeds.borrow_and_update();

        let (first, second) =
            tokio::join!(registry.teardown_feed(&feed), registry.teardown_feed(&feed));
        assert!(first ^ second);
        assert_eq!(peers.subscribers()[0].close_count(), 1);

        assert!(feeds.has_changed().unwrap());
        feeds.borrow_and_update();
        assert!(!registry.teardown_feed(&feed).await);
        assert!(!feeds.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_leaving_event_on_subscriber_handle() {
        let (registry, signaling, _peers) = setup(true);
        registry.ensure_feed(FeedId::from(7u64), mids(), None).unwrap();
        registry.ensure_feed(FeedId::from(8u64), mids(), None).unwrap();
        settle().await;
        assert_eq!(ids(&registry), vec!["7", "8"]);

        let handle = signaling.handle_for_feed(&FeedId::from(7u64)).unwrap();
        assert!(registry.route_signal(
            &handle,
            SignalingEvent::Message {
                handle: handle.clone(),
                data: serde_json::json!({"videoroom": "event", "leaving": 7}),
                jsep: None,
            },
        ));
        settle().await;

        assert_eq!(ids(&registry), vec!["8"]);
        let up = SignalingEvent::WebRtcUp {
            handle: handle.clone(),
        };
        assert!(!registry.route_signal(&handle, up));
    }

    #[tokio::test]
    async fn test_no_such_feed_tears_down() {
        let (registry, signaling, _peers) = setup(true);
        signaling.set_missing_feed(FeedId::from(9u64));
        registry.ensure_feed(FeedId::from(9u64), mids(), None).unwrap();
        settle().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remote_mute_applies_to_late_tracks() {
        let (registry, _signaling, _peers) = setup(true);
        let feed = FeedId::from(7u64);
        registry.ensure_feed(feed.clone(), mids(), None).unwrap();

        let early = MediaTrack::remote(TrackId::from("a1"), TrackKind::Audio, None);
        registry.on_remote_track_added(&feed, Arc::clone(&early), None);
        registry.set_remote_muted(true);
        assert!(!early.is_enabled());

        let late = MediaTrack::remote(TrackId::from("a2"), TrackKind::Audio, None);
        let video = MediaTrack::remote(TrackId::from("v1"), TrackKind::Video, None);
        registry.on_remote_track_added(&feed, Arc::clone(&late), None);
        registry.on_remote_track_added(&feed, Arc::clone(&video), None);
        assert!(!late.is_enabled());
        assert!(video.is_enabled());

        registry.set_remote_muted(false);
        assert!(early.is_enabled() && late.is_enabled());
    }

    #[tokio::test]
    async fn test_rejoin_waits_for_previous_teardown() {
        let (registry, _signaling, peers) = setup(true);
        let feed = FeedId::from(7u64);
        registry.ensure_feed(feed.clone(), mids(), None).unwrap();
        settle().await;

        assert!(registry.spawn_teardown(&feed));
        assert!(registry.ensure_feed(feed.clone(), mids(), None).unwrap());
        settle().await;

        let subscribers = peers.subscribers();
        assert_eq!(subscribers.len(), 2);
        assert_eq!(subscribers[0].close_count(), 1);
        assert_eq!(subscribers[1].close_count(), 0);
        assert_eq!(ids(&registry), vec!["7"]);
    }

    #[tokio::test]
    async fn test_rejoin_waits_for_every_earlier_instance() {
        let (registry, signaling, peers) = setup(true);
        let feed = FeedId::from(7u64);
        registry.ensure_feed(feed.clone(), mids(), None).unwrap();
        settle().await;

        // The first instance stays stuck in detach
        let detaches = signaling.hold_detaches();
        assert!(registry.spawn_teardown(&feed));
        assert!(registry.ensure_feed(feed.clone(), mids(), None).unwrap());
        settle().await;

        // The second one is retired before it subscribed
        assert!(registry.spawn_teardown(&feed));
        assert!(registry.ensure_feed(feed.clone(), mids(), None).unwrap());
        settle().await;

        assert_eq!(peers.subscribers().len(), 1);
        assert!(signaling.detached().is_empty());

        detaches.cancel();
        settle().await;

        assert_eq!(peers.subscribers().len(), 2);
        assert_eq!(signaling.detached().len(), 1);
        assert_eq!(signaling.subscriber_joins(), vec![feed.clone(), feed]);
    }

    #[tokio::test]
    async fn test_handle_attached_after_teardown_is_detached() {
        let (registry, signaling, peers) = setup(true);
        let feed = FeedId::from(7u64);
        let attaches = signaling.hold_attaches();
        registry.ensure_feed(feed.clone(), mids(), None).unwrap();
        settle().await;

        assert!(registry.spawn_teardown(&feed));
        settle().await;
        assert!(signaling.attached().is_empty());

        attaches.cancel();
        settle().await;

        assert_eq!(signaling.attached().len(), 1);
        assert_eq!(signaling.detached(), signaling.attached());
        assert!(signaling.subscriber_joins().is_empty());
        assert_eq!(peers.subscribers()[0].close_count(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_connection_is_a_leave() {
        let (registry, signaling, peers) = setup(true);
        registry.ensure_feed(FeedId::from(7u64), mids(), None).unwrap();
        registry.ensure_feed(FeedId::from(8u64), mids(), None).unwrap();
        settle().await;

        let connection = peers.subscribers()[0].clone();
        connection.emit(PeerEvent::ConnectionState(PeerConnectionState::Failed));
        settle().await;

        assert_eq!(ids(&registry), vec!["8"]);
        assert_eq!(connection.close_count(), 1);
        assert_eq!(
            signaling.detached(),
            vec![signaling.handle_for_feed(&FeedId::from(7u64)).unwrap()]
        );
        assert_eq!(peers.subscribers()[1].close_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_track_for_unknown_feed_is_stopped() {
        let (registry, _signaling, _peers) = setup(true);
        let track = MediaTrack::local(TrackKind::Video, TrackSource::Synthetic);
        assert!(!registry.on_remote_track_added(&FeedId::from(99u64), Arc::clone(&track), None));
        assert!(track.is_ended());
    }
}
