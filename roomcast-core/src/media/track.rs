//! Media track handles
//!
//! A [`MediaTrack`] is the unit of media ownership: it belongs to exactly one
//! stream at a time, carries an enabled flag (muting without stopping) and an
//! ended flag, and owns the cancellation token of whatever pipeline feeds it.
//! Stopping a track releases that pipeline.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{TrackId, TrackKind};

/// Samples buffered per subscriber before it starts lagging
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Where a track's media comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackSource {
    /// Local capture device
    Device { label: String },
    /// Locally generated blank-frame or silent-audio source
    Synthetic,
    /// Media received from a remote feed on the given media line
    Remote { mid: Option<String> },
}

/// One unit of media flowing through a track
#[derive(Debug, Clone)]
pub struct MediaSample {
    pub payload: Bytes,
    pub duration: Duration,
}

pub struct MediaTrack {
    id: TrackId,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: AtomicBool,
    samples_pushed: AtomicU64,
    stop_token: CancellationToken,
    samples: broadcast::Sender<MediaSample>,
}

impl MediaTrack {
    pub fn new(id: TrackId, kind: TrackKind, source: TrackSource) -> Arc<Self> {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Arc::new(Self {
            id,
            kind,
            source,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            samples_pushed: AtomicU64::new(0),
            stop_token: CancellationToken::new(),
            samples,
        })
    }

    /// Track with a generated id
    pub fn local(kind: TrackKind, source: TrackSource) -> Arc<Self> {
        Self::new(TrackId::generate(), kind, source)
    }

    pub fn remote(id: TrackId, kind: TrackKind, mid: Option<String>) -> Arc<Self> {
        Self::new(id, kind, TrackSource::Remote { mid })
    }

    #[must_use]
    pub const fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub const fn source(&self) -> &TrackSource {
        &self.source
    }

    #[must_use]
    pub const fn is_synthetic(&self) -> bool {
        matches!(self.source, TrackSource::Synthetic)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Started and not yet stopped
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_ended()
    }

    /// Stop the track and release its pipeline. Idempotent.
    pub fn stop(&self) {
        if !self.ended.swap(true, Ordering::AcqRel) {
            debug!(track_id = %self.id, kind = %self.kind, "Track stopped");
            self.stop_token.cancel();
        }
    }

    /// Resolves once the track has been stopped
    pub async fn stopped(&self) {
        self.stop_token.cancelled().await;
    }

    /// Token cancelled when the track stops; pipelines select on it
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    /// Push a sample to every subscriber. Returns false once the track has ended.
    ///
    /// Samples pushed while the track is disabled are dropped, mirroring a
    /// muted track that keeps its transport alive but carries no content.
    pub fn push_sample(&self, sample: MediaSample) -> bool {
        if self.is_ended() {
            return false;
        }
        if self.is_enabled() {
            self.samples_pushed.fetch_add(1, Ordering::Relaxed);
            // No receivers is not an error: nothing consumes the track yet.
            let _ = self.samples.send(sample);
        }
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.samples.subscribe()
    }

    /// Number of samples delivered since creation
    #[must_use]
    pub fn samples_pushed(&self) -> u64 {
        self.samples_pushed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        // A dropped track must not leave its generator or capture task running.
        self.stop_token.cancel();
    }
}
