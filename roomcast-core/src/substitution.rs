//! Enable/disable of the outbound tracks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SubstitutionPolicy;
use crate::error::Result;
use crate::media::{LocalMedia, MediaSourceController, MediaStream, MediaTrack};
use crate::negotiator::PeerNegotiator;
use crate::types::TrackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Real,
    Synthetic,
}

struct Slot {
    mode: Mode,
    track: Option<Arc<MediaTrack>>,
}

struct KindState {
    policy: SubstitutionPolicy,
    enabled: AtomicBool,
    /// Held for the whole of a transition
    slot: Mutex<Slot>,
}

impl KindState {
    fn new(policy: SubstitutionPolicy) -> Self {
        Self {
            policy,
            enabled: AtomicBool::new(true),
            slot: Mutex::new(Slot {
                mode: Mode::Real,
                track: None,
            }),
        }
    }
}

/// Per-kind real/synthetic state of the local outbound media
///
/// Under [`SubstitutionPolicy::Disable`] a disabled kind keeps its device
/// track with the enabled flag cleared. Under [`SubstitutionPolicy::Synthetic`]
/// the device is released and a generated track takes its place on the live
/// sender, with no renegotiation. Either way the sender always holds a track.
pub struct TrackSubstitutionController {
    media: Arc<MediaSourceController>,
    preview: MediaStream,
    audio: KindState,
    video: KindState,
}

impl TrackSubstitutionController {
    pub fn new(
        media: Arc<MediaSourceController>,
        audio_policy: SubstitutionPolicy,
        video_policy: SubstitutionPolicy,
    ) -> Self {
        Self {
            media,
            preview: MediaStream::new(),
            audio: KindState::new(audio_policy),
            video: KindState::new(video_policy),
        }
    }

    const fn state(&self, kind: TrackKind) -> &KindState {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    /// Adopt freshly acquired tracks as the real, enabled outbound media
    pub async fn install_local(&self, local: &LocalMedia) {
        for kind in TrackKind::ALL {
            let Some(track) = local.get(kind) else {
                continue;
            };
            let state = self.state(kind);
            let mut slot = state.slot.lock().await;
            if let Some(previous) = slot.track.replace(Arc::clone(track)) {
                self.preview.remove_track(previous.id());
                previous.stop();
            }
            slot.mode = Mode::Real;
            state.enabled.store(true, Ordering::Release);
            self.preview.add_track(Arc::clone(track));
        }
    }

    /// Locally displayed stream: the tracks currently fed to the sender
    #[must_use]
    pub fn preview(&self) -> MediaStream {
        self.preview.clone()
    }

    #[must_use]
    pub fn enabled(&self, kind: TrackKind) -> bool {
        self.state(kind).enabled.load(Ordering::Acquire)
    }

    /// Whether `kind` is currently carried by a generated track
    pub async fn is_synthetic(&self, kind: TrackKind) -> bool {
        self.state(kind).slot.lock().await.mode == Mode::Synthetic
    }

    #[must_use]
    pub fn current_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.preview.tracks_of(kind).into_iter().next()
    }

    /// Flip the enablement of `kind`; returns the new value
    pub async fn toggle(
        &self,
        kind: TrackKind,
        publisher: Option<&PeerNegotiator>,
    ) -> Result<bool> {
        let enabled = !self.enabled(kind);
        self.set_enabled(kind, enabled, publisher).await?;
        Ok(enabled)
    }

    /// Apply an enablement value to `kind`.
    ///
    /// When the device cannot be reopened the kind stays on its synthetic
    /// track, remains disabled and the device error is returned.
    pub async fn set_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
        publisher: Option<&PeerNegotiator>,
    ) -> Result<()> {
        let state = self.state(kind);
        let mut slot = state.slot.lock().await;

        let Some(current) = slot.track.clone() else {
            debug!(kind = %kind, enabled, "No local track, recording flag only");
            state.enabled.store(enabled, Ordering::Release);
            return Ok(());
        };

        match (state.policy, enabled, slot.mode) {
            (SubstitutionPolicy::Disable, _, Mode::Real) => {
                current.set_enabled(enabled);
            }
            (SubstitutionPolicy::Synthetic, false, Mode::Real) => {
                let synthetic = self.media.synthetic_track(kind);
                self.install(&mut slot, &current, Arc::clone(&synthetic), publisher)
                    .await
                    .inspect_err(|_| synthetic.stop())?;
                slot.mode = Mode::Synthetic;
                info!(kind = %kind, track_id = %synthetic.id(), "Synthetic track substituted");
            }
            (_, true, Mode::Synthetic) => {
                let real = match self.media.acquire_track(kind).await {
                    Ok(real) => real,
                    Err(e) => {
                        warn!(
                            kind = %kind,
                            error = %e,
                            "Device re-acquisition failed, staying synthetic"
                        );
                        state.enabled.store(false, Ordering::Release);
                        return Err(e);
                    }
                };
                self.install(&mut slot, &current, Arc::clone(&real), publisher)
                    .await
                    .inspect_err(|_| real.stop())?;
                slot.mode = Mode::Real;
                info!(kind = %kind, track_id = %real.id(), "Device track restored");
            }
            // Already synthetic and asked to disable again
            (_, false, Mode::Synthetic) | (SubstitutionPolicy::Synthetic, true, Mode::Real) => {}
        }

        state.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Hand `next` to the sender, then retire `current`
    async fn install(
        &self,
        slot: &mut Slot,
        current: &Arc<MediaTrack>,
        next: Arc<MediaTrack>,
        publisher: Option<&PeerNegotiator>,
    ) -> Result<()> {
        if let Some(publisher) = publisher {
            publisher.replace_outbound_track(Arc::clone(&next)).await?;
        }
        current.stop();
        self.preview.swap_track(current.id(), Arc::clone(&next));
        slot.track = Some(next);
        Ok(())
    }

    /// Stop every outbound track and forget them
    pub async fn release(&self) {
        for kind in TrackKind::ALL {
            let state = self.state(kind);
            let mut slot = state.slot.lock().await;
            if let Some(track) = slot.track.take() {
                track.stop();
                self.preview.remove_track(track.id());
            }
            slot.mode = Mode::Real;
            state.enabled.store(true, Ordering::Release);
        }
        self.preview.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaConstraints, SyntheticConfig};
    use crate::error::Error;
    use crate::media::{MediaDevices, MockMediaDevices, TestPatternDevices, TrackSource};
    use crate::rtc::{NegotiatorRole, PeerConnection};
    use crate::test_helpers::FakePeerConnection;
    use std::sync::atomic::AtomicUsize;

    fn device_track(kind: TrackKind) -> Arc<MediaTrack> {
        MediaTrack::local(
            kind,
            TrackSource::Device {
                label: format!("mock-{kind}"),
            },
        )
    }

    async fn setup(
        devices: Arc<dyn MediaDevices>,
        policy: SubstitutionPolicy,
    ) -> (TrackSubstitutionController, PeerNegotiator, Arc<FakePeerConnection>, LocalMedia) {
        let media = Arc::new(MediaSourceController::new(
            devices,
            MediaConstraints::default(),
            SyntheticConfig::default(),
        ));
        let local = media.acquire_local_media(&MediaConstraints::default()).await.unwrap();
        let controller = TrackSubstitutionController::new(media, policy, policy);
        controller.install_local(&local).await;

        let connection = FakePeerConnection::new(NegotiatorRole::Publisher);
        let dyn_connection: Arc<dyn PeerConnection> = connection.clone();
        let publisher = PeerNegotiator::new(NegotiatorRole::Publisher, dyn_connection);
        for track in local.tracks() {
            publisher.add_outbound_track(Arc::clone(track)).await.unwrap();
        }
        (controller, publisher, connection, local)
    }

    #[tokio::test]
    async fn test_disable_policy_keeps_track() {
        let (controller, publisher, connection, local) =
            setup(Arc::new(TestPatternDevices::new()), SubstitutionPolicy::Disable).await;
        let audio = local.audio.clone().unwrap();

        assert!(!controller.toggle(TrackKind::Audio, Some(&publisher)).await.unwrap());
        assert!(!audio.is_enabled());
        assert!(audio.is_live());
        assert!(connection.replaced_tracks().is_empty());

        assert!(controller.toggle(TrackKind::Audio, Some(&publisher)).await.unwrap());
        assert!(audio.is_enabled());
        assert_eq!(controller.current_track(TrackKind::Audio).unwrap().id(), audio.id());
    }

    #[tokio::test]
    async fn test_synthetic_round_trip_restores_real_track() {
        let (controller, publisher, connection, local) =
            setup(Arc::new(TestPatternDevices::new()), SubstitutionPolicy::Synthetic).await;
        let camera = local.video.clone().unwrap();

        assert!(!controller.toggle(TrackKind::Video, Some(&publisher)).await.unwrap());
        let sent = connection.sender(TrackKind::Video).unwrap();
        assert!(sent.is_synthetic());
        assert!(sent.is_live());
        assert!(camera.is_ended());
        assert_eq!(controller.current_track(TrackKind::Video).unwrap().id(), sent.id());

        assert!(controller.toggle(TrackKind::Video, Some(&publisher)).await.unwrap());
        let restored = connection.sender(TrackKind::Video).unwrap();
        assert!(!restored.is_synthetic());
        assert!(restored.is_live());
        assert!(sent.is_ended());
        assert!(controller.enabled(TrackKind::Video));
        assert!(!controller.is_synthetic(TrackKind::Video).await);

        assert_eq!(connection.replaced_tracks().len(), 2);
        assert_eq!(connection.sender_gaps(), 0);
        assert_eq!(controller.preview().video_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reacquire_stays_synthetic() {
        let opened = Arc::new(AtomicUsize::new(0));
        let mut devices = MockMediaDevices::new();
        let counter = Arc::clone(&opened);
        devices.expect_open().returning(move |kind, _| {
            // Initial capture of both kinds succeeds; any reopen fails
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(device_track(kind))
            } else {
                Err(Error::DeviceUnavailable {
                    kind,
                    reason: "camera unplugged".to_string(),
                })
            }
        });

        let (controller, publisher, connection, _local) =
            setup(Arc::new(devices), SubstitutionPolicy::Synthetic).await;
        controller.toggle(TrackKind::Video, Some(&publisher)).await.unwrap();

        let err = controller.toggle(TrackKind::Video, Some(&publisher)).await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { kind: TrackKind::Video, .. }));
        assert!(!controller.enabled(TrackKind::Video));
        assert!(controller.is_synthetic(TrackKind::Video).await);

        let sent = connection.sender(TrackKind::Video).unwrap();
        assert!(sent.is_synthetic());
        assert!(sent.is_live());
        assert_eq!(opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_toggle_without_publisher_updates_preview() {
        let (controller, _publisher, _connection, local) =
            setup(Arc::new(TestPatternDevices::new()), SubstitutionPolicy::Synthetic).await;

        controller.toggle(TrackKind::Audio, None).await.unwrap();
        let current = controller.current_track(TrackKind::Audio).unwrap();
        assert!(current.is_synthetic());
        assert!(local.audio.as_ref().unwrap().is_ended());

        controller.release().await;
        assert!(current.is_ended());
        assert!(controller.preview().is_empty());
    }

    #[tokio::test]
    async fn test_missing_kind_records_flag() {
        let (controller, publisher, connection, _local) = setup(
            Arc::new(TestPatternDevices::with_kinds(true, false)),
            SubstitutionPolicy::Synthetic,
        )
        .await;

        assert!(!controller.toggle(TrackKind::Video, Some(&publisher)).await.unwrap());
        assert!(connection.sender(TrackKind::Video).is_none());
        assert!(controller.current_track(TrackKind::Video).is_none());
    }
}
