use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use super::devices::MediaDevices;
use super::synthetic;
use super::track::MediaTrack;
use crate::config::{MediaConstraints, SyntheticConfig};
use crate::error::{Error, Result};
use crate::types::TrackKind;

/// Tracks obtained by [`MediaSourceController::acquire_local_media`]
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<Arc<MediaTrack>>,
    pub video: Option<Arc<MediaTrack>>,
}

impl LocalMedia {
    #[must_use]
    pub fn get(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.audio.iter().chain(self.video.iter())
    }
}

#[derive(Default)]
struct Captures {
    audio: Option<Arc<MediaTrack>>,
    video: Option<Arc<MediaTrack>>,
}

impl Captures {
    fn slot(&mut self, kind: TrackKind) -> &mut Option<Arc<MediaTrack>> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }
}

/// Exclusive owner of local capture and the synthetic fallback sources
///
/// At most one device capture per kind is live at a time: installing a new
/// capture stops the previous one of the same kind.
pub struct MediaSourceController {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    synthetic: SyntheticConfig,
    captures: Mutex<Captures>,
}

impl MediaSourceController {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        constraints: MediaConstraints,
        synthetic: SyntheticConfig,
    ) -> Self {
        Self {
            devices,
            constraints,
            synthetic,
            captures: Mutex::new(Captures::default()),
        }
    }

    #[must_use]
    pub const fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    /// Open every kind `constraints` asks for.
    ///
    /// A kind that cannot be opened is logged and left out; the call only
    /// fails when nothing requested could be opened.
    pub async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<LocalMedia> {
        let mut media = LocalMedia::default();
        let mut last_error = None;

        for kind in TrackKind::ALL {
            let wanted = match kind {
                TrackKind::Audio => constraints.audio.enabled,
                TrackKind::Video => constraints.video.enabled,
            };
            if !wanted {
                continue;
            }

            match self.open(kind, constraints).await {
                Ok(track) => match kind {
                    TrackKind::Audio => media.audio = Some(track),
                    TrackKind::Video => media.video = Some(track),
                },
                Err(e) => {
                    warn!(
                        kind = %kind,
                        error = %e,
                        "Local capture unavailable, continuing without it"
                    );
                    last_error = Some(e);
                }
            }
        }

        if media.is_empty() {
            return Err(last_error.unwrap_or(Error::DeviceUnavailable {
                kind: TrackKind::Audio,
                reason: "no media kinds requested".to_string(),
            }));
        }

        info!(
            audio = media.audio.is_some(),
            video = media.video.is_some(),
            "Local media acquired"
        );
        Ok(media)
    }

    /// Open a fresh device capture of `kind` with the controller's constraints
    pub async fn acquire_track(&self, kind: TrackKind) -> Result<Arc<MediaTrack>> {
        let constraints = self.constraints.clone();
        self.open(kind, &constraints).await
    }

    async fn open(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaTrack>> {
        let track = self.devices.open(kind, constraints).await.map_err(|e| match e {
            e @ Error::DeviceUnavailable { .. } => e,
            other => Error::DeviceUnavailable {
                kind,
                reason: other.to_string(),
            },
        })?;

        let previous = self.captures.lock().slot(kind).replace(Arc::clone(&track));
        if let Some(previous) = previous {
            if previous.is_live() {
                previous.stop();
            }
        }
        Ok(track)
    }

    pub fn blank_video_track(&self) -> Arc<MediaTrack> {
        synthetic::blank_video_track(&self.synthetic)
    }

    pub fn silent_audio_track(&self) -> Arc<MediaTrack> {
        synthetic::silent_audio_track(&self.synthetic)
    }

    /// Generated stand-in for `kind`
    pub fn synthetic_track(&self, kind: TrackKind) -> Arc<MediaTrack> {
        match kind {
            TrackKind::Audio => self.silent_audio_track(),
            TrackKind::Video => self.blank_video_track(),
        }
    }

    /// The live device capture of `kind`, if any
    #[must_use]
    pub fn active_capture(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.captures
            .lock()
            .slot(kind)
            .as_ref()
            .filter(|t| t.is_live())
            .cloned()
    }

    /// Stop every device capture
    pub fn release_all(&self) {
        let mut captures = self.captures.lock();
        for kind in TrackKind::ALL {
            if let Some(track) = captures.slot(kind).take() {
                track.stop();
            }
        }
    }
}
