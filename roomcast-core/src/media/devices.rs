use async_trait::async_trait;
use std::sync::Arc;

use super::synthetic::{gradient_video_track, tone_audio_track};
use super::track::MediaTrack;
use crate::config::MediaConstraints;
use crate::error::{Error, Result};
use crate::types::TrackKind;

/// Access to local capture hardware
///
/// Implementations open one capture of `kind` per call and hand back a live
/// track; the caller owns it from then on and releases it with
/// [`MediaTrack::stop`]. Permission denial and missing hardware are reported
/// as [`Error::DeviceUnavailable`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaTrack>>;
}

/// Generated capture devices for headless participants
///
/// Video is a moving gradient, audio a quiet 440 Hz tone. Either kind can be
/// marked absent to model a machine without that hardware.
#[derive(Debug, Clone)]
pub struct TestPatternDevices {
    audio: bool,
    video: bool,
}

impl Default for TestPatternDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPatternDevices {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    #[must_use]
    pub const fn with_kinds(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }
}

#[async_trait]
impl MediaDevices for TestPatternDevices {
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &MediaConstraints,
    ) -> Result<Arc<MediaTrack>> {
        match kind {
            TrackKind::Audio if self.audio => {
                Ok(tone_audio_track("test-pattern-microphone", 48_000, 20))
            }
            TrackKind::Video if self.video => Ok(gradient_video_track(
                "test-pattern-camera",
                constraints.video.width,
                constraints.video.height,
                constraints.video.frame_rate,
            )),
            _ => Err(Error::DeviceUnavailable {
                kind,
                reason: "no such device".to_string(),
            }),
        }
    }
}
