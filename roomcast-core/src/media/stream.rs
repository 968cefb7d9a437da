use parking_lot::RwLock;
use std::sync::Arc;

use super::track::MediaTrack;
use crate::types::{TrackId, TrackKind};

/// Aggregate of the tracks currently attached to one participant
///
/// Cloning shares the same underlying set.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Arc<RwLock<Vec<Arc<MediaTrack>>>>,
}

impl MediaStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a track. Returns false if a track with the same id is present.
    pub fn add_track(&self, track: Arc<MediaTrack>) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    /// Detach a track without stopping it
    pub fn remove_track(&self, id: &TrackId) -> Option<Arc<MediaTrack>> {
        let mut tracks = self.tracks.write();
        let pos = tracks.iter().position(|t| t.id() == id)?;
        Some(tracks.remove(pos))
    }

    /// Replace `old` with `new` in place, keeping the stream's track order
    pub fn swap_track(&self, old: &TrackId, new: Arc<MediaTrack>) {
        let mut tracks = self.tracks.write();
        match tracks.iter().position(|t| t.id() == old) {
            Some(pos) => tracks[pos] = new,
            None => tracks.push(new),
        }
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    #[must_use]
    pub fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn audio_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    #[must_use]
    pub fn video_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    #[must_use]
    pub fn contains(&self, id: &TrackId) -> bool {
        self.tracks.read().iter().any(|t| t.id() == id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    /// Stop and detach every track
    pub fn stop_all(&self) {
        let tracks = std::mem::take(&mut *self.tracks.write());
        for track in tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;

    #[test]
    fn test_add_rejects_duplicates() {
        let stream = MediaStream::new();
        let track = MediaTrack::remote(TrackId::from("a"), TrackKind::Audio, None);
        assert!(stream.add_track(Arc::clone(&track)));
        assert!(!stream.add_track(track));
        assert_eq!(stream.len(), 1);
    }

    #[test]
    fn test_swap_keeps_position() {
        let stream = MediaStream::new();
        let audio = MediaTrack::local(TrackKind::Audio, TrackSource::Synthetic);
        let video = MediaTrack::local(TrackKind::Video, TrackSource::Synthetic);
        stream.add_track(Arc::clone(&audio));
        stream.add_track(Arc::clone(&video));

        let replacement = MediaTrack::local(TrackKind::Audio, TrackSource::Synthetic);
        stream.swap_track(audio.id(), Arc::clone(&replacement));

        let tracks = stream.tracks();
        assert_eq!(tracks[0].id(), replacement.id());
        assert_eq!(tracks[1].id(), video.id());
    }

    #[test]
    fn test_stop_all_empties_and_stops() {
        let stream = MediaStream::new();
        let track = MediaTrack::local(TrackKind::Video, TrackSource::Synthetic);
        stream.add_track(Arc::clone(&track));
        stream.stop_all();
        assert!(stream.is_empty());
        assert!(track.is_ended());
    }
}
