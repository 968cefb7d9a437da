//! Local and remote media: tracks, streams, capture and generated sources

mod controller;
mod devices;
mod stream;
mod synthetic;
mod track;

pub use controller::{LocalMedia, MediaSourceController};
#[cfg(test)]
pub use devices::MockMediaDevices;
pub use devices::{MediaDevices, TestPatternDevices};
pub use stream::MediaStream;
pub use synthetic::{blank_video_track, silent_audio_track};
pub use track::{MediaSample, MediaTrack, TrackSource};
