//! Generated media sources
//!
//! Blank video and silent audio keep an outbound sender's media flow alive
//! while the user has logically disabled that kind; some SFUs treat a track
//! that carries no frames at all as ended. The test-pattern variants stand in
//! for capture hardware in headless participants.

use bytes::Bytes;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::trace;

use super::track::{MediaSample, MediaTrack, TrackSource};
use crate::config::SyntheticConfig;
use crate::types::TrackKind;

/// Track carrying a constant solid-colour RGB frame at the configured low rate
pub fn blank_video_track(config: &SyntheticConfig) -> Arc<MediaTrack> {
    let track = MediaTrack::local(TrackKind::Video, TrackSource::Synthetic);
    let frame = solid_frame(config.width, config.height, config.color);
    let period = frame_period(config.frame_rate);
    spawn_generator(&track, period, move |_| frame.clone());
    track
}

/// Track carrying zeroed 16-bit mono PCM
pub fn silent_audio_track(config: &SyntheticConfig) -> Arc<MediaTrack> {
    let track = MediaTrack::local(TrackKind::Audio, TrackSource::Synthetic);
    let samples = samples_per_frame(config.audio_sample_rate, config.audio_frame_ms);
    let silence = Bytes::from(vec![0u8; samples * 2]);
    let period = Duration::from_millis(u64::from(config.audio_frame_ms.max(1)));
    spawn_generator(&track, period, move |_| silence.clone());
    track
}

/// Moving RGB gradient presented as a capture device
pub(crate) fn gradient_video_track(
    label: &str,
    width: u32,
    height: u32,
    frame_rate: u32,
) -> Arc<MediaTrack> {
    let track = MediaTrack::local(
        TrackKind::Video,
        TrackSource::Device {
            label: label.to_string(),
        },
    );
    spawn_generator(&track, frame_period(frame_rate), move |n| {
        gradient_frame(n, width, height)
    });
    track
}

/// 440 Hz tone presented as a capture device
pub(crate) fn tone_audio_track(label: &str, sample_rate: u32, frame_ms: u32) -> Arc<MediaTrack> {
    let track = MediaTrack::local(
        TrackKind::Audio,
        TrackSource::Device {
            label: label.to_string(),
        },
    );
    let samples = samples_per_frame(sample_rate, frame_ms);
    let period = Duration::from_millis(u64::from(frame_ms.max(1)));
    spawn_generator(&track, period, move |n| tone_frame(n, samples, sample_rate));
    track
}

/// Drive `track` with one sample per `period` until it stops or is dropped
fn spawn_generator<F>(track: &Arc<MediaTrack>, period: Duration, mut next_frame: F)
where
    F: FnMut(u64) -> Bytes + Send + 'static,
{
    let weak: Weak<MediaTrack> = Arc::downgrade(track);
    let stop = track.stop_token();
    let track_id = track.id().clone();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut frame_number = 0u64;

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(track) = weak.upgrade() else { break };
                    let sample = MediaSample {
                        payload: next_frame(frame_number),
                        duration: period,
                    };
                    if !track.push_sample(sample) {
                        break;
                    }
                    frame_number += 1;
                }
            }
        }

        trace!(track_id = %track_id, frames = frame_number, "Generator released");
    });
}

fn frame_period(frame_rate: u32) -> Duration {
    Duration::from_millis(1000 / u64::from(frame_rate.max(1)))
}

fn samples_per_frame(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as usize * frame_ms as usize) / 1000
}

fn solid_frame(width: u32, height: u32, color: [u8; 3]) -> Bytes {
    let pixels = width as usize * height as usize;
    let mut data = Vec::with_capacity(pixels * 3);
    for _ in 0..pixels {
        data.extend_from_slice(&color);
    }
    Bytes::from(data)
}

fn gradient_frame(frame_number: u64, width: u32, height: u32) -> Bytes {
    let mut data = vec![0u8; width as usize * height as usize * 3];
    let base = (frame_number % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }
    Bytes::from(data)
}

fn tone_frame(frame_number: u64, samples: usize, sample_rate: u32) -> Bytes {
    let mut data = Vec::with_capacity(samples * 2);
    let rate = f64::from(sample_rate.max(1));
    for i in 0..samples {
        let t = (frame_number as f64).mul_add(samples as f64, i as f64) / rate;
        let value =
            ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 0.3 * f64::from(i16::MAX)) as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(data)
}
