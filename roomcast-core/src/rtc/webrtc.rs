//! Peer connections backed by the `webrtc` crate
//!
//! Each outbound kind gets one `TrackLocalStaticSample` sender for the life
//! of the connection. A pump task copies samples from the attached
//! [`MediaTrack`] into it; replacing the track swaps the pump, so the sender
//! itself never changes and no renegotiation is needed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    IceCandidate, NegotiationConstraints, NegotiatorRole, PeerConnection, PeerConnectionFactory,
    PeerConnectionState, PeerEvent, PeerEventHandler, SdpType, SessionDescription,
};
use crate::config::IceServer;
use crate::error::{Error, Result};
use crate::media::{MediaSample, MediaTrack};
use crate::types::{TrackId, TrackKind};

/// Builds peer connections sharing one codec and interceptor setup
pub struct WebRtcPeerFactory {
    api: API,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        role: NegotiatorRole,
        ice_servers: &[IceServer],
        on_event: PeerEventHandler,
    ) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let connection = WebRtcPeerConnection {
            role,
            pc,
            senders: Mutex::new(Senders::default()),
            closed: CancellationToken::new(),
        };
        connection.install_handlers(on_event);

        debug!(role = %role, "Peer connection created");
        Ok(Arc::new(connection))
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn codec_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

struct OutboundSender {
    local: Arc<TrackLocalStaticSample>,
    pump: CancellationToken,
}

#[derive(Default)]
struct Senders {
    audio: Option<OutboundSender>,
    video: Option<OutboundSender>,
}

impl Senders {
    fn slot(&mut self, kind: TrackKind) -> &mut Option<OutboundSender> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }
}

pub struct WebRtcPeerConnection {
    role: NegotiatorRole,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Senders>,
    closed: CancellationToken,
}

impl WebRtcPeerConnection {
    fn install_handlers(&self, on_event: PeerEventHandler) {
        let handler = Arc::clone(&on_event);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        handler(PeerEvent::LocalCandidate(None));
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => handler(PeerEvent::LocalCandidate(Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }))),
                        Err(e) => warn!(error = %e, "Failed to encode local candidate"),
                    }
                })
            }));

        let handler = Arc::clone(&on_event);
        let role = self.role;
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(role = %role, state = %state, "Peer connection state changed");
                let state = match state {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        PeerConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                    RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                };
                handler(PeerEvent::ConnectionState(state));
                Box::pin(async {})
            }));

        let handler = on_event;
        let closed = self.closed.clone();
        self.pc.on_track(Box::new(
            move |source: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match source.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    RTPCodecType::Unspecified => None,
                };
                if let Some(kind) = kind {
                    let mid = transceiver.mid().map(|m| m.to_string());
                    let track = MediaTrack::remote(TrackId::new(source.id()), kind, mid.clone());

                    debug!(
                        track_id = %track.id(),
                        kind = %kind,
                        mid = ?mid,
                        "Remote track received"
                    );
                    handler(PeerEvent::TrackAdded {
                        track: Arc::clone(&track),
                        mid,
                    });

                    tokio::spawn(read_remote(source, track, Arc::clone(&handler), closed.clone()));
                }
                Box::pin(async {})
            },
        ));
    }

    fn sdp_type(description: &RTCSessionDescription) -> Result<SdpType> {
        match description.sdp_type {
            RTCSdpType::Offer => Ok(SdpType::Offer),
            RTCSdpType::Answer => Ok(SdpType::Answer),
            other => Err(Error::Rtc(format!("unsupported description type {other}"))),
        }
    }

    /// Install `description` locally and return what the connection settled on
    async fn install_local(
        &self,
        description: RTCSessionDescription,
        trickle: bool,
    ) -> Result<SessionDescription> {
        let gathered = if trickle {
            None
        } else {
            Some(self.pc.gathering_complete_promise().await)
        };

        self.pc.set_local_description(description).await?;

        if let Some(mut gathered) = gathered {
            let _ = gathered.recv().await;
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Rtc("local description missing after install".to_string()))?;
        Ok(SessionDescription {
            sdp_type: Self::sdp_type(&local)?,
            sdp: local.sdp,
        })
    }

    async fn ensure_receiver(&self, kind: RTPCodecType) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        let kind = track.kind();
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_capability(kind),
            kind.as_str().to_string(),
            "roomcast".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let pump = spawn_pump(Arc::clone(&local), &track, self.closed.child_token());
        let previous = self.senders.lock().slot(kind).replace(OutboundSender { local, pump });
        if let Some(previous) = previous {
            previous.pump.cancel();
        }

        debug!(role = %self.role, kind = %kind, track_id = %track.id(), "Outbound track attached");
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<()> {
        let mut senders = self.senders.lock();
        let sender = senders
            .slot(kind)
            .as_mut()
            .ok_or_else(|| Error::Rtc(format!("no {kind} sender to replace")))?;

        let pump = spawn_pump(Arc::clone(&sender.local), &track, self.closed.child_token());
        let previous = std::mem::replace(&mut sender.pump, pump);
        previous.cancel();

        trace!(kind = %kind, track_id = %track.id(), "Outbound source replaced");
        Ok(())
    }

    async fn create_offer(
        &self,
        constraints: &NegotiationConstraints,
    ) -> Result<SessionDescription> {
        let (has_audio, has_video) = {
            let mut senders = self.senders.lock();
            (
                senders.slot(TrackKind::Audio).is_some(),
                senders.slot(TrackKind::Video).is_some(),
            )
        };
        if constraints.receive_audio && !has_audio {
            self.ensure_receiver(RTPCodecType::Audio).await?;
        }
        if constraints.receive_video && !has_video {
            self.ensure_receiver(RTPCodecType::Video).await?;
        }

        let offer = self.pc.create_offer(None).await?;
        self.install_local(offer, constraints.trickle).await
    }

    async fn create_answer(
        &self,
        constraints: &NegotiationConstraints,
    ) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.install_local(answer, constraints.trickle).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.pc.close().await?;
        debug!(role = %self.role, "Peer connection closed");
        Ok(())
    }
}

impl Drop for WebRtcPeerConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Copy samples from `track` into `local` until the returned token is cancelled
fn spawn_pump(
    local: Arc<TrackLocalStaticSample>,
    track: &Arc<MediaTrack>,
    cancel: CancellationToken,
) -> CancellationToken {
    let token = cancel.clone();
    let mut samples = track.subscribe();
    let stopped = track.stop_token();
    let track_id = track.id().clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = stopped.cancelled() => break,
                received = samples.recv() => match received {
                    Ok(sample) => {
                        let sample = Sample {
                            data: sample.payload,
                            duration: sample.duration,
                            ..Default::default()
                        };
                        if let Err(e) = local.write_sample(&sample).await {
                            trace!(track_id = %track_id, error = %e, "Sample write failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(track_id = %track_id, skipped, "Outbound pump lagging");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        trace!(track_id = %track_id, "Outbound pump released");
    });

    token
}

/// Forward RTP payloads of a remote track until it ends or the connection closes
async fn read_remote(
    source: Arc<TrackRemote>,
    track: Arc<MediaTrack>,
    on_event: PeerEventHandler,
    closed: CancellationToken,
) {
    let stopped = track.stop_token();
    loop {
        tokio::select! {
            biased;
            () = closed.cancelled() => return,
            () = stopped.cancelled() => return,
            read = source.read_rtp() => match read {
                Ok((packet, _)) => {
                    track.push_sample(MediaSample {
                        payload: packet.payload,
                        duration: Duration::ZERO,
                    });
                }
                Err(e) => {
                    debug!(track_id = %track.id(), error = %e, "Remote track ended");
                    break;
                }
            },
        }
    }
    on_event(PeerEvent::TrackRemoved {
        track_id: track.id().clone(),
    });
}
