//! Offer/answer state machine around one peer connection
//!
//! A [`PeerNegotiator`] serves exactly one role. At most one offer/answer
//! cycle is outstanding at a time: a second attempt while one is in flight is
//! rejected with [`Error::NegotiationInProgress`] rather than queued.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::MediaTrack;
use crate::rtc::{
    media_ids, IceCandidate, NegotiationConstraints, NegotiatorRole, PeerConnection,
    SessionDescription,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    /// Local description being produced
    OfferPending,
    /// Offer handed to signaling, waiting for the answer
    OfferSent,
    AnswerApplied,
    Failed,
    Closed,
}

pub struct PeerNegotiator {
    role: NegotiatorRole,
    connection: Arc<dyn PeerConnection>,
    state: Mutex<NegotiationState>,
    outbound: Mutex<Vec<Arc<MediaTrack>>>,
    /// Candidates that arrived before any remote description
    pending_candidates: Mutex<Vec<IceCandidate>>,
    has_remote: AtomicBool,
    closed: AtomicBool,
}

impl PeerNegotiator {
    pub fn new(role: NegotiatorRole, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            role,
            connection,
            state: Mutex::new(NegotiationState::Idle),
            outbound: Mutex::new(Vec::new()),
            pending_candidates: Mutex::new(Vec::new()),
            has_remote: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn role(&self) -> NegotiatorRole {
        self.role
    }

    #[must_use]
    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    /// Move to `OfferPending`, or say why not. Only an answering negotiator
    /// may start a cycle again after one completed.
    fn begin_cycle(&self, renegotiate: bool) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            NegotiationState::Idle => {
                *state = NegotiationState::OfferPending;
                Ok(())
            }
            NegotiationState::AnswerApplied if renegotiate => {
                *state = NegotiationState::OfferPending;
                Ok(())
            }
            NegotiationState::OfferPending | NegotiationState::OfferSent => {
                Err(Error::NegotiationInProgress)
            }
            other => Err(Error::NegotiationFailed(format!(
                "{} negotiator is {other:?}",
                self.role
            ))),
        }
    }

    fn fail(&self, reason: impl std::fmt::Display) -> Error {
        let mut state = self.state.lock();
        if *state != NegotiationState::Closed {
            *state = NegotiationState::Failed;
        }
        warn!(role = %self.role, error = %reason, "Negotiation failed");
        Error::NegotiationFailed(reason.to_string())
    }

    pub async fn create_offer(
        &self,
        constraints: &NegotiationConstraints,
    ) -> Result<SessionDescription> {
        self.begin_cycle(false)?;
        match self.connection.create_offer(constraints).await {
            Ok(offer) => {
                debug!(role = %self.role, "Local offer created");
                Ok(offer)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Record that the pending offer has been handed to signaling
    pub fn offer_sent(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != NegotiationState::OfferPending {
            return Err(Error::NegotiationFailed(format!("no pending offer in state {:?}", *state)));
        }
        *state = NegotiationState::OfferSent;
        Ok(())
    }

    pub async fn apply_remote_answer(&self, answer: SessionDescription) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != NegotiationState::OfferSent {
                return Err(Error::UnexpectedAnswer { state: *state });
            }
        }
        if answer.is_offer() {
            return Err(self.fail("remote sent an offer where an answer was expected"));
        }

        if let Err(e) = self.connection.set_remote_description(answer).await {
            return Err(self.fail(e));
        }
        self.flush_candidates().await;

        let mut state = self.state.lock();
        if *state == NegotiationState::OfferSent {
            *state = NegotiationState::AnswerApplied;
        }
        info!(role = %self.role, "Remote answer applied");
        Ok(())
    }

    /// Answer an offer from the SFU. `expected_mids` are the media lines
    /// recorded when the feed was discovered; others are logged.
    pub async fn create_answer(
        &self,
        remote_offer: SessionDescription,
        constraints: &NegotiationConstraints,
        expected_mids: &[String],
    ) -> Result<SessionDescription> {
        if !remote_offer.is_offer() {
            return Err(Error::NegotiationFailed("remote description is not an offer".to_string()));
        }
        self.begin_cycle(true)?;

        for mid in media_ids(&remote_offer.sdp) {
            if !expected_mids.contains(&mid) {
                debug!(
                    role = %self.role,
                    mid = %mid,
                    "Offer carries a media line not advertised by the feed"
                );
            }
        }

        if let Err(e) = self.connection.set_remote_description(remote_offer).await {
            return Err(self.fail(e));
        }
        self.flush_candidates().await;

        let answer = match self.connection.create_answer(constraints).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e)),
        };

        let mut state = self.state.lock();
        if *state == NegotiationState::OfferPending {
            *state = NegotiationState::AnswerApplied;
        }
        debug!(role = %self.role, "Local answer created");
        Ok(answer)
    }

    pub async fn add_outbound_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NegotiationFailed("negotiator closed".to_string()));
        }
        self.connection.add_track(Arc::clone(&track)).await?;
        self.outbound.lock().push(track);
        Ok(())
    }

    /// Swap the outbound track of the same kind on the live connection.
    ///
    /// The previous track may already have ended; it is not stopped here.
    pub async fn replace_outbound_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NegotiationFailed("negotiator closed".to_string()));
        }
        let kind = track.kind();
        self.connection.replace_track(kind, Arc::clone(&track)).await?;

        let mut outbound = self.outbound.lock();
        match outbound.iter().position(|t| t.kind() == kind) {
            Some(pos) => outbound[pos] = track,
            None => outbound.push(track),
        }
        Ok(())
    }

    #[must_use]
    pub fn outbound_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.outbound.lock().clone()
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.has_remote.load(Ordering::Acquire) {
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await
    }

    async fn flush_candidates(&self) {
        self.has_remote.store(true, Ordering::Release);
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!(role = %self.role, error = %e, "Failed to apply buffered candidate");
            }
        }
    }

    /// Stop attached tracks and release the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = NegotiationState::Closed;

        let outbound = std::mem::take(&mut *self.outbound.lock());
        for track in outbound {
            track.stop();
        }
        if let Err(e) = self.connection.close().await {
            warn!(role = %self.role, error = %e, "Peer connection close failed");
        }
        debug!(role = %self.role, "Negotiator closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
