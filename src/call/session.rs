//! One negotiation with one remote participant: owns the peer connection,
//! sends the offer/answer over signaling, and handles the arrival-order
//! rules for answers and trickled candidates.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::media::LocalMedia;
use crate::signaling::{Envelope, MessageType, SignalingHandle};

use super::ice::{CandidateBuffer, IceCandidate};
use super::peer::{ConnectionState, PeerConnection, SignalingState};
use super::sdp::SdpType;
use super::turn::IceServerConfig;
use super::CallError;

/// Cadence for both the send-until-open offer/answer loop and the
/// answer-before-offer-committed retry.
const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Attempts for applying an answer that races the local offer.
const ANSWER_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Negotiating(Role),
    Connected,
    Closed,
}

pub struct PeerSession {
    remote_id: String,
    phase: Phase,
    peer: PeerConnection,
    resend: Option<JoinHandle<()>>,
}

impl PeerSession {
    /// Offerer path: create the connection, send the offer (retrying until
    /// the signaling socket is open), trickle local candidates.
    pub async fn start_call(
        config: &IceServerConfig,
        podcast_id: &str,
        remote_id: &str,
        media: &LocalMedia,
        signaling: &SignalingHandle,
    ) -> Result<Self> {
        let mut peer = PeerConnection::new(config, true).await?;
        let offer = peer.create_offer(media.has_video())?;
        peer.set_local_description(offer.clone())?;
        info!("calling {remote_id}");

        let envelope = Envelope::new(MessageType::Offer)
            .podcast(podcast_id)
            .to(remote_id)
            .with_payload(json!({ "sdp": offer.sdp }))
            .stamped();
        let resend = send_until_open(signaling.clone(), envelope);
        trickle_candidates(&peer, podcast_id, remote_id, signaling);

        Ok(PeerSession {
            remote_id: remote_id.to_string(),
            phase: Phase::Negotiating(Role::Offerer),
            peer,
            resend: Some(resend),
        })
    }

    /// Answerer path: apply the offer, drain any candidates that arrived
    /// before it, send the answer back with the same retry behavior.
    pub async fn answer_offer(
        config: &IceServerConfig,
        podcast_id: &str,
        offer: &Envelope,
        media: &LocalMedia,
        signaling: &SignalingHandle,
        buffered: &mut CandidateBuffer,
    ) -> Result<Self> {
        let remote_id = offer
            .from
            .clone()
            .context("offer envelope without a sender")?;
        let sdp = offer
            .payload_str("sdp")
            .context("offer envelope without an sdp payload")?;

        let mut peer = PeerConnection::new(config, false).await?;
        peer.set_remote_description(SdpType::Offer, sdp)?;
        apply_buffered(&mut peer, buffered);

        let answer = peer.create_answer(media.has_video())?;
        peer.set_local_description(answer.clone())?;
        info!("answering {remote_id}");

        let envelope = Envelope::new(MessageType::Answer)
            .podcast(podcast_id)
            .to(&remote_id)
            .with_payload(json!({ "sdp": answer.sdp }))
            .stamped();
        let resend = send_until_open(signaling.clone(), envelope);
        trickle_candidates(&peer, podcast_id, &remote_id, signaling);

        Ok(PeerSession {
            remote_id,
            phase: Phase::Negotiating(Role::Answerer),
            peer,
            resend: Some(resend),
        })
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn has_remote_description(&self) -> bool {
        self.peer.has_remote_description()
    }

    pub fn subscribe_connection(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.peer.subscribe()
    }

    /// An incoming offer is a duplicate (not a renegotiation) when we are
    /// already stable and ICE is still working on the current attempt.
    pub fn should_ignore_offer(&self) -> bool {
        self.peer.signaling_state() == SignalingState::Stable
            && matches!(
                self.peer.connection_state(),
                ConnectionState::New | ConnectionState::Connecting
            )
    }

    /// Applies the remote answer. An answer can overtake our own offer
    /// commit, so an invalid-state rejection is retried a few times before
    /// giving up.
    pub async fn apply_answer(
        &mut self,
        answer: &Envelope,
        buffered: &mut CandidateBuffer,
    ) -> Result<()> {
        if self.phase != Phase::Negotiating(Role::Offerer) {
            bail!("answer received while {:?}", self.phase);
        }
        let sdp = answer
            .payload_str("sdp")
            .context("answer envelope without an sdp payload")?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.peer.set_remote_description(SdpType::Answer, sdp) {
                Ok(()) => break,
                Err(CallError::InvalidState(state)) if attempt < ANSWER_MAX_ATTEMPTS => {
                    debug!(
                        "answer not applicable in {state:?}, retry {attempt}/{ANSWER_MAX_ATTEMPTS}"
                    );
                    time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e).context("failed to apply answer"),
            }
        }

        // The offer got through; stop re-offering.
        self.cancel_resend();
        apply_buffered(&mut self.peer, buffered);
        Ok(())
    }

    pub fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_remote_candidate(candidate) {
            warn!("dropping unusable candidate from {}: {e:#}", self.remote_id);
        }
    }

    /// Called when the connection watch reports `Connected`.
    pub fn mark_connected(&mut self) {
        if self.phase != Phase::Closed {
            self.phase = Phase::Connected;
        }
    }

    pub fn close(&mut self) {
        self.cancel_resend();
        self.peer.close();
        self.phase = Phase::Closed;
    }

    #[cfg(test)]
    pub(crate) fn set_connection_state_for_tests(&self, state: ConnectionState) {
        self.peer.set_connection_state_for_tests(state);
    }

    fn cancel_resend(&mut self) {
        if let Some(resend) = self.resend.take() {
            resend.abort();
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel_resend();
    }
}

fn apply_buffered(peer: &mut PeerConnection, buffered: &mut CandidateBuffer) {
    let pending = buffered.drain();
    if !pending.is_empty() {
        debug!("applying {} buffered candidate(s)", pending.len());
    }
    for candidate in pending {
        if let Err(e) = peer.add_remote_candidate(candidate) {
            warn!("dropping buffered candidate: {e:#}");
        }
    }
}

/// Critical envelopes (offer/answer) must survive a signaling outage: retry
/// on a fixed timer until the socket is open, then send exactly once.
fn send_until_open(signaling: SignalingHandle, envelope: Envelope) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if signaling.is_open() {
                signaling.send(envelope);
                return;
            }
            debug!("signaling closed, retrying {:?} shortly", envelope.kind);
            time::sleep(RETRY_DELAY).await;
        }
    })
}

/// Local candidates go out as individual envelopes with no retry; the
/// periodic re-offer after a reconnect regenerates the negotiation anyway.
fn trickle_candidates(
    peer: &PeerConnection,
    podcast_id: &str,
    remote_id: &str,
    signaling: &SignalingHandle,
) {
    for candidate in peer.local_candidates() {
        signaling.send(
            Envelope::new(MessageType::IceCandidate)
                .podcast(podcast_id)
                .to(remote_id)
                .with_payload(json!({
                    "candidate": candidate.to_sdp_line(),
                    "sdpMid": "0",
                    "sdpMLineIndex": 0,
                }))
                .stamped(),
        );
    }
}
