//! Peer call negotiation — SDP offer/answer, ICE connectivity, session state.
//!
//! The signaling server only relays envelopes; everything that turns two
//! studio participants into a live media path lives here.

pub mod ice;
pub mod peer;
pub mod sdp;
pub mod session;
pub mod turn;

use thiserror::Error;

use peer::SignalingState;

/// Errors callers need to branch on. Everything else is `anyhow`.
#[derive(Debug, Error)]
pub enum CallError {
    /// Camera/microphone acquisition failed. Fatal to starting a call or a
    /// recording; surfaced to the user, never retried.
    #[error("camera/microphone unavailable: {0}")]
    UserMediaDenied(String),

    /// A description was applied in a signaling state that forbids it.
    /// `PeerSession::apply_answer` retries on this to cover the window where
    /// the local offer has not finished committing.
    #[error("operation not valid in signaling state {0:?}")]
    InvalidState(SignalingState),

    /// A remote session description could not be parsed.
    #[error("malformed session description: {0}")]
    BadDescription(String),

    /// No capture encoding/timeslice combination the media source accepts.
    #[error("capture configuration not supported by the media source")]
    UnsupportedCaptureFormat,
}
