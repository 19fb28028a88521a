//! A single peer connection: browser-shaped signaling/connection state
//! machines over one UDP socket, with candidate gathering at construction
//! and a background connectivity checker once negotiation completes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, Instant};
use tracing::{debug, info, warn};

use super::ice::{
    self, CandidateType, IceCandidate, IceCredentials, Transport,
};
use super::sdp::{self, RemoteDescription, SdpType, SessionDescription};
use super::turn::IceServerConfig;
use super::CallError;

/// Consecutive missed keepalives before the connection is declared lost.
const KEEPALIVE_MAX_MISSES: u32 = 3;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub struct PeerConnection {
    socket: Arc<UdpSocket>,
    local_creds: IceCredentials,
    local_candidates: Vec<IceCandidate>,
    local_description: Option<SessionDescription>,
    remote: Option<RemoteDescription>,
    remote_candidates: Vec<IceCandidate>,
    signaling_state: SignalingState,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    checker: Option<JoinHandle<()>>,
    controlling: bool,
    tie_breaker: u64,
    session_id: u64,
}

impl PeerConnection {
    /// Binds the transport socket and gathers host plus (best effort)
    /// server-reflexive candidates.
    pub async fn new(config: &IceServerConfig, controlling: bool) -> Result<Self> {
        let socket = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .context("failed to bind call socket")?,
        );
        let host = ice::host_candidate(&socket)
            .await
            .context("host candidate gathering failed")?;
        let mut local_candidates = vec![host.clone()];

        if let Some(stun) = config.stun_host() {
            match ice::srflx_candidate(&socket, &stun, &host).await {
                Ok(Some(srflx)) => {
                    debug!("server-reflexive candidate {}:{}", srflx.address, srflx.port);
                    local_candidates.push(srflx);
                }
                Ok(None) => debug!("no NAT between us and {stun}"),
                Err(e) => debug!("server-reflexive gathering via {stun} failed: {e:#}"),
            }
        }

        let mut id_bytes = [0u8; 8];
        getrandom::getrandom(&mut id_bytes)
            .map_err(|e| anyhow::anyhow!("rng failure: {e}"))?;
        let tie_breaker = u64::from_be_bytes(id_bytes);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        Ok(PeerConnection {
            socket,
            local_creds: IceCredentials::generate()?,
            local_candidates,
            local_description: None,
            remote: None,
            remote_candidates: Vec::new(),
            signaling_state: SignalingState::Stable,
            state_tx,
            state_rx,
            checker: None,
            controlling,
            tie_breaker,
            session_id: tie_breaker >> 1,
        })
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn set_connection_state_for_tests(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    /// Remote candidates in the order they were applied.
    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }

    fn local_ip(&self) -> String {
        self.local_candidates
            .first()
            .map(|c| c.address.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    fn local_port(&self) -> u16 {
        self.local_candidates.first().map(|c| c.port).unwrap_or(9)
    }

    pub fn create_offer(&self, with_video: bool) -> Result<SessionDescription, CallError> {
        if self.signaling_state != SignalingState::Stable {
            return Err(CallError::InvalidState(self.signaling_state));
        }
        Ok(SessionDescription {
            kind: SdpType::Offer,
            sdp: sdp::build_description(
                self.session_id,
                &self.local_ip(),
                self.local_port(),
                &self.local_creds,
                with_video,
            ),
        })
    }

    pub fn create_answer(&self, with_video: bool) -> Result<SessionDescription, CallError> {
        if self.signaling_state != SignalingState::HaveRemoteOffer {
            return Err(CallError::InvalidState(self.signaling_state));
        }
        // Never answer with more media sections than offered.
        let offer_video = self.remote.as_ref().map(|r| r.has_video).unwrap_or(false);
        Ok(SessionDescription {
            kind: SdpType::Answer,
            sdp: sdp::build_description(
                self.session_id,
                &self.local_ip(),
                self.local_port(),
                &self.local_creds,
                with_video && offer_video,
            ),
        })
    }

    pub fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), CallError> {
        let next = match (self.signaling_state, desc.kind) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
            (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
            _ => return Err(CallError::InvalidState(self.signaling_state)),
        };
        self.local_description = Some(desc);
        self.signaling_state = next;
        self.maybe_start_checker();
        Ok(())
    }

    pub fn set_remote_description(&mut self, kind: SdpType, raw: &str) -> Result<(), CallError> {
        let next = match (self.signaling_state, kind) {
            (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            _ => return Err(CallError::InvalidState(self.signaling_state)),
        };
        let remote = sdp::parse_description(raw)?;
        self.remote = Some(remote);
        self.signaling_state = next;
        self.maybe_start_checker();
        Ok(())
    }

    /// Applies one trickled candidate. Requires the remote description;
    /// the caller buffers candidates that arrive earlier.
    pub fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        anyhow::ensure!(
            self.remote.is_some(),
            "candidate before remote description"
        );
        anyhow::ensure!(
            self.signaling_state != SignalingState::Closed,
            "connection is closed"
        );
        self.remote_candidates.push(candidate);
        self.maybe_start_checker();
        Ok(())
    }

    /// Spawns the connectivity checker once negotiation has produced both
    /// descriptions and at least one usable candidate. Runs at most once per
    /// connection.
    fn maybe_start_checker(&mut self) {
        if self.checker.is_some()
            || self.signaling_state != SignalingState::Stable
            || self.local_description.is_none()
        {
            return;
        }
        let Some(remote) = &self.remote else { return };
        let targets: Vec<IceCandidate> = self
            .remote_candidates
            .iter()
            .filter(|c| c.transport == Transport::Udp && c.component == 1)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let remote_creds = IceCredentials {
            ufrag: remote.ufrag.clone(),
            pwd: remote.pwd.clone(),
        };
        info!("starting connectivity checks against {s} candidate(s)", s = targets.len());
        self.checker = Some(tokio::spawn(run_checker(
            self.socket.clone(),
            targets,
            self.local_creds.clone(),
            remote_creds,
            self.controlling,
            self.tie_breaker,
            self.state_tx.clone(),
        )));
    }

    pub fn close(&mut self) {
        if let Some(checker) = self.checker.take() {
            checker.abort();
        }
        self.signaling_state = SignalingState::Closed;
        self.state_tx.send_replace(ConnectionState::Closed);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(checker) = self.checker.take() {
            checker.abort();
        }
    }
}

/// Checks candidates highest priority first, then keeps the selected pair
/// alive. Publishes state transitions on the watch channel.
async fn run_checker(
    socket: Arc<UdpSocket>,
    mut targets: Vec<IceCandidate>,
    local_creds: IceCredentials,
    remote_creds: IceCredentials,
    controlling: bool,
    tie_breaker: u64,
    state_tx: watch::Sender<ConnectionState>,
) {
    state_tx.send_replace(ConnectionState::Connecting);
    targets.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut selected: Option<SocketAddr> = None;
    for candidate in &targets {
        match ice::check_candidate(
            &socket,
            candidate.socket_addr(),
            &local_creds,
            &remote_creds,
            controlling,
            tie_breaker,
        )
        .await
        {
            Ok(addr) => {
                info!(
                    "selected {} candidate {addr}",
                    match candidate.candidate_type {
                        CandidateType::Host => "host",
                        CandidateType::ServerReflexive => "srflx",
                        CandidateType::PeerReflexive => "prflx",
                        CandidateType::Relay => "relay",
                    }
                );
                selected = Some(addr);
                break;
            }
            Err(e) => debug!("candidate {} unreachable: {e}", candidate.socket_addr()),
        }
    }

    let Some(peer_addr) = selected else {
        warn!("all {} remote candidate(s) failed connectivity checks", targets.len());
        state_tx.send_replace(ConnectionState::Failed);
        return;
    };
    state_tx.send_replace(ConnectionState::Connected);

    // Keepalive: a binding check every interval. Answer the peer's checks
    // between our own.
    let mut misses = 0u32;
    let mut buf = [0u8; 1500];
    loop {
        let next_check = Instant::now() + KEEPALIVE_INTERVAL;
        loop {
            let remaining = next_check.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(Ok((len, from))) = timeout(remaining, socket.recv_from(&mut buf)).await else {
                break;
            };
            if let Ok(msg) = ice::parse_message(&buf[..len]) {
                if msg.is_binding_request() {
                    ice::respond_to_request(&socket, &buf[..len], &msg, from, &local_creds).await;
                }
            }
        }
        match ice::check_candidate(
            &socket,
            peer_addr,
            &local_creds,
            &remote_creds,
            controlling,
            tie_breaker,
        )
        .await
        {
            Ok(_) => misses = 0,
            Err(_) => {
                misses += 1;
                debug!("keepalive miss {misses}/{KEEPALIVE_MAX_MISSES} for {peer_addr}");
                if misses >= KEEPALIVE_MAX_MISSES {
                    warn!("peer {peer_addr} stopped answering keepalives");
                    state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
                // Pull the next attempt forward rather than waiting a full
                // interval while the path is suspect.
                time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
