//! Signaling transport: the envelope schema shared with the server and a
//! reconnect-forever runner that surfaces lifecycle events to the studio
//! loop.
//!
//! Sends are fire-and-forget: an envelope handed over while the socket is
//! down is dropped, not queued. The layers that must survive that window
//! (offer/answer delivery) run their own resend timers.

pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, warn};

use websocket::SignalSocket;

/// Fixed reconnect delay. Deliberately not a backoff: a studio page sits
/// open for hours and should come back quickly after a server restart.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Connected,
    JoinPodcast,
    PodcastJoined,
    UserJoined,
    UserLeft,
    Ready,
    BothReady,
    Offer,
    Answer,
    IceCandidate,
    StartRecording,
    StopRecording,
    RecordingStarted,
    RecordingStopped,
    LeavePodcast,
}

/// The wire envelope. Every field except `type` is optional on the wire;
/// which ones are present depends on the message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(rename = "podcastId", skip_serializing_if = "Option::is_none")]
    pub podcast_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Envelope {
            kind,
            podcast_id: None,
            from: None,
            to: None,
            payload: None,
            timestamp: None,
        }
    }

    pub fn podcast(mut self, podcast_id: &str) -> Self {
        self.podcast_id = Some(podcast_id.to_string());
        self
    }

    pub fn to(mut self, target: &str) -> Self {
        self.to = Some(target.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(chrono::Utc::now().timestamp_millis());
        self
    }

    /// String field from the payload object, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }

    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.as_ref()?.get(key)?.as_bool()
    }
}

#[derive(Debug)]
pub enum SignalingEvent {
    /// Socket (re)established. The server follows up with `connected`.
    Open,
    Envelope(Envelope),
    /// Socket lost; the runner is already waiting to reconnect.
    Closed,
}

/// Cheap cloneable sender half. `send` drops silently while the socket is
/// down, matching send-on-closed-socket semantics in the protocol.
#[derive(Clone)]
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<Envelope>,
    open: Arc<AtomicBool>,
}

impl SignalingHandle {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn send(&self, envelope: Envelope) {
        if !self.is_open() {
            debug!("signaling closed, dropping {:?} envelope", envelope.kind);
            return;
        }
        // The runner only drops the receiver on shutdown.
        let _ = self.outbound.send(envelope);
    }

    /// Handle wired to a plain channel instead of a socket, for exercising
    /// callers without a server.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = SignalingHandle {
            outbound,
            open: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    #[cfg(test)]
    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

/// Starts the transport task. The returned receiver yields lifecycle events
/// and inbound envelopes; dropping it stops the task.
pub fn connect(url: &str) -> (SignalingHandle, mpsc::UnboundedReceiver<SignalingEvent>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(false));
    let handle = SignalingHandle {
        outbound: outbound_tx,
        open: open.clone(),
    };
    tokio::spawn(run(url.to_string(), open, outbound_rx, event_tx));
    (handle, event_rx)
}

async fn run(
    url: String,
    open: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    loop {
        match SignalSocket::connect(&url).await {
            Ok(mut socket) => {
                // Envelopes that slipped into the queue while we were down
                // belong to a dead connection. Drop them.
                while outbound.try_recv().is_ok() {}
                open.store(true, Ordering::SeqCst);
                if events.send(SignalingEvent::Open).is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        frame = socket.recv() => match frame {
                            Ok(Some(text)) => match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => {
                                    if events.send(SignalingEvent::Envelope(envelope)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("unparseable signaling message: {e} ({text})"),
                            },
                            Ok(None) => break,
                            Err(e) => {
                                warn!("signaling receive error: {e:#}");
                                break;
                            }
                        },
                        queued = outbound.recv() => match queued {
                            Some(envelope) => {
                                if let Err(e) = socket.send_json(&envelope).await {
                                    warn!("signaling send failed: {e:#}");
                                    break;
                                }
                            }
                            // All handles dropped; nothing left to do.
                            None => return,
                        },
                    }
                }

                open.store(false, Ordering::SeqCst);
                if events.send(SignalingEvent::Closed).is_err() {
                    return;
                }
            }
            Err(e) => warn!("signaling connect failed: {e:#}"),
        }
        time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::IceCandidate).unwrap(),
            "\"ice-candidate\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::JoinPodcast).unwrap(),
            "\"join-podcast\""
        );
        let parsed: MessageType = serde_json::from_str("\"recording-started\"").unwrap();
        assert_eq!(parsed, MessageType::RecordingStarted);
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::new(MessageType::Offer)
            .podcast("pod-1")
            .to("user-b")
            .with_payload(json!({"sdp": "v=0"}))
            .stamped();
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.contains("\"type\":\"offer\""));
        assert!(text.contains("\"podcastId\":\"pod-1\""));
        assert!(!text.contains("\"from\""));

        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, MessageType::Offer);
        assert_eq!(back.payload_str("sdp"), Some("v=0"));
    }

    #[test]
    fn test_server_envelope_parses() {
        let text = r#"{"type":"both-ready","podcastId":"p","payload":{"shouldInitiate":true,"targetUserId":"u2"}}"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.kind, MessageType::BothReady);
        assert_eq!(envelope.payload_bool("shouldInitiate"), Some(true));
        assert_eq!(envelope.payload_str("targetUserId"), Some("u2"));
    }

    #[test]
    fn test_closed_handle_drops_sends() {
        let (handle, mut rx) = SignalingHandle::test_pair();
        handle.set_open(false);
        handle.send(Envelope::new(MessageType::Ready));
        assert!(rx.try_recv().is_err());

        handle.set_open(true);
        handle.send(Envelope::new(MessageType::Ready));
        assert_eq!(rx.try_recv().unwrap().kind, MessageType::Ready);
    }
}
