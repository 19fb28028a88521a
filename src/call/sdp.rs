//! Minimal SDP generation and parsing. Only the fields the negotiation
//! actually consumes are modeled: ICE credentials and the media sections.
//! Candidates are trickled over signaling, never embedded in the description.

use anyhow::Result;

use super::ice::IceCredentials;
use super::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: String,
}

/// What we extract from a remote description.
#[derive(Debug, Clone)]
pub struct RemoteDescription {
    pub ufrag: String,
    pub pwd: String,
    pub has_video: bool,
}

/// Opus audio, VP8 video — matching the payload types the capture side
/// advertises.
const AUDIO_PT: u8 = 111;
const VIDEO_PT: u8 = 96;

pub fn build_description(
    session_id: u64,
    local_ip: &str,
    port: u16,
    creds: &IceCredentials,
    with_video: bool,
) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- {session_id} 2 IN IP4 {local_ip}\r\n"));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");
    if with_video {
        sdp.push_str("a=group:BUNDLE 0 1\r\n");
    } else {
        sdp.push_str("a=group:BUNDLE 0\r\n");
    }

    sdp.push_str(&format!("m=audio {port} UDP/RTP/AVP {AUDIO_PT}\r\n"));
    sdp.push_str(&format!("c=IN IP4 {local_ip}\r\n"));
    sdp.push_str(&format!("a=ice-ufrag:{}\r\n", creds.ufrag));
    sdp.push_str(&format!("a=ice-pwd:{}\r\n", creds.pwd));
    sdp.push_str("a=mid:0\r\n");
    sdp.push_str("a=sendrecv\r\n");
    sdp.push_str("a=rtcp-mux\r\n");
    sdp.push_str(&format!("a=rtpmap:{AUDIO_PT} opus/48000/2\r\n"));

    if with_video {
        // Bundled onto the same transport, so the port repeats.
        sdp.push_str(&format!("m=video {port} UDP/RTP/AVP {VIDEO_PT}\r\n"));
        sdp.push_str(&format!("c=IN IP4 {local_ip}\r\n"));
        sdp.push_str(&format!("a=ice-ufrag:{}\r\n", creds.ufrag));
        sdp.push_str(&format!("a=ice-pwd:{}\r\n", creds.pwd));
        sdp.push_str("a=mid:1\r\n");
        sdp.push_str("a=sendrecv\r\n");
        sdp.push_str("a=rtcp-mux\r\n");
        sdp.push_str(&format!("a=rtpmap:{VIDEO_PT} VP8/90000\r\n"));
    }
    sdp
}

/// Pulls ICE credentials and media layout out of a remote description.
/// Session-level and first-media-level credentials are both accepted.
pub fn parse_description(sdp: &str) -> Result<RemoteDescription, CallError> {
    let mut ufrag = None;
    let mut pwd = None;
    let mut has_video = false;

    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            ufrag.get_or_insert_with(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
            pwd.get_or_insert_with(|| value.to_string());
        } else if line.starts_with("m=video") {
            has_video = true;
        }
    }

    match (ufrag, pwd) {
        (Some(ufrag), Some(pwd)) => Ok(RemoteDescription {
            ufrag,
            pwd,
            has_video,
        }),
        (None, _) => Err(CallError::BadDescription("missing a=ice-ufrag".into())),
        (_, None) => Err(CallError::BadDescription("missing a=ice-pwd".into())),
    }
}
