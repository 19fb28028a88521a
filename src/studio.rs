//! The studio loop: one task owning all call and recording state, driven by
//! signaling events, peer connection state changes, captured chunks, and
//! console commands through a single `select!`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::call::ice::{self, CandidateBuffer};
use crate::call::peer::ConnectionState;
use crate::call::session::PeerSession;
use crate::call::turn::{self, IceServerConfig};
use crate::config::Config;
use crate::media::{LocalMedia, MediaOptions, TrackKind};
use crate::recording::capture::{CapturedChunk, ChunkCapture};
use crate::recording::upload::{ChunkUploader, UploadOutcome};
use crate::recording::RecordingSession;
use crate::signaling::{self, Envelope, MessageType, SignalingEvent, SignalingHandle};

/// Host recording commands are ignored while a previous one is settling.
const CONTROL_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StudioOpts {
    pub podcast_id: String,
    pub user_id: String,
    pub with_video: bool,
    pub deny_media: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Record,
    Stop,
    Mute,
    Video,
    Leave,
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        match line.trim().to_ascii_lowercase().as_str() {
            "record" | "r" => Some(Command::Record),
            "stop" | "s" => Some(Command::Stop),
            "mute" | "m" => Some(Command::Mute),
            "video" | "v" => Some(Command::Video),
            "leave" | "quit" | "q" => Some(Command::Leave),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Joins the studio and runs until the user leaves or the transport dies.
pub async fn run(config: &Config, opts: StudioOpts) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let ice_config = turn::fetch_ice_servers(&http, &config.api_base_url).await;
    let uploader = ChunkUploader::new(http, &config.upload_base_url, &opts.podcast_id);
    let (signaling, events) = signaling::connect(&config.signaling_url);

    let (chunk_tx, chunk_rx) = mpsc::channel(8);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    spawn_command_reader(command_tx);
    println!("commands: record, stop, mute, video, leave");

    let studio = Studio::new(
        signaling,
        uploader,
        ice_config,
        opts,
        config.app_base_url.clone(),
        chunk_tx,
    );
    studio.run(events, command_rx, chunk_rx).await
}

fn spawn_command_reader(commands: mpsc::UnboundedSender<Command>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match Command::parse(&line) {
                Some(command) => {
                    if commands.send(command).is_err() {
                        return;
                    }
                }
                None => {
                    if !line.trim().is_empty() {
                        println!("commands: record, stop, mute, video, leave");
                    }
                }
            }
        }
    });
}

struct Studio {
    signaling: SignalingHandle,
    uploader: ChunkUploader,
    ice_config: IceServerConfig,
    podcast_id: String,
    /// Stable account identity; recording control is keyed on this.
    user_id: String,
    /// Per-connection identity from the server; changes on every reconnect.
    participant_id: Option<String>,
    app_base_url: String,
    with_video: bool,
    deny_media: bool,

    in_podcast: bool,
    remote_users: Vec<String>,
    host_user_id: Option<String>,
    media: Option<LocalMedia>,
    session: Option<PeerSession>,
    /// Bumped whenever `session` is replaced so the run loop re-subscribes
    /// to the right connection-state watch.
    session_epoch: u64,
    candidates: CandidateBuffer,
    call_initiated: bool,
    ready_sent: bool,

    recording: Option<RecordingSession>,
    capture: Option<ChunkCapture>,
    chunk_tx: mpsc::Sender<CapturedChunk>,
    last_control: Option<Instant>,
}

impl Studio {
    fn new(
        signaling: SignalingHandle,
        uploader: ChunkUploader,
        ice_config: IceServerConfig,
        opts: StudioOpts,
        app_base_url: String,
        chunk_tx: mpsc::Sender<CapturedChunk>,
    ) -> Self {
        Studio {
            signaling,
            uploader,
            ice_config,
            podcast_id: opts.podcast_id,
            user_id: opts.user_id,
            participant_id: None,
            app_base_url,
            with_video: opts.with_video,
            deny_media: opts.deny_media,
            in_podcast: false,
            remote_users: Vec::new(),
            host_user_id: None,
            media: None,
            session: None,
            session_epoch: 0,
            candidates: CandidateBuffer::default(),
            call_initiated: false,
            ready_sent: false,
            recording: None,
            capture: None,
            chunk_tx,
            last_control: None,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut chunks: mpsc::Receiver<CapturedChunk>,
    ) -> Result<()> {
        let mut watched_epoch = self.session_epoch;
        let mut connection: Option<watch::Receiver<ConnectionState>> = None;

        loop {
            if watched_epoch != self.session_epoch {
                watched_epoch = self.session_epoch;
                connection = self.session.as_ref().map(|s| s.subscribe_connection());
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_signaling_event(event).await,
                    None => anyhow::bail!("signaling transport task ended unexpectedly"),
                },
                state = next_connection_state(&mut connection) => {
                    self.on_connection_state(state).await;
                }
                chunk = chunks.recv() => {
                    if let Some(chunk) = chunk {
                        self.on_chunk(chunk).await;
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.on_command(command).await == Flow::Exit {
                            break;
                        }
                    }
                    // Stdin closed; nothing can drive us anymore.
                    None => {
                        info!("input closed, leaving");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
            }
        }

        self.leave(&mut chunks).await;
        Ok(())
    }

    async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => info!("signaling channel open"),
            SignalingEvent::Closed => {
                // The old participant id dies with the socket; the server
                // assigns a fresh one after reconnect.
                self.participant_id = None;
                self.ready_sent = false;
                info!("signaling lost, reconnecting shortly (the call stays up)");
            }
            SignalingEvent::Envelope(envelope) => self.on_envelope(envelope).await,
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            MessageType::Connected => self.on_connected(&envelope),
            MessageType::PodcastJoined => self.on_podcast_joined(&envelope),
            MessageType::UserJoined => {
                if let Some(user) = &envelope.from {
                    if !self.remote_users.contains(user) {
                        self.remote_users.push(user.clone());
                    }
                    info!("{user} joined the studio");
                }
                if let Some(host) = envelope.payload_str("hostUserId") {
                    self.host_user_id = Some(host.to_string());
                }
            }
            MessageType::UserLeft => self.on_user_left(&envelope),
            MessageType::BothReady => self.on_both_ready(&envelope).await,
            MessageType::Offer => self.on_offer(&envelope).await,
            MessageType::Answer => self.on_answer(&envelope).await,
            MessageType::IceCandidate => self.on_candidate(&envelope),
            MessageType::RecordingStarted => self.on_recording_started(&envelope),
            MessageType::RecordingStopped => self.on_recording_stopped(&envelope).await,
            other => debug!("ignoring server envelope {other:?}"),
        }
    }

    fn on_connected(&mut self, envelope: &Envelope) {
        let Some(id) = envelope.payload_str("clientId") else {
            warn!("connected envelope without a clientId");
            return;
        };
        info!("assigned participant id {id}");
        self.participant_id = Some(id.to_string());
        self.uploader.set_user_id(id);
        self.ready_sent = false;
        // Join (or rejoin after a reconnect) right away.
        self.signaling.send(
            Envelope::new(MessageType::JoinPodcast)
                .podcast(&self.podcast_id)
                .with_payload(json!({ "podcastId": self.podcast_id }))
                .stamped(),
        );
    }

    fn on_podcast_joined(&mut self, envelope: &Envelope) {
        self.in_podcast = true;
        if let Some(payload) = &envelope.payload {
            if let Some(users) = payload.get("users").and_then(|u| u.as_array()) {
                self.remote_users = users
                    .iter()
                    .filter_map(|u| u.as_str().map(String::from))
                    .collect();
            }
            if let Some(host) = payload.get("hostUserId").and_then(|h| h.as_str()) {
                self.host_user_id = Some(host.to_string());
            }
            // A recording may already be running; adopt its id so our chunks
            // land in the right place once capture starts.
            if payload.get("isRecording").and_then(|v| v.as_bool()).unwrap_or(false) {
                if let Some(rec_id) = payload.get("recordingId").and_then(|v| v.as_str()) {
                    if self.recording.as_ref().map(|r| r.recording_id.as_str()) != Some(rec_id) {
                        info!("recording {rec_id} already in progress");
                        self.recording = Some(RecordingSession::new(rec_id.to_string()));
                    }
                }
            }
        }
        info!(
            "joined studio {} with {} other participant(s)",
            self.podcast_id,
            self.remote_users.len()
        );
        println!(
            "invite link: {}/studio/{}",
            self.app_base_url.trim_end_matches('/'),
            self.podcast_id
        );
        self.ensure_media();
        self.send_ready();
    }

    fn on_user_left(&mut self, envelope: &Envelope) {
        if let Some(user) = &envelope.from {
            self.remote_users.retain(|u| u != user);
            info!("{user} left the studio");
        }
        if let Some(host) = envelope.payload_str("hostUserId") {
            self.host_user_id = Some(host.to_string());
        }
        let peer_left = match (&self.session, &envelope.from) {
            (Some(session), Some(from)) => session.remote_id() == from,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if peer_left {
            // The call dies but local media stays alive so a rejoin can
            // negotiate immediately.
            self.drop_session();
            self.call_initiated = false;
            self.ready_sent = false;
            self.send_ready();
        }
    }

    async fn on_both_ready(&mut self, envelope: &Envelope) {
        let should_initiate = envelope.payload_bool("shouldInitiate").unwrap_or(false);
        if !should_initiate {
            debug!("waiting for the peer to send the offer");
            return;
        }
        if self.call_initiated {
            debug!("call already initiated, ignoring repeated both-ready");
            return;
        }
        let Some(target) = envelope.payload_str("targetUserId").map(String::from) else {
            warn!("both-ready without a targetUserId");
            return;
        };
        self.call_initiated = true;
        self.start_call(&target).await;
    }

    async fn start_call(&mut self, target: &str) {
        self.ensure_media();
        let Some(media) = &self.media else {
            error!("cannot start a call without local media");
            self.call_initiated = false;
            return;
        };
        match PeerSession::start_call(
            &self.ice_config,
            &self.podcast_id,
            target,
            media,
            &self.signaling,
        )
        .await
        {
            Ok(session) => self.install_session(session),
            Err(e) => {
                error!("call setup failed: {e:#}");
                self.call_initiated = false;
            }
        }
    }

    async fn on_offer(&mut self, envelope: &Envelope) {
        if let Some(session) = &self.session {
            if session.should_ignore_offer() {
                info!("ignoring offer: negotiation with {} is in flight", session.remote_id());
                return;
            }
            info!("incoming offer replaces the current session");
            self.drop_session();
        }
        self.ensure_media();
        let Some(media) = &self.media else {
            error!("cannot answer an offer without local media");
            return;
        };
        match PeerSession::answer_offer(
            &self.ice_config,
            &self.podcast_id,
            envelope,
            media,
            &self.signaling,
            &mut self.candidates,
        )
        .await
        {
            Ok(session) => self.install_session(session),
            Err(e) => error!("failed to answer offer: {e:#}"),
        }
    }

    async fn on_answer(&mut self, envelope: &Envelope) {
        match &mut self.session {
            Some(session) => {
                if let Err(e) = session.apply_answer(envelope, &mut self.candidates).await {
                    warn!("could not apply answer: {e:#}");
                }
            }
            None => warn!("answer received with no active session"),
        }
    }

    fn on_candidate(&mut self, envelope: &Envelope) {
        let Some(line) = envelope.payload_str("candidate") else {
            warn!("ice-candidate envelope without a candidate payload");
            return;
        };
        match ice::parse_candidate(line) {
            Ok(candidate) => match &mut self.session {
                Some(session) if session.has_remote_description() => {
                    session.apply_candidate(candidate);
                }
                _ => {
                    debug!("buffering candidate until the remote description is set");
                    self.candidates.push(candidate);
                }
            },
            Err(e) => warn!("unusable candidate from {:?}: {e:#}", envelope.from),
        }
    }

    fn on_recording_started(&mut self, envelope: &Envelope) {
        if let Some(rec_id) = envelope.payload_str("recordingId") {
            if self.recording.as_ref().map(|r| r.recording_id.as_str()) == Some(rec_id) {
                debug!("recording {rec_id} already tracked, ignoring repeat");
                return;
            }
            self.recording = Some(RecordingSession::new(rec_id.to_string()));
        }
        if envelope.payload_str("hostUserId") == Some(self.user_id.as_str()) {
            // Our own start echoed back; local capture already runs, it just
            // needed the server-issued id.
            if self.capture.is_some() {
                if let Some(recording) = &mut self.recording {
                    recording.begin();
                }
            }
            return;
        }
        if self.capture.is_some() {
            debug!("capture already running");
            return;
        }
        let Some(media) = &self.media else {
            info!("cannot record without local media, waiting for a call");
            return;
        };
        match ChunkCapture::start(media, self.chunk_tx.clone()) {
            Ok(capture) => {
                self.capture = Some(capture);
                if let Some(recording) = &mut self.recording {
                    recording.begin();
                }
                info!("recording started");
            }
            Err(e) => error!("could not start capture: {e}"),
        }
    }

    async fn on_recording_stopped(&mut self, envelope: &Envelope) {
        if envelope.payload_str("hostUserId") == Some(self.user_id.as_str()) {
            debug!("own recording stop echoed back");
            return;
        }
        info!("recording stopped by the host");
        self.stop_capture().await;
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                info!("media path to the peer established");
                if let Some(session) = &mut self.session {
                    session.mark_connected();
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                warn!("peer connection lost ({state:?})");
                self.end_call().await;
            }
            other => debug!("peer connection state now {other:?}"),
        }
    }

    /// Full local call teardown, recording first so the final chunk is
    /// flushed while the recording id is still around.
    async fn end_call(&mut self) {
        self.stop_capture().await;
        self.media = None;
        self.drop_session();
        self.call_initiated = false;
        self.ready_sent = false;
    }

    async fn on_chunk(&mut self, chunk: CapturedChunk) {
        let is_final = chunk.is_final;
        let outcome = self.uploader.upload(self.recording.as_mut(), chunk).await;
        if outcome == UploadOutcome::Denied {
            // The server already closed this recording; stop capturing and
            // do not bother with a final chunk it would reject too.
            if let Some(capture) = self.capture.take() {
                capture.abort();
            }
            if let Some(recording) = &mut self.recording {
                recording.halt();
            }
        }
        if is_final {
            self.recording = None;
        }
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Record => self.request_recording(true).await,
            Command::Stop => self.request_recording(false).await,
            Command::Mute => self.toggle_track(TrackKind::Audio),
            Command::Video => self.toggle_track(TrackKind::Video),
            Command::Leave => return Flow::Exit,
        }
        Flow::Continue
    }

    async fn request_recording(&mut self, start: bool) {
        if self.host_user_id.as_deref() != Some(self.user_id.as_str()) {
            warn!("only the host can control recording");
            return;
        }
        if let Some(last) = self.last_control {
            if last.elapsed() < CONTROL_COOLDOWN {
                warn!("recording command still settling, ignoring");
                return;
            }
        }

        if start {
            if self.capture.is_some() {
                info!("recording is already running");
                return;
            }
            self.last_control = Some(Instant::now());
            self.ensure_media();
            let Some(media) = &self.media else {
                error!("start a call before recording");
                return;
            };
            // Capture begins immediately; uploads hold until the server
            // echoes recording-started with the new id.
            match ChunkCapture::start(media, self.chunk_tx.clone()) {
                Ok(capture) => self.capture = Some(capture),
                Err(e) => {
                    error!("could not start capture: {e}");
                    return;
                }
            }
            self.signaling.send(
                Envelope::new(MessageType::StartRecording)
                    .podcast(&self.podcast_id)
                    .with_payload(json!({
                        "hostUserId": self.user_id,
                        "podcastId": self.podcast_id,
                    }))
                    .stamped(),
            );
            info!("recording start requested");
        } else {
            if self.capture.is_none() {
                info!("no recording to stop");
                return;
            }
            self.last_control = Some(Instant::now());
            self.stop_capture().await;
            self.signaling.send(
                Envelope::new(MessageType::StopRecording)
                    .podcast(&self.podcast_id)
                    .with_payload(json!({
                        "hostUserId": self.user_id,
                        "podcastId": self.podcast_id,
                    }))
                    .stamped(),
            );
            info!("recording stop requested");
        }
    }

    fn toggle_track(&mut self, kind: TrackKind) {
        let Some(track) = self.media.as_ref().and_then(|m| m.track(kind)) else {
            warn!("no {kind:?} track to toggle");
            return;
        };
        let enabled = track.toggle();
        match kind {
            TrackKind::Audio => info!("microphone {}", if enabled { "on" } else { "muted" }),
            TrackKind::Video => info!("camera {}", if enabled { "on" } else { "off" }),
        }
    }

    async fn stop_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop().await;
            info!("capture stopped, final chunk queued");
        }
        if let Some(recording) = &mut self.recording {
            recording.halt();
        }
    }

    /// Ordered departure: recording, then media, then the peer session and
    /// buffers, then the goodbye envelope.
    async fn leave(&mut self, chunks: &mut mpsc::Receiver<CapturedChunk>) {
        self.stop_capture().await;
        while let Ok(chunk) = chunks.try_recv() {
            self.on_chunk(chunk).await;
        }
        self.media = None;
        self.drop_session();
        self.signaling.send(
            Envelope::new(MessageType::LeavePodcast)
                .podcast(&self.podcast_id)
                .stamped(),
        );
        self.in_podcast = false;
        info!("left studio {}", self.podcast_id);
    }

    fn ensure_media(&mut self) {
        if self.media.is_some() {
            return;
        }
        match LocalMedia::open(MediaOptions {
            with_video: self.with_video,
            deny: self.deny_media,
        }) {
            Ok(media) => self.media = Some(media),
            Err(e) => error!("local media unavailable: {e}"),
        }
    }

    fn send_ready(&mut self) {
        if self.ready_sent || self.media.is_none() {
            return;
        }
        let Some(id) = &self.participant_id else {
            return;
        };
        self.signaling.send(
            Envelope::new(MessageType::Ready)
                .podcast(&self.podcast_id)
                .with_payload(json!({ "clientId": id }))
                .stamped(),
        );
        self.ready_sent = true;
    }

    fn install_session(&mut self, session: PeerSession) {
        self.session = Some(session);
        self.session_epoch += 1;
    }

    fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.candidates.clear();
        self.session_epoch += 1;
    }
}

async fn next_connection_state(
    connection: &mut Option<watch::Receiver<ConnectionState>>,
) -> ConnectionState {
    match connection {
        Some(rx) => {
            if rx.changed().await.is_ok() {
                *rx.borrow_and_update()
            } else {
                // Sender gone; the session is being torn down. Park until
                // the loop re-subscribes.
                std::future::pending().await
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn studio() -> (Studio, UnboundedReceiver<Envelope>, mpsc::Receiver<CapturedChunk>) {
        let (signaling, outbound) = SignalingHandle::test_pair();
        // Unroutable upload base: tests never expect a successful upload.
        let uploader = ChunkUploader::new(reqwest::Client::new(), "http://127.0.0.1:1", "pod-1");
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let studio = Studio::new(
            signaling,
            uploader,
            IceServerConfig::host_only(),
            StudioOpts {
                podcast_id: "pod-1".to_string(),
                user_id: "alice".to_string(),
                with_video: false,
                deny_media: false,
            },
            "http://studio.local".to_string(),
            chunk_tx,
        );
        (studio, outbound, chunk_rx)
    }

    fn envelope(kind: MessageType, payload: serde_json::Value) -> Envelope {
        Envelope::new(kind).podcast("pod-1").with_payload(payload)
    }

    async fn join(studio: &mut Studio) {
        studio
            .on_envelope(envelope(
                MessageType::Connected,
                json!({"clientId": "client-1"}),
            ))
            .await;
        studio
            .on_envelope(envelope(
                MessageType::PodcastJoined,
                json!({"users": [], "hostUserId": "alice"}),
            ))
            .await;
    }

    #[tokio::test]
    async fn test_connected_triggers_join_and_ready() {
        let (mut studio, mut outbound, _chunks) = studio();
        join(&mut studio).await;

        assert_eq!(studio.participant_id.as_deref(), Some("client-1"));
        assert!(studio.in_podcast);
        assert!(studio.media.is_some());

        let first = outbound.try_recv().unwrap();
        assert_eq!(first.kind, MessageType::JoinPodcast);
        let second = outbound.try_recv().unwrap();
        assert_eq!(second.kind, MessageType::Ready);
        assert_eq!(second.payload_str("clientId"), Some("client-1"));
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_resets_identity_and_rejoins() {
        let (mut studio, mut outbound, _chunks) = studio();
        join(&mut studio).await;
        while outbound.try_recv().is_ok() {}

        studio.on_signaling_event(SignalingEvent::Closed).await;
        assert!(studio.participant_id.is_none());

        studio
            .on_envelope(envelope(
                MessageType::Connected,
                json!({"clientId": "client-2"}),
            ))
            .await;
        assert_eq!(studio.participant_id.as_deref(), Some("client-2"));
        assert_eq!(outbound.try_recv().unwrap().kind, MessageType::JoinPodcast);
    }

    #[tokio::test]
    async fn test_both_ready_initiates_exactly_once() {
        let (mut studio, mut outbound, _chunks) = studio();
        join(&mut studio).await;
        while outbound.try_recv().is_ok() {}

        let both_ready = envelope(
            MessageType::BothReady,
            json!({"shouldInitiate": true, "targetUserId": "bob"}),
        );
        studio.on_envelope(both_ready.clone()).await;
        assert!(studio.call_initiated);
        assert!(studio.session.is_some());
        let epoch = studio.session_epoch;

        studio.on_envelope(both_ready).await;
        assert_eq!(studio.session_epoch, epoch);
    }

    #[tokio::test]
    async fn test_both_ready_without_initiate_waits() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;
        studio
            .on_envelope(envelope(
                MessageType::BothReady,
                json!({"shouldInitiate": false, "targetUserId": "bob"}),
            ))
            .await;
        assert!(!studio.call_initiated);
        assert!(studio.session.is_none());
    }

    fn offer_from(sender: &str) -> Envelope {
        let sdp = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                   m=audio 4000 UDP/RTP/AVP 111\r\n\
                   a=ice-ufrag:rem\r\na=ice-pwd:remotepwd0123456789ab\r\n";
        let mut env = envelope(MessageType::Offer, json!({ "sdp": sdp }));
        env.from = Some(sender.to_string());
        env
    }

    #[tokio::test]
    async fn test_offer_during_live_negotiation_is_dropped() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;

        studio.on_envelope(offer_from("bob")).await;
        let session = studio.session.as_ref().unwrap();
        assert_eq!(session.remote_id(), "bob");
        assert!(session.should_ignore_offer());
        let epoch = studio.session_epoch;

        // A second offer arrives while the first attempt is still checking
        // connectivity: the session must survive untouched.
        studio.on_envelope(offer_from("bob")).await;
        assert_eq!(studio.session_epoch, epoch);
        assert_eq!(studio.session.as_ref().unwrap().remote_id(), "bob");
    }

    #[tokio::test]
    async fn test_offer_after_connect_replaces_session() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;

        studio.on_envelope(offer_from("bob")).await;
        let epoch = studio.session_epoch;
        studio
            .session
            .as_ref()
            .unwrap()
            .set_connection_state_for_tests(ConnectionState::Connected);

        // With the previous attempt settled, a fresh offer renegotiates.
        studio.on_envelope(offer_from("carol")).await;
        assert!(studio.session_epoch > epoch);
        assert_eq!(studio.session.as_ref().unwrap().remote_id(), "carol");
    }

    #[tokio::test]
    async fn test_candidates_buffered_without_session() {
        let (mut studio, _outbound, _chunks) = studio();
        studio
            .on_envelope(envelope(
                MessageType::IceCandidate,
                json!({"candidate": "candidate:1 1 udp 100 10.0.0.9 7000 typ host"}),
            ))
            .await;
        assert_eq!(studio.candidates.len(), 1);

        // Garbage is dropped, not buffered.
        studio
            .on_envelope(envelope(
                MessageType::IceCandidate,
                json!({"candidate": "candidate:borked"}),
            ))
            .await;
        assert_eq!(studio.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_recording_started_is_idempotent_per_id() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;

        let started = envelope(
            MessageType::RecordingStarted,
            json!({"recordingId": "rec-9", "hostUserId": "bob"}),
        );
        studio.on_envelope(started.clone()).await;
        assert!(studio.capture.is_some());
        let recording = studio.recording.as_ref().unwrap();
        assert_eq!(recording.recording_id, "rec-9");
        assert!(recording.is_recording);

        // Same id again: no new session, capture untouched.
        studio.on_envelope(started).await;
        assert_eq!(studio.recording.as_ref().unwrap().recording_id, "rec-9");
        assert!(studio.capture.is_some());
    }

    #[tokio::test]
    async fn test_host_echo_adopts_id_without_new_capture() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;

        // The host never started capture locally (say the command failed);
        // its own echo must not start one either.
        studio
            .on_envelope(envelope(
                MessageType::RecordingStarted,
                json!({"recordingId": "rec-1", "hostUserId": "alice"}),
            ))
            .await;
        assert!(studio.capture.is_none());
        let recording = studio.recording.as_ref().unwrap();
        assert_eq!(recording.recording_id, "rec-1");
        assert!(!recording.is_recording);
    }

    #[tokio::test]
    async fn test_non_host_cannot_control_recording() {
        let (mut studio, mut outbound, _chunks) = studio();
        join(&mut studio).await;
        studio.host_user_id = Some("someone-else".to_string());
        while outbound.try_recv().is_ok() {}

        studio.on_command(Command::Record).await;
        assert!(studio.capture.is_none());
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_control_cooldown() {
        let (mut studio, mut outbound, _chunks) = studio();
        join(&mut studio).await;
        while outbound.try_recv().is_ok() {}

        studio.on_command(Command::Record).await;
        assert!(studio.capture.is_some());
        assert_eq!(outbound.try_recv().unwrap().kind, MessageType::StartRecording);

        // Within the cooldown: the stop is swallowed.
        studio.on_command(Command::Stop).await;
        assert!(studio.capture.is_some());
        assert!(outbound.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        studio.on_command(Command::Stop).await;
        assert!(studio.capture.is_none());
        assert_eq!(outbound.try_recv().unwrap().kind, MessageType::StopRecording);
    }

    #[tokio::test]
    async fn test_recording_stopped_echo_is_ignored() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;
        studio
            .on_envelope(envelope(
                MessageType::RecordingStarted,
                json!({"recordingId": "rec-2", "hostUserId": "bob"}),
            ))
            .await;
        assert!(studio.capture.is_some());

        // Our own echo: nothing happens.
        studio
            .on_envelope(envelope(
                MessageType::RecordingStopped,
                json!({"hostUserId": "alice"}),
            ))
            .await;
        assert!(studio.capture.is_some());

        // The host's stop lands.
        studio
            .on_envelope(envelope(
                MessageType::RecordingStopped,
                json!({"hostUserId": "bob"}),
            ))
            .await;
        assert!(studio.capture.is_none());
        assert!(!studio.recording.as_ref().unwrap().is_recording);
    }

    #[tokio::test]
    async fn test_denied_upload_halts_recording() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;
        studio
            .on_envelope(envelope(
                MessageType::RecordingStarted,
                json!({"recordingId": "rec-3", "hostUserId": "bob"}),
            ))
            .await;

        // Simulate the server-terminated outcome directly.
        if let Some(capture) = studio.capture.take() {
            capture.abort();
        }
        if let Some(recording) = &mut studio.recording {
            recording.halt();
        }
        assert!(!studio.recording.as_ref().unwrap().is_recording);
    }

    #[tokio::test]
    async fn test_final_chunk_clears_recording_state() {
        let (mut studio, _outbound, _chunks) = studio();
        join(&mut studio).await;
        studio.recording = Some(RecordingSession::new("rec-4".to_string()));

        studio
            .on_chunk(CapturedChunk {
                data: Vec::new(),
                is_final: true,
            })
            .await;
        assert!(studio.recording.is_none());
    }

    #[tokio::test]
    async fn test_leave_sends_goodbye_last() {
        let (mut studio, mut outbound, mut chunks) = studio();
        join(&mut studio).await;
        while outbound.try_recv().is_ok() {}

        studio.leave(&mut chunks).await;
        assert!(!studio.in_podcast);
        assert!(studio.media.is_none());
        assert!(studio.session.is_none());
        let goodbye = outbound.try_recv().unwrap();
        assert_eq!(goodbye.kind, MessageType::LeavePodcast);
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_left_tears_down_session() {
        let (mut studio, mut outbound, _chunks) = studio();
        join(&mut studio).await;
        while outbound.try_recv().is_ok() {}
        studio
            .on_envelope(envelope(
                MessageType::BothReady,
                json!({"shouldInitiate": true, "targetUserId": "bob"}),
            ))
            .await;
        assert!(studio.session.is_some());

        let mut left = Envelope::new(MessageType::UserLeft).podcast("pod-1");
        left.from = Some("bob".to_string());
        studio.on_envelope(left).await;
        assert!(studio.session.is_none());
        assert!(!studio.call_initiated);
        // Media survives so the next pairing is instant.
        assert!(studio.media.is_some());
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("record"), Some(Command::Record));
        assert_eq!(Command::parse("  STOP  "), Some(Command::Stop));
        assert_eq!(Command::parse("q"), Some(Command::Leave));
        assert_eq!(Command::parse("m"), Some(Command::Mute));
        assert_eq!(Command::parse("dance"), None);
        assert_eq!(Command::parse(""), None);
    }
}
