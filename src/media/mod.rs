//! Local media acquisition. The capture source is synthetic (a 1 kHz test
//! tone encoded into webm-flavored buffers) but exposes the same surface a
//! real device stack would: tracks that can be disabled, an encoding
//! capability list, and a recorder that emits data on a fixed timeslice.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use crate::call::CallError;

const SAMPLE_RATE: u32 = 8000;
const TONE_HZ: f32 = 1000.0;

/// Encodings the synthetic source can produce. Ordered does not matter;
/// the recording layer picks from its own preference list.
const SUPPORTED_ENCODINGS: &[&str] = &["video/webm", "audio/webm;codecs=opus", "audio/webm"];

/// Shortest timeslice the source can honor; one tone frame.
const MIN_TIMESLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A live track. Disabling mirrors `MediaStreamTrack.enabled`: the track
/// keeps running but produces silence.
#[derive(Debug, Clone)]
pub struct Track {
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
}

impl Track {
    fn new(kind: TrackKind) -> Self {
        Track {
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Visible for tests in other modules that need a bare track.
    #[cfg(test)]
    pub(crate) fn new_for_tests(kind: TrackKind) -> Self {
        Track::new(kind)
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Flips enabled and returns the new value.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: TrackKind,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct MediaOptions {
    pub with_video: bool,
    /// Simulates the user denying the camera/microphone prompt.
    pub deny: bool,
}

#[derive(Debug)]
pub struct LocalMedia {
    tracks: Vec<Track>,
    supported: Vec<String>,
    min_timeslice: Duration,
}

impl LocalMedia {
    /// Acquires the local capture source, or fails the way a denied
    /// permission prompt would.
    pub fn open(options: MediaOptions) -> Result<LocalMedia, CallError> {
        if options.deny {
            return Err(CallError::UserMediaDenied(
                "permission denied by policy".to_string(),
            ));
        }
        let mut tracks = vec![Track::new(TrackKind::Audio)];
        if options.with_video {
            tracks.push(Track::new(TrackKind::Video));
        }
        Ok(Self::synthetic(
            tracks,
            SUPPORTED_ENCODINGS.iter().map(|s| s.to_string()).collect(),
            MIN_TIMESLICE,
        ))
    }

    /// Source with explicit capabilities. Production goes through [`open`];
    /// tests use this to provoke capability mismatches.
    pub fn synthetic(tracks: Vec<Track>, supported: Vec<String>, min_timeslice: Duration) -> Self {
        LocalMedia {
            tracks,
            supported,
            min_timeslice,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some()
    }

    pub fn supported_encodings(&self) -> &[String] {
        &self.supported
    }

    /// Starts encoding. An empty `encoding` means "source default", matching
    /// a `MediaRecorder` constructed without a mimeType. Fails when the
    /// encoding is unknown to the source or the timeslice is finer than the
    /// source granularity.
    pub fn record(&self, encoding: &str, timeslice: Duration) -> Result<Recorder, CallError> {
        if !encoding.is_empty() && !self.supported.iter().any(|s| s == encoding) {
            return Err(CallError::UnsupportedCaptureFormat);
        }
        if timeslice < self.min_timeslice {
            return Err(CallError::UnsupportedCaptureFormat);
        }

        let audio = self
            .track(TrackKind::Audio)
            .cloned()
            .ok_or(CallError::UnsupportedCaptureFormat)?;
        let (frame_tx, frame_rx) = mpsc::channel(32);
        let task = tokio::spawn(generate_frames(audio, timeslice, frame_tx));
        debug!(encoding, ?timeslice, "recorder started");
        Ok(Recorder {
            frames: frame_rx,
            task,
        })
    }
}

/// Running encode session. Dropping it stops the source task.
pub struct Recorder {
    pub frames: mpsc::Receiver<MediaFrame>,
    task: JoinHandle<()>,
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn generate_frames(audio: Track, timeslice: Duration, sink: mpsc::Sender<MediaFrame>) {
    let mut tone = ToneGenerator::new();
    let mut tick = time::interval(timeslice);
    tick.tick().await; // first tick is immediate
    loop {
        tick.tick().await;
        let samples = if audio.is_enabled() {
            tone.take(timeslice)
        } else {
            tone.skip(timeslice)
        };
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        if sink
            .send(MediaFrame {
                kind: TrackKind::Audio,
                data,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Continuous 1 kHz sine at 8 kHz mono, phase carried across frames.
struct ToneGenerator {
    position: u64,
}

impl ToneGenerator {
    fn new() -> Self {
        ToneGenerator { position: 0 }
    }

    fn sample_count(duration: Duration) -> usize {
        (duration.as_secs_f64() * SAMPLE_RATE as f64) as usize
    }

    fn take(&mut self, duration: Duration) -> Vec<i16> {
        let count = Self::sample_count(duration);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let t = self.position as f32 / SAMPLE_RATE as f32;
            out.push((8000.0 * (2.0 * PI * TONE_HZ * t).sin()) as i16);
            self.position += 1;
        }
        out
    }

    /// Muted: advances phase, emits silence.
    fn skip(&mut self, duration: Duration) -> Vec<i16> {
        let count = Self::sample_count(duration);
        self.position += count as u64;
        vec![0; count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_media() {
        let err = LocalMedia::open(MediaOptions {
            with_video: false,
            deny: true,
        })
        .unwrap_err();
        assert!(matches!(err, CallError::UserMediaDenied(_)));
    }

    #[test]
    fn test_track_layout() {
        let audio_only = LocalMedia::open(MediaOptions {
            with_video: false,
            deny: false,
        })
        .unwrap();
        assert!(!audio_only.has_video());
        assert!(audio_only.track(TrackKind::Audio).is_some());

        let both = LocalMedia::open(MediaOptions {
            with_video: true,
            deny: false,
        })
        .unwrap();
        assert!(both.has_video());
    }

    #[test]
    fn test_toggle_mutes_track() {
        let media = LocalMedia::open(MediaOptions {
            with_video: false,
            deny: false,
        })
        .unwrap();
        let audio = media.track(TrackKind::Audio).unwrap();
        assert!(audio.is_enabled());
        assert!(!audio.toggle());
        assert!(!audio.is_enabled());
        assert!(audio.toggle());
    }

    #[tokio::test]
    async fn test_record_rejects_bad_config() {
        let media = LocalMedia::open(MediaOptions {
            with_video: false,
            deny: false,
        })
        .unwrap();
        assert!(matches!(
            media.record("video/x-matroska", Duration::from_secs(1)),
            Err(CallError::UnsupportedCaptureFormat)
        ));
        assert!(matches!(
            media.record("", Duration::from_millis(1)),
            Err(CallError::UnsupportedCaptureFormat)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_emits_on_timeslice() {
        let media = LocalMedia::open(MediaOptions {
            with_video: false,
            deny: false,
        })
        .unwrap();
        let mut recorder = media.record("audio/webm", Duration::from_millis(100)).unwrap();
        let frame = recorder.frames.recv().await.unwrap();
        assert_eq!(frame.kind, TrackKind::Audio);
        // 100 ms at 8 kHz, two bytes per sample.
        assert_eq!(frame.data.len(), 1600);
        assert!(frame.data.iter().any(|b| *b != 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_recorder_emits_silence() {
        let media = LocalMedia::open(MediaOptions {
            with_video: false,
            deny: false,
        })
        .unwrap();
        media.track(TrackKind::Audio).unwrap().set_enabled(false);
        let mut recorder = media.record("", Duration::from_millis(40)).unwrap();
        let frame = recorder.frames.recv().await.unwrap();
        assert!(frame.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_tone_phase_continuity() {
        let mut a = ToneGenerator::new();
        let mut b = ToneGenerator::new();
        let first = a.take(Duration::from_millis(20));
        let second = a.take(Duration::from_millis(20));
        let whole = b.take(Duration::from_millis(40));
        let mut joined = first;
        joined.extend(second);
        assert_eq!(joined, whole);
    }
}
