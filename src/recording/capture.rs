//! Local chunk capture: picks an encoding from the preference list, starts
//! the recorder (with one conservative retry), aggregates encoded frames,
//! and hands a chunk to the uploader every ten seconds. Stopping always
//! produces exactly one final chunk, even an empty one, so the backend can
//! close out the recording.

use std::mem;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::call::CallError;
use crate::media::{LocalMedia, Recorder};

/// How often an aggregated chunk is handed to the uploader.
pub const HANDOFF_INTERVAL: Duration = Duration::from_secs(10);
/// Timeslice asked of the recorder on the first attempt.
pub const DEFAULT_TIMESLICE: Duration = Duration::from_secs(1);
/// Coarser timeslice for the retry when the first configuration fails.
pub const CONSERVATIVE_TIMESLICE: Duration = Duration::from_secs(2);

/// Container/codec preference, best first. Mirrors what the capture stacks
/// we upload for can actually produce.
pub const ENCODING_PREFERENCES: &[&str] = &[
    "video/webm;codecs=vp9,opus",
    "video/webm;codecs=vp8,opus",
    "video/webm;codecs=vp9",
    "video/webm;codecs=vp8",
    "video/webm",
    "video/mp4;codecs=h264,aac",
    "video/mp4",
    "audio/webm;codecs=opus",
    "audio/webm",
];

/// First preferred encoding the source supports, or `None` when nothing
/// matches and the source default must be used.
pub fn select_encoding(supported: &[String]) -> Option<&'static str> {
    ENCODING_PREFERENCES
        .iter()
        .find(|preferred| supported.iter().any(|s| s == **preferred))
        .copied()
}

#[derive(Debug)]
pub struct CapturedChunk {
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// Running capture for one recording. One per participant at a time.
pub struct ChunkCapture {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ChunkCapture {
    /// Starts capturing. An unsupported configuration is retried once with
    /// [`CONSERVATIVE_TIMESLICE`]; a second failure is the caller's problem.
    pub fn start(media: &LocalMedia, sink: mpsc::Sender<CapturedChunk>) -> Result<Self, CallError> {
        let encoding = match select_encoding(media.supported_encodings()) {
            Some(encoding) => encoding,
            None => {
                warn!("no preferred encoding supported, falling back to source default");
                ""
            }
        };
        let recorder = match media.record(encoding, DEFAULT_TIMESLICE) {
            Ok(recorder) => recorder,
            Err(CallError::UnsupportedCaptureFormat) => {
                warn!("capture config rejected, retrying with a coarser timeslice");
                media.record(encoding, CONSERVATIVE_TIMESLICE)?
            }
            Err(e) => return Err(e),
        };
        info!(encoding, "chunk capture started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(aggregate(recorder, sink, stop_rx));
        Ok(ChunkCapture {
            stop: Some(stop_tx),
            task,
        })
    }

    /// Graceful stop: flushes whatever is buffered as the final chunk and
    /// waits for the hand-off.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!("capture task ended badly: {e}");
            }
        }
    }

    /// Hard stop with no final chunk. Used when the server has already
    /// closed the recording and further uploads would be rejected anyway.
    pub fn abort(self) {
        self.task.abort();
    }
}

impl Drop for ChunkCapture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn aggregate(
    mut recorder: Recorder,
    sink: mpsc::Sender<CapturedChunk>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut tick = time::interval(HANDOFF_INTERVAL);
    tick.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            frame = recorder.frames.recv() => match frame {
                Some(frame) => buffer.extend_from_slice(&frame.data),
                None => {
                    // Source died under us; flush what we have as final so
                    // the recording still closes out.
                    warn!("media source ended mid-recording");
                    let _ = sink.send(CapturedChunk { data: mem::take(&mut buffer), is_final: true }).await;
                    return;
                }
            },
            _ = tick.tick() => {
                if buffer.is_empty() {
                    debug!("no encoded data this interval, skipping hand-off");
                    continue;
                }
                let chunk = CapturedChunk { data: mem::take(&mut buffer), is_final: false };
                if sink.send(chunk).await.is_err() {
                    return;
                }
            }
            _ = &mut stop => {
                // Always exactly one final chunk, empty or not.
                let _ = sink.send(CapturedChunk { data: mem::take(&mut buffer), is_final: true }).await;
                return;
            }
        }
    }
}
