//! Synchronized recording: every participant captures locally and uploads
//! chunks tagged with the server-issued recording id.

pub mod capture;
pub mod upload;

use chrono::{DateTime, Utc};

/// Shared recording state for one recording id. `is_recording` gates
/// non-final uploads; the counter assigns each uploaded chunk its index.
#[derive(Debug)]
pub struct RecordingSession {
    pub recording_id: String,
    pub is_recording: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub chunk_counter: u64,
}

impl RecordingSession {
    pub fn new(recording_id: String) -> Self {
        RecordingSession {
            recording_id,
            is_recording: false,
            started_at: None,
            chunk_counter: 0,
        }
    }

    /// Local capture is running for this id.
    pub fn begin(&mut self) {
        self.is_recording = true;
        self.started_at = Some(Utc::now());
    }

    /// Capture stopped; only the final chunk may still be uploaded.
    pub fn halt(&mut self) {
        self.is_recording = false;
    }
}
