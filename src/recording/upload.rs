//! Two-phase chunk upload: ask the backend for a presigned slot, then PUT
//! the raw bytes to the returned URL. Delivery is at-most-once per chunk
//! index; a failed chunk is logged and dropped, never retried.

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::capture::CapturedChunk;
use super::RecordingSession;

pub const UPLOAD_CONTENT_TYPE: &str = "video/webm";

/// Slot request body. `content_length` and `timestamp` are strings on the
/// wire, and `timestamp` is the same millisecond value embedded in the file
/// name.
#[derive(Debug, Serialize)]
struct SlotRequest<'a> {
    file_name: &'a str,
    content_type: &'a str,
    content_length: String,
    user_id: &'a str,
    podcast_id: &'a str,
    recording_id: &'a str,
    timestamp: String,
    is_final: bool,
    chunk_index: u64,
    file_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct SlotGrant {
    pub pre_signed_url: String,
    pub s3_key: String,
    pub chunk_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Non-final chunk while the recording is not active.
    NotRecording,
    /// Non-final chunk with no bytes in it.
    EmptyChunk,
    /// No recording id assigned yet (host capture before the server echo).
    NoRecordingId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    Skipped(SkipReason),
    /// The backend refused the slot with 403: the recording was terminated
    /// server-side and the caller must halt capture.
    Denied,
    /// Transient failure; the chunk is dropped.
    Failed,
}

pub struct ChunkUploader {
    http: reqwest::Client,
    slot_url: String,
    user_id: String,
    podcast_id: String,
}

impl ChunkUploader {
    pub fn new(http: reqwest::Client, upload_base: &str, podcast_id: &str) -> Self {
        ChunkUploader {
            http,
            slot_url: format!(
                "{}/api/v1/upload/presigned-url",
                upload_base.trim_end_matches('/')
            ),
            user_id: String::new(),
            podcast_id: podcast_id.to_string(),
        }
    }

    /// Chunks are attributed to the current signaling identity, which
    /// changes on every reconnect.
    pub fn set_user_id(&mut self, user_id: &str) {
        self.user_id = user_id.to_string();
    }

    /// Runs the upload gates and, if they pass, the two-phase upload.
    /// Increments the session's chunk counter only on success.
    pub async fn upload(
        &self,
        session: Option<&mut RecordingSession>,
        chunk: CapturedChunk,
    ) -> UploadOutcome {
        let active = session.as_ref().map(|s| s.is_recording).unwrap_or(false);
        if !chunk.is_final && !active {
            debug!("skipping chunk: recording is not active");
            return UploadOutcome::Skipped(SkipReason::NotRecording);
        }
        if !chunk.is_final && chunk.data.is_empty() {
            debug!("skipping chunk: no data");
            return UploadOutcome::Skipped(SkipReason::EmptyChunk);
        }
        let Some(session) = session else {
            debug!("skipping chunk: no recording id yet");
            return UploadOutcome::Skipped(SkipReason::NoRecordingId);
        };

        let index = session.chunk_counter;
        let timestamp = Utc::now().timestamp_millis();
        let file_name = format!("chunk_{index}_{timestamp}.webm");
        let size = chunk.data.len() as u64;

        let request = SlotRequest {
            file_name: &file_name,
            content_type: UPLOAD_CONTENT_TYPE,
            content_length: size.to_string(),
            user_id: &self.user_id,
            podcast_id: &self.podcast_id,
            recording_id: &session.recording_id,
            timestamp: timestamp.to_string(),
            is_final: chunk.is_final,
            chunk_index: index,
            file_size: size,
        };

        let response = match self.http.post(&self.slot_url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("slot request for chunk {index} failed: {e}");
                return UploadOutcome::Failed;
            }
        };
        if response.status() == StatusCode::FORBIDDEN {
            info!("slot refused for chunk {index}: recording ended server-side");
            return UploadOutcome::Denied;
        }
        if !response.status().is_success() {
            warn!(
                "slot request for chunk {index} returned {}",
                response.status()
            );
            return UploadOutcome::Failed;
        }
        let grant: SlotGrant = match response.json().await {
            Ok(grant) => grant,
            Err(e) => {
                warn!("unparseable slot grant for chunk {index}: {e}");
                return UploadOutcome::Failed;
            }
        };
        if grant.chunk_index != index {
            // The slot is still usable; the backend keys storage off its
            // own index, so just surface the drift.
            warn!(
                "backend granted slot for chunk {} where we asked for {index}",
                grant.chunk_index
            );
        }

        let put = self
            .http
            .put(&grant.pre_signed_url)
            .header(CONTENT_TYPE, UPLOAD_CONTENT_TYPE)
            .body(chunk.data)
            .send()
            .await;
        match put {
            Ok(response) if response.status().is_success() => {
                session.chunk_counter += 1;
                info!(
                    "uploaded chunk {index} to {} ({size} bytes{})",
                    grant.s3_key,
                    if chunk.is_final { ", final" } else { "" }
                );
                UploadOutcome::Uploaded
            }
            Ok(response) => {
                warn!("storage PUT for chunk {index} returned {}", response.status());
                UploadOutcome::Failed
            }
            Err(e) => {
                warn!("storage PUT for chunk {index} failed: {e}");
                UploadOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    fn uploader(base: &str) -> ChunkUploader {
        let mut uploader = ChunkUploader::new(reqwest::Client::new(), base, "pod-1");
        uploader.set_user_id("client-1");
        uploader
    }

    fn chunk(data: &[u8], is_final: bool) -> CapturedChunk {
        CapturedChunk {
            data: data.to_vec(),
            is_final,
        }
    }

    fn active_session() -> RecordingSession {
        let mut session = RecordingSession::new("rec-1".to_string());
        session.begin();
        session
    }

    #[tokio::test]
    async fn test_gates_block_before_any_network() {
        // Unroutable base URL: reaching the network would fail the test
        // with Failed instead of the expected skip.
        let uploader = uploader("http://127.0.0.1:1");

        let mut idle = RecordingSession::new("rec-1".to_string());
        assert_eq!(
            uploader.upload(Some(&mut idle), chunk(b"data", false)).await,
            UploadOutcome::Skipped(SkipReason::NotRecording)
        );

        let mut active = active_session();
        assert_eq!(
            uploader.upload(Some(&mut active), chunk(b"", false)).await,
            UploadOutcome::Skipped(SkipReason::EmptyChunk)
        );
        assert_eq!(active.chunk_counter, 0);

        assert_eq!(
            uploader.upload(None, chunk(b"data", true)).await,
            UploadOutcome::Skipped(SkipReason::NoRecordingId)
        );
    }

    #[tokio::test]
    async fn test_final_chunk_bypasses_activity_and_empty_gates() {
        let uploader = uploader("http://127.0.0.1:1");
        let mut halted = RecordingSession::new("rec-1".to_string());
        // Passes the gates, then fails on the unreachable backend; the
        // point is that it was not skipped.
        assert_eq!(
            uploader.upload(Some(&mut halted), chunk(b"", true)).await,
            UploadOutcome::Failed
        );
    }

    /// Minimal HTTP/1.1 server: answers each connection with one canned
    /// response and records the requests it saw. The response list is built
    /// from the bound address so grants can point back at the server.
    async fn canned_server(
        make_responses: impl FnOnce(std::net::SocketAddr) -> Vec<String>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responses = make_responses(addr);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_writer = seen.clone();
        tokio::spawn(async move {
            for response in responses {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = vec![0u8; 65536];
                let mut filled = 0;
                // Read until the full head plus declared body is in.
                loop {
                    let n = match stream.read(&mut buf[filled..]).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    filled += n;
                    let text = String::from_utf8_lossy(&buf[..filled]);
                    if let Some(head_end) = text.find("\r\n\r\n") {
                        let declared = text
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length: ").or_else(|| l.strip_prefix("Content-Length: ")))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if filled >= head_end + 4 + declared {
                            break;
                        }
                    }
                }
                seen_writer
                    .lock()
                    .await
                    .push(String::from_utf8_lossy(&buf[..filled]).into_owned());
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn test_forbidden_slot_is_denied() {
        let (base, _seen) =
            canned_server(|_| vec![http_response("403 Forbidden", "{}")]).await;
        let uploader = uploader(&base);
        let mut session = active_session();
        assert_eq!(
            uploader.upload(Some(&mut session), chunk(b"data", false)).await,
            UploadOutcome::Denied
        );
        assert_eq!(session.chunk_counter, 0);
    }

    #[tokio::test]
    async fn test_server_error_drops_chunk() {
        let (base, _seen) =
            canned_server(|_| vec![http_response("500 Internal Server Error", "{}")]).await;
        let uploader = uploader(&base);
        let mut session = active_session();
        assert_eq!(
            uploader.upload(Some(&mut session), chunk(b"data", false)).await,
            UploadOutcome::Failed
        );
        assert_eq!(session.chunk_counter, 0);
    }

    #[tokio::test]
    async fn test_successful_two_phase_upload() {
        // Two connections: the POST for the slot, then the PUT the grant
        // points back at this same server.
        let (base, seen) = canned_server(|addr| {
            let grant = format!(
                "{{\"pre_signed_url\":\"http://{addr}/bucket/key\",\"s3_key\":\"key\",\"chunk_index\":0}}"
            );
            vec![http_response("200 OK", &grant), http_response("200 OK", "")]
        })
        .await;

        let uploader = uploader(&base);
        let mut session = active_session();
        assert_eq!(
            uploader.upload(Some(&mut session), chunk(b"webm-bytes", false)).await,
            UploadOutcome::Uploaded
        );
        assert_eq!(session.chunk_counter, 1);

        let requests = seen.lock().await;
        assert_eq!(requests.len(), 2);
        let post = &requests[0];
        assert!(post.starts_with("POST /api/v1/upload/presigned-url"));
        assert!(post.contains("\"recording_id\":\"rec-1\""));
        assert!(post.contains("\"chunk_index\":0"));
        assert!(post.contains("\"is_final\":false"));
        assert!(post.contains("\"content_length\":\"10\""));
        assert!(post.contains("\"file_name\":\"chunk_0_"));
        let put = &requests[1];
        assert!(put.starts_with("PUT /bucket/key"));
        assert!(put.contains("content-type: video/webm"));
        assert!(put.ends_with("webm-bytes"));
    }

    #[tokio::test]
    async fn test_grant_index_drift_still_uploads() {
        // A backend that has seen chunks we lost can answer with a higher
        // index than the local counter. The slot is still honored and only
        // the local counter advances.
        let (base, seen) = canned_server(|addr| {
            let grant = format!(
                "{{\"pre_signed_url\":\"http://{addr}/bucket/key\",\"s3_key\":\"key\",\"chunk_index\":5}}"
            );
            vec![http_response("200 OK", &grant), http_response("200 OK", "")]
        })
        .await;

        let uploader = uploader(&base);
        let mut session = active_session();
        assert_eq!(
            uploader.upload(Some(&mut session), chunk(b"data", false)).await,
            UploadOutcome::Uploaded
        );
        assert_eq!(session.chunk_counter, 1);
        assert_eq!(seen.lock().await.len(), 2);
    }
}
