//! Evidence capture from the live sensors.

use crate::error::{ProctorError, Result};
use crate::poller::panic_message;
use crate::sensors::FrameSource;
use crate::types::SessionId;
use chrono::{DateTime, SecondsFormat, Utc};
use proctor_daemon_protocol::{encode_payload, EvidenceKind, SubmitEvidenceParams};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Evidence bytes owned by the engine until the store accepts them.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedEvidence {
    pub evidence_id: String,
    pub session_id: String,
    pub kind: EvidenceKind,
    pub payload: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl CapturedEvidence {
    pub fn new(session_id: &SessionId, kind: EvidenceKind, payload: Vec<u8>) -> Self {
        Self {
            evidence_id: ulid::Ulid::new().to_string(),
            session_id: session_id.to_string(),
            kind,
            payload,
            captured_at: Utc::now(),
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn to_params(&self) -> SubmitEvidenceParams {
        SubmitEvidenceParams {
            evidence_id: Some(self.evidence_id.clone()),
            session_id: self.session_id.clone(),
            kind: self.kind,
            captured_at: Some(self.captured_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            payload: encode_payload(&self.payload),
        }
    }
}

/// Snapshots the current frame. The bytes are copied, so later frames never
/// alias captured evidence.
pub struct EvidenceCapture {
    frames: Arc<dyn FrameSource>,
}

impl EvidenceCapture {
    pub fn new(frames: Arc<dyn FrameSource>) -> Self {
        Self { frames }
    }

    pub fn capture_frame(&self, session_id: &SessionId) -> Result<CapturedEvidence> {
        let frame = panic::catch_unwind(AssertUnwindSafe(|| self.frames.current_frame()))
            .map_err(|payload| {
                ProctorError::EvidenceCaptureFailure(format!(
                    "frame source {}",
                    panic_message(payload.as_ref())
                ))
            })?
            .ok_or_else(|| {
                ProctorError::EvidenceCaptureFailure("no frame available".to_string())
            })?;
        if frame.data.is_empty() {
            return Err(ProctorError::EvidenceCaptureFailure(
                "frame is empty".to_string(),
            ));
        }
        Ok(CapturedEvidence::new(
            session_id,
            EvidenceKind::Image,
            frame.data.to_vec(),
        ))
    }

    pub fn audio_chunk(&self, session_id: &SessionId, bytes: Vec<u8>) -> Option<CapturedEvidence> {
        if bytes.is_empty() {
            return None;
        }
        Some(CapturedEvidence::new(session_id, EvidenceKind::Audio, bytes))
    }
}
