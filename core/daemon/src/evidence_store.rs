//! On-disk evidence payloads.
//!
//! Layout: `<root>/<session_id>/<unix_ms>_<evidence_id>.<ext>`. Files are
//! written to a `.tmp` sibling and renamed into place so a crash never leaves
//! a truncated payload under its final name.

use chrono::{DateTime, Utc};
use fs_err as fs;
use proctor_daemon_protocol::EvidenceKind;
use std::path::{Path, PathBuf};

pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(
        &self,
        session_id: &str,
        evidence_id: &str,
        kind: EvidenceKind,
        captured_at: DateTime<Utc>,
    ) -> PathBuf {
        self.root.join(session_id).join(format!(
            "{}_{}.{}",
            captured_at.timestamp_millis(),
            evidence_id,
            kind.extension()
        ))
    }

    pub fn write(
        &self,
        session_id: &str,
        evidence_id: &str,
        kind: EvidenceKind,
        captured_at: DateTime<Utc>,
        payload: &[u8],
    ) -> Result<PathBuf, String> {
        if !is_path_safe(session_id) || !is_path_safe(evidence_id) {
            return Err("Identifier is not usable as a file name".to_string());
        }
        let path = self.path_for(session_id, evidence_id, kind, captured_at);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create evidence dir: {}", err))?;
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .map_err(|err| format!("Failed to write evidence payload: {}", err))?;
        fs::rename(&tmp_path, &path)
            .map_err(|err| format!("Failed to commit evidence payload: {}", err))?;
        Ok(path)
    }

    /// Best effort; used to undo a write whose metadata insert failed.
    pub fn discard(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            tracing::warn!(error = %err, path = %path.display(), "Failed to discard evidence file");
        }
    }
}

pub fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
