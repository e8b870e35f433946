//! Shared daemon state handed to every connection thread.
//!
//! Mutations go through one lock so the acceptance rules in
//! `session_store` see a consistent view. Reads skip the lock; SQLite WAL
//! gives them a stable snapshot.

use proctor_daemon_protocol::{
    Alert, ErrorInfo, EvidenceRef, SessionClosed, SessionReport, SessionStarted, SessionSummary,
    StartSessionParams, SubmitAlertParams, SubmitEvidenceParams, ERROR_STORE_FAILURE,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::DaemonConfig;
use crate::db::Db;
use crate::evidence_store::EvidenceStore;
use crate::session_store;

pub struct SharedState {
    db: Db,
    evidence: EvidenceStore,
    config: DaemonConfig,
    write_lock: Mutex<()>,
}

impl SharedState {
    pub fn new(db: Db, evidence: EvidenceStore, config: DaemonConfig) -> Self {
        Self {
            db,
            evidence,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn evidence_dir(&self) -> &Path {
        self.evidence.root()
    }

    pub fn start_session(&self, params: &StartSessionParams) -> Result<SessionStarted, ErrorInfo> {
        let _guard = self.write_guard();
        session_store::start_session(&self.db, params)
    }

    pub fn end_session(&self, session_id: &str) -> Result<SessionClosed, ErrorInfo> {
        let _guard = self.write_guard();
        session_store::end_session(&self.db, session_id)
    }

    pub fn submit_alert(&self, params: SubmitAlertParams) -> Result<Alert, ErrorInfo> {
        let _guard = self.write_guard();
        session_store::submit_alert(&self.db, &self.config, params)
    }

    pub fn submit_evidence(&self, params: SubmitEvidenceParams) -> Result<EvidenceRef, ErrorInfo> {
        let _guard = self.write_guard();
        session_store::submit_evidence(&self.db, &self.evidence, &self.config, params)
    }

    pub fn report(&self, session_id: &str) -> Result<SessionReport, ErrorInfo> {
        session_store::report(&self.db, session_id)
    }

    pub fn sessions_snapshot(&self) -> Result<Vec<SessionSummary>, ErrorInfo> {
        self.db
            .list_sessions()
            .map_err(|err| ErrorInfo::new(ERROR_STORE_FAILURE, err))
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
