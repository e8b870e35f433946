//! Session store contract and an in-memory implementation.
//!
//! The store is the durable system of record for sessions, alerts and
//! evidence. The engine only ever appends. `MemorySessionStore` applies the
//! same acceptance rules as the daemon and backs tests and offline replays.

use crate::error::StoreError;
use crate::evidence::CapturedEvidence;
use chrono::{DateTime, SecondsFormat, Utc};
use proctor_daemon_protocol::{
    Alert, EvidenceRef, SessionClosed, SessionReport, SessionStarted, SessionSummary,
};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub trait SessionStore: Send + Sync {
    fn start_session(&self, client_id: &str) -> Result<SessionStarted, StoreError>;

    /// Idempotent: ending an ended session returns the recorded outcome.
    fn end_session(&self, session_id: &str) -> Result<SessionClosed, StoreError>;

    /// Idempotent on `alert_id`.
    fn submit_alert(&self, alert: &Alert) -> Result<Alert, StoreError>;

    /// Idempotent on `evidence_id`.
    fn submit_evidence(&self, evidence: &CapturedEvidence) -> Result<EvidenceRef, StoreError>;
}

fn rejected(code: &str, message: impl Into<String>) -> StoreError {
    StoreError::Rejected {
        code: code.to_string(),
        message: message.into(),
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

struct StoredSession {
    client_id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    risk_score: u32,
    alerts: Vec<Alert>,
    evidence: Vec<EvidenceRef>,
}

impl StoredSession {
    fn accepts(&self, at: Option<DateTime<Utc>>) -> bool {
        match (self.ended_at, at) {
            (None, _) => true,
            (Some(ended_at), Some(at)) => at <= ended_at,
            (Some(_), None) => false,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, StoredSession>,
    order: Vec<String>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, session_id: &str) -> Option<SessionReport> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let session = state.sessions.get(session_id)?;
        Some(SessionReport {
            session_id: session_id.to_string(),
            client_id: session.client_id.clone(),
            started_at: timestamp(session.started_at),
            ended_at: session.ended_at.map(timestamp),
            risk_score: session.risk_score,
            alerts: session.alerts.clone(),
            evidence: session.evidence.clone(),
        })
    }

    /// Newest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| {
                state.sessions.get(id).map(|session| SessionSummary {
                    session_id: id.clone(),
                    client_id: session.client_id.clone(),
                    started_at: timestamp(session.started_at),
                    ended_at: session.ended_at.map(timestamp),
                    alert_count: session.alerts.len() as u32,
                    risk_score: session.risk_score,
                })
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionStore for MemorySessionStore {
    fn start_session(&self, client_id: &str) -> Result<SessionStarted, StoreError> {
        if client_id.trim().is_empty() {
            return Err(rejected("invalid_params", "client_id is required"));
        }
        let mut state = self.lock();
        let active = state
            .sessions
            .values()
            .any(|session| session.client_id == client_id && session.ended_at.is_none());
        if active {
            return Err(rejected(
                "session_active",
                format!("client {} already has an active session", client_id),
            ));
        }

        let session_id = ulid::Ulid::new().to_string();
        let started_at = Utc::now();
        state.sessions.insert(
            session_id.clone(),
            StoredSession {
                client_id: client_id.to_string(),
                started_at,
                ended_at: None,
                risk_score: 0,
                alerts: Vec::new(),
                evidence: Vec::new(),
            },
        );
        state.order.push(session_id.clone());
        Ok(SessionStarted {
            session_id,
            started_at: timestamp(started_at),
        })
    }

    fn end_session(&self, session_id: &str) -> Result<SessionClosed, StoreError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| rejected("unknown_session", format!("unknown session {}", session_id)))?;

        let already_ended = session.ended_at.is_some();
        let ended_at = match session.ended_at {
            Some(ended_at) => ended_at,
            None => {
                let now = Utc::now();
                session.ended_at = Some(now);
                session.risk_score = session.alerts.len() as u32;
                now
            }
        };
        Ok(SessionClosed {
            session_id: session_id.to_string(),
            ended_at: timestamp(ended_at),
            risk_score: session.risk_score,
            already_ended,
        })
    }

    fn submit_alert(&self, alert: &Alert) -> Result<Alert, StoreError> {
        let mut state = self.lock();
        let session = state.sessions.get_mut(&alert.session_id).ok_or_else(|| {
            rejected(
                "unknown_session",
                format!("unknown session {}", alert.session_id),
            )
        })?;

        if let Some(existing) = session
            .alerts
            .iter()
            .find(|stored| stored.alert_id == alert.alert_id)
        {
            return Ok(existing.clone());
        }
        if !session.accepts(parse_timestamp(&alert.recorded_at)) {
            return Err(rejected(
                "session_ended",
                format!("session {} has ended", alert.session_id),
            ));
        }
        if let Some(evidence_id) = &alert.evidence_id {
            if !session
                .evidence
                .iter()
                .any(|stored| &stored.evidence_id == evidence_id)
            {
                return Err(rejected(
                    "unknown_evidence",
                    format!("unknown evidence {}", evidence_id),
                ));
            }
        }

        session.alerts.push(alert.clone());
        if session.ended_at.is_some() {
            session.risk_score = session.alerts.len() as u32;
        }
        Ok(alert.clone())
    }

    fn submit_evidence(&self, evidence: &CapturedEvidence) -> Result<EvidenceRef, StoreError> {
        if evidence.payload.is_empty() {
            return Err(rejected("empty_payload", "payload is required"));
        }
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(&evidence.session_id)
            .ok_or_else(|| {
                rejected(
                    "unknown_session",
                    format!("unknown session {}", evidence.session_id),
                )
            })?;

        if let Some(existing) = session
            .evidence
            .iter()
            .find(|stored| stored.evidence_id == evidence.evidence_id)
        {
            return Ok(existing.clone());
        }
        if !session.accepts(Some(evidence.captured_at)) {
            return Err(rejected(
                "session_ended",
                format!("session {} has ended", evidence.session_id),
            ));
        }

        let reference = EvidenceRef {
            evidence_id: evidence.evidence_id.clone(),
            session_id: evidence.session_id.clone(),
            kind: evidence.kind,
            captured_at: timestamp(evidence.captured_at),
            byte_len: evidence.byte_len(),
        };
        session.evidence.push(reference.clone());
        Ok(reference)
    }
}
