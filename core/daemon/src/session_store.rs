//! Acceptance rules for sessions, alerts and evidence.
//!
//! Every function here assumes the caller holds the write lock in
//! `SharedState`, so check-then-insert sequences cannot interleave.

use chrono::{DateTime, SecondsFormat, Utc};
use proctor_daemon_protocol::{
    Alert, ErrorInfo, EvidenceRef, SessionClosed, SessionReport, SessionStarted,
    StartSessionParams, SubmitAlertParams, SubmitEvidenceParams, ERROR_STORE_FAILURE,
};
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::db::{parse_rfc3339, Db, EvidenceRow, SessionRow};
use crate::evidence_store::{is_path_safe, EvidenceStore};

fn store_failure(err: String) -> ErrorInfo {
    ErrorInfo::new(ERROR_STORE_FAILURE, err)
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn require_session(db: &Db, session_id: &str) -> Result<SessionRow, ErrorInfo> {
    db.get_session(session_id)
        .map_err(store_failure)?
        .ok_or_else(|| {
            ErrorInfo::new(
                "unknown_session",
                format!("unknown session {}", session_id),
            )
        })
}

/// An ended session still accepts records stamped at or before its end.
fn accepts_at(session: &SessionRow, at: DateTime<Utc>) -> bool {
    match session.ended_at_time() {
        None => true,
        Some(ended_at) => at <= ended_at,
    }
}

fn ended_error(session_id: &str) -> ErrorInfo {
    ErrorInfo::new("session_ended", format!("session {} has ended", session_id))
}

pub fn start_session(db: &Db, params: &StartSessionParams) -> Result<SessionStarted, ErrorInfo> {
    if let Some(active) = db
        .active_session_for_client(&params.client_id)
        .map_err(store_failure)?
    {
        return Err(ErrorInfo::new(
            "session_active",
            format!(
                "client {} already has active session {}",
                params.client_id, active
            ),
        ));
    }

    let row = SessionRow {
        session_id: ulid::Ulid::new().to_string(),
        client_id: params.client_id.clone(),
        started_at: timestamp(Utc::now()),
        ended_at: None,
        risk_score: 0,
    };
    db.insert_session(&row).map_err(store_failure)?;
    info!(session_id = %row.session_id, client_id = %row.client_id, "Session started");

    Ok(SessionStarted {
        session_id: row.session_id,
        started_at: row.started_at,
    })
}

/// Idempotent. The first call fixes `ended_at` and the risk score; later
/// calls report the stored values with `already_ended` set.
pub fn end_session(db: &Db, session_id: &str) -> Result<SessionClosed, ErrorInfo> {
    let session = require_session(db, session_id)?;
    if let Some(ended_at) = session.ended_at {
        debug!(session_id = %session_id, "Session already ended");
        return Ok(SessionClosed {
            session_id: session.session_id,
            ended_at,
            risk_score: session.risk_score,
            already_ended: true,
        });
    }

    let risk_score = db.count_alerts(session_id).map_err(store_failure)?;
    let ended_at = timestamp(Utc::now());
    let closed = db
        .close_session(session_id, &ended_at, risk_score)
        .map_err(store_failure)?;
    if !closed {
        // Lost a race with another writer outside this process.
        let session = require_session(db, session_id)?;
        return Ok(SessionClosed {
            session_id: session.session_id,
            ended_at: session.ended_at.unwrap_or(ended_at),
            risk_score: session.risk_score,
            already_ended: true,
        });
    }

    info!(session_id = %session_id, risk_score, "Session ended");
    Ok(SessionClosed {
        session_id: session_id.to_string(),
        ended_at,
        risk_score,
        already_ended: false,
    })
}

pub fn submit_alert(
    db: &Db,
    config: &DaemonConfig,
    params: SubmitAlertParams,
) -> Result<Alert, ErrorInfo> {
    if params.details.chars().count() > config.max_details_len {
        return Err(ErrorInfo::new(
            "details_too_long",
            format!(
                "details must be {} characters or fewer",
                config.max_details_len
            ),
        ));
    }

    let session = require_session(db, &params.session_id)?;

    if let Some(alert_id) = &params.alert_id {
        if let Some(existing) = db.get_alert(alert_id).map_err(store_failure)? {
            if existing.session_id != params.session_id {
                return Err(ErrorInfo::new(
                    "invalid_id",
                    format!("alert {} belongs to another session", alert_id),
                ));
            }
            debug!(alert_id = %alert_id, "Duplicate alert submission; returning stored alert");
            return Ok(existing);
        }
    }

    let recorded_at = match params.recorded_at.as_deref().and_then(parse_rfc3339) {
        Some(at) => at,
        None => Utc::now(),
    };
    if !accepts_at(&session, recorded_at) {
        return Err(ended_error(&params.session_id));
    }

    if let Some(evidence_id) = &params.evidence_id {
        let linked = db.get_evidence(evidence_id).map_err(store_failure)?;
        if !matches!(linked, Some(ref row) if row.session_id == params.session_id) {
            return Err(ErrorInfo::new(
                "unknown_evidence",
                format!("unknown evidence {}", evidence_id),
            ));
        }
    }

    let alert = Alert {
        alert_id: params
            .alert_id
            .unwrap_or_else(|| ulid::Ulid::new().to_string()),
        session_id: params.session_id,
        kind: params.kind,
        severity: params.severity,
        details: params.details,
        recorded_at: params
            .recorded_at
            .unwrap_or_else(|| timestamp(recorded_at)),
        evidence_id: params.evidence_id,
    };
    db.insert_alert(&alert).map_err(store_failure)?;

    if session.ended_at.is_some() {
        let risk_score = db.count_alerts(&alert.session_id).map_err(store_failure)?;
        db.set_risk_score(&alert.session_id, risk_score)
            .map_err(store_failure)?;
        info!(
            session_id = %alert.session_id,
            alert_id = %alert.alert_id,
            risk_score,
            "Late alert accepted for ended session"
        );
    }

    info!(
        session_id = %alert.session_id,
        alert_id = %alert.alert_id,
        kind = alert.kind.as_str(),
        severity = alert.severity.as_str(),
        "Alert stored"
    );
    Ok(alert)
}

pub fn submit_evidence(
    db: &Db,
    evidence: &EvidenceStore,
    config: &DaemonConfig,
    params: SubmitEvidenceParams,
) -> Result<EvidenceRef, ErrorInfo> {
    let session = require_session(db, &params.session_id)?;

    if let Some(evidence_id) = &params.evidence_id {
        if !is_path_safe(evidence_id) {
            return Err(ErrorInfo::new(
                "invalid_id",
                "evidence_id may only contain letters, digits, '-' and '_'",
            ));
        }
        if let Some(existing) = db.get_evidence(evidence_id).map_err(store_failure)? {
            if existing.session_id != params.session_id {
                return Err(ErrorInfo::new(
                    "invalid_id",
                    format!("evidence {} belongs to another session", evidence_id),
                ));
            }
            debug!(evidence_id = %evidence_id, "Duplicate evidence submission");
            return Ok(existing.to_ref());
        }
    }

    let payload = params.decode_payload()?;
    if payload.len() as u64 > config.max_evidence_bytes {
        return Err(ErrorInfo::new(
            "payload_too_large",
            format!(
                "payload is {} bytes; limit is {}",
                payload.len(),
                config.max_evidence_bytes
            ),
        ));
    }

    let captured_at = match params.captured_at.as_deref().and_then(parse_rfc3339) {
        Some(at) => at,
        None => Utc::now(),
    };
    if !accepts_at(&session, captured_at) {
        return Err(ended_error(&params.session_id));
    }

    let evidence_id = params
        .evidence_id
        .unwrap_or_else(|| ulid::Ulid::new().to_string());
    let path = evidence
        .write(
            &params.session_id,
            &evidence_id,
            params.kind,
            captured_at,
            &payload,
        )
        .map_err(store_failure)?;

    let row = EvidenceRow {
        evidence_id,
        session_id: params.session_id,
        kind: params.kind,
        path: path.to_string_lossy().into_owned(),
        byte_len: payload.len() as u64,
        captured_at: timestamp(captured_at),
    };
    if let Err(err) = db.insert_evidence(&row) {
        evidence.discard(&path);
        return Err(store_failure(err));
    }

    info!(
        session_id = %row.session_id,
        evidence_id = %row.evidence_id,
        kind = row.kind.as_str(),
        byte_len = row.byte_len,
        "Evidence stored"
    );
    Ok(row.to_ref())
}

pub fn report(db: &Db, session_id: &str) -> Result<SessionReport, ErrorInfo> {
    let session = require_session(db, session_id)?;
    let alerts = db.list_alerts(session_id).map_err(store_failure)?;
    let evidence = db
        .list_evidence(session_id)
        .map_err(store_failure)?
        .iter()
        .map(EvidenceRow::to_ref)
        .collect();

    Ok(SessionReport {
        session_id: session.session_id,
        client_id: session.client_id,
        started_at: session.started_at,
        ended_at: session.ended_at,
        risk_score: session.risk_score,
        alerts,
        evidence,
    })
}
