//! SQLite persistence for proctor-daemon.
//!
//! Three tables: sessions, alerts (append-only, ordered by `seq`) and
//! evidence (metadata only; payloads live on disk). The daemon is the single
//! writer; callers serialize mutations through `SharedState`.

use chrono::{DateTime, Utc};
use proctor_daemon_protocol::{
    Alert, AlertKind, EvidenceKind, EvidenceRef, SessionSummary, Severity,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::PathBuf;

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub session_id: String,
    pub client_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub risk_score: u32,
}

impl SessionRow {
    pub fn ended_at_time(&self) -> Option<DateTime<Utc>> {
        self.ended_at.as_deref().and_then(parse_rfc3339)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceRow {
    pub evidence_id: String,
    pub session_id: String,
    pub kind: EvidenceKind,
    pub path: String,
    pub byte_len: u64,
    pub captured_at: String,
}

impl EvidenceRow {
    pub fn to_ref(&self) -> EvidenceRef {
        EvidenceRef {
            evidence_id: self.evidence_id.clone(),
            session_id: self.session_id.clone(),
            kind: self.kind,
            captured_at: self.captured_at.clone(),
            byte_len: self.byte_len,
        }
    }
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn insert_session(&self, row: &SessionRow) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, client_id, started_at, ended_at, risk_score) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.session_id,
                    row.client_id,
                    row.started_at,
                    row.ended_at,
                    row.risk_score
                ],
            )
            .map_err(|err| format!("Failed to insert session: {}", err))?;
            Ok(())
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT session_id, client_id, started_at, ended_at, risk_score \
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                session_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to fetch session: {}", err))
        })
    }

    pub fn active_session_for_client(&self, client_id: &str) -> Result<Option<String>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT session_id FROM sessions \
                 WHERE client_id = ?1 AND ended_at IS NULL \
                 ORDER BY started_at DESC LIMIT 1",
                params![client_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|err| format!("Failed to query active session: {}", err))
        })
    }

    /// Sets `ended_at` and the final score. Returns false when the session
    /// was already closed.
    pub fn close_session(
        &self,
        session_id: &str,
        ended_at: &str,
        risk_score: u32,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET ended_at = ?2, risk_score = ?3 \
                     WHERE session_id = ?1 AND ended_at IS NULL",
                    params![session_id, ended_at, risk_score],
                )
                .map_err(|err| format!("Failed to close session: {}", err))?;
            Ok(changed > 0)
        })
    }

    pub fn set_risk_score(&self, session_id: &str, risk_score: u32) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET risk_score = ?2 WHERE session_id = ?1",
                params![session_id, risk_score],
            )
            .map_err(|err| format!("Failed to update risk score: {}", err))?;
            Ok(())
        })
    }

    /// Newest first, with per-session alert counts.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT s.session_id, s.client_id, s.started_at, s.ended_at, s.risk_score, \
                            (SELECT COUNT(*) FROM alerts a WHERE a.session_id = s.session_id) \
                     FROM sessions s \
                     ORDER BY s.started_at DESC, s.session_id DESC",
                )
                .map_err(|err| format!("Failed to prepare sessions query: {}", err))?;

            let rows = stmt
                .query_map([], |row| {
                    let session = session_from_row(row)?;
                    let alert_count: u32 = row.get(5)?;
                    Ok(SessionSummary {
                        session_id: session.session_id,
                        client_id: session.client_id,
                        started_at: session.started_at,
                        ended_at: session.ended_at,
                        alert_count,
                        risk_score: session.risk_score,
                    })
                })
                .map_err(|err| format!("Failed to read session rows: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
            }
            Ok(sessions)
        })
    }

    pub fn count_alerts(&self, session_id: &str) -> Result<u32, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM alerts WHERE session_id = ?1",
                params![session_id],
                |row| row.get::<_, u32>(0),
            )
            .map_err(|err| format!("Failed to count alerts: {}", err))
        })
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>, String> {
        self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    "SELECT alert_id, session_id, kind, severity, details, recorded_at, evidence_id \
                     FROM alerts WHERE alert_id = ?1",
                    params![alert_id],
                    raw_alert_from_row,
                )
                .optional()
                .map_err(|err| format!("Failed to fetch alert: {}", err))?;
            raw.map(RawAlert::into_alert).transpose()
        })
    }

    pub fn insert_alert(&self, alert: &Alert) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO alerts \
                    (alert_id, session_id, kind, severity, details, recorded_at, evidence_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    alert.alert_id,
                    alert.session_id,
                    alert.kind.as_str(),
                    alert.severity.as_str(),
                    alert.details,
                    alert.recorded_at,
                    alert.evidence_id
                ],
            )
            .map_err(|err| format!("Failed to insert alert: {}", err))?;
            Ok(())
        })
    }

    /// Arrival order.
    pub fn list_alerts(&self, session_id: &str) -> Result<Vec<Alert>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT alert_id, session_id, kind, severity, details, recorded_at, evidence_id \
                     FROM alerts WHERE session_id = ?1 ORDER BY seq ASC",
                )
                .map_err(|err| format!("Failed to prepare alerts query: {}", err))?;
            let rows = stmt
                .query_map(params![session_id], raw_alert_from_row)
                .map_err(|err| format!("Failed to read alert rows: {}", err))?;

            let mut alerts = Vec::new();
            for row in rows {
                let raw = row.map_err(|err| format!("Failed to decode alert row: {}", err))?;
                alerts.push(raw.into_alert()?);
            }
            Ok(alerts)
        })
    }

    pub fn get_evidence(&self, evidence_id: &str) -> Result<Option<EvidenceRow>, String> {
        self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    "SELECT evidence_id, session_id, kind, path, byte_len, captured_at \
                     FROM evidence WHERE evidence_id = ?1",
                    params![evidence_id],
                    raw_evidence_from_row,
                )
                .optional()
                .map_err(|err| format!("Failed to fetch evidence: {}", err))?;
            raw.map(RawEvidence::into_row).transpose()
        })
    }

    pub fn insert_evidence(&self, row: &EvidenceRow) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO evidence (evidence_id, session_id, kind, path, byte_len, captured_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.evidence_id,
                    row.session_id,
                    row.kind.as_str(),
                    row.path,
                    row.byte_len as i64,
                    row.captured_at
                ],
            )
            .map_err(|err| format!("Failed to insert evidence: {}", err))?;
            Ok(())
        })
    }

    pub fn list_evidence(&self, session_id: &str) -> Result<Vec<EvidenceRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT evidence_id, session_id, kind, path, byte_len, captured_at \
                     FROM evidence WHERE session_id = ?1 ORDER BY captured_at ASC, evidence_id ASC",
                )
                .map_err(|err| format!("Failed to prepare evidence query: {}", err))?;
            let rows = stmt
                .query_map(params![session_id], raw_evidence_from_row)
                .map_err(|err| format!("Failed to read evidence rows: {}", err))?;

            let mut evidence = Vec::new();
            for row in rows {
                let raw = row.map_err(|err| format!("Failed to decode evidence row: {}", err))?;
                evidence.push(raw.into_row()?);
            }
            Ok(evidence)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    client_id TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    risk_score INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS sessions_client_idx ON sessions(client_id, ended_at);
                 CREATE TABLE IF NOT EXISTS alerts (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    alert_id TEXT NOT NULL UNIQUE,
                    session_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    details TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    evidence_id TEXT
                 );
                 CREATE INDEX IF NOT EXISTS alerts_session_idx ON alerts(session_id, seq);
                 CREATE TABLE IF NOT EXISTS evidence (
                    evidence_id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    path TEXT NOT NULL,
                    byte_len INTEGER NOT NULL,
                    captured_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS evidence_session_idx ON evidence(session_id);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        session_id: row.get(0)?,
        client_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        risk_score: row.get(4)?,
    })
}

// Enum columns are decoded after the row closure so a bad value surfaces as
// a formatted error instead of a rusqlite conversion failure.
struct RawAlert {
    alert_id: String,
    session_id: String,
    kind: String,
    severity: String,
    details: String,
    recorded_at: String,
    evidence_id: Option<String>,
}

impl RawAlert {
    fn into_alert(self) -> Result<Alert, String> {
        let kind = AlertKind::from_str(&self.kind)
            .ok_or_else(|| format!("Unknown alert kind in db: {}", self.kind))?;
        let severity = Severity::from_str(&self.severity)
            .ok_or_else(|| format!("Unknown severity in db: {}", self.severity))?;
        Ok(Alert {
            alert_id: self.alert_id,
            session_id: self.session_id,
            kind,
            severity,
            details: self.details,
            recorded_at: self.recorded_at,
            evidence_id: self.evidence_id,
        })
    }
}

fn raw_alert_from_row(row: &Row<'_>) -> rusqlite::Result<RawAlert> {
    Ok(RawAlert {
        alert_id: row.get(0)?,
        session_id: row.get(1)?,
        kind: row.get(2)?,
        severity: row.get(3)?,
        details: row.get(4)?,
        recorded_at: row.get(5)?,
        evidence_id: row.get(6)?,
    })
}

struct RawEvidence {
    evidence_id: String,
    session_id: String,
    kind: String,
    path: String,
    byte_len: i64,
    captured_at: String,
}

impl RawEvidence {
    fn into_row(self) -> Result<EvidenceRow, String> {
        let kind = EvidenceKind::from_str(&self.kind)
            .ok_or_else(|| format!("Unknown evidence kind in db: {}", self.kind))?;
        Ok(EvidenceRow {
            evidence_id: self.evidence_id,
            session_id: self.session_id,
            kind,
            path: self.path,
            byte_len: self.byte_len.max(0) as u64,
            captured_at: self.captured_at,
        })
    }
}

fn raw_evidence_from_row(row: &Row<'_>) -> rusqlite::Result<RawEvidence> {
    Ok(RawEvidence {
        evidence_id: row.get(0)?,
        session_id: row.get(1)?,
        kind: row.get(2)?,
        path: row.get(3)?,
        byte_len: row.get(4)?,
        captured_at: row.get(5)?,
    })
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
