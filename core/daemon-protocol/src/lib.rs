//! IPC protocol types and validation for proctor-daemon.
//!
//! This crate is shared by the daemon and the proctoring engine to prevent
//! schema drift. The daemon remains the authority on validation, but clients
//! reuse the same types to construct valid requests.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024; // 16MB, evidence frames travel inline
pub const MAX_ID_LENGTH: usize = 128;

/// Daemon-side persistence failure. The request may succeed if retried.
pub const ERROR_STORE_FAILURE: &str = "store_failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    StartSession,
    EndSession,
    SubmitAlert,
    SubmitEvidence,
    GetReport,
    ListSessions,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// True for failures on the daemon side rather than in the request.
    pub fn is_transient(&self) -> bool {
        matches!(self.code.as_str(), ERROR_STORE_FAILURE | "read_timeout")
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Domain enums
// ─────────────────────────────────────────────────────────────────────────────

/// Category of a monitored integrity condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NoFace,
    MultipleFaces,
    SuspiciousObject,
    AudioActivity,
    TabSwitch,
    ManualTest,
}

impl AlertKind {
    pub const ALL: [AlertKind; 6] = [
        AlertKind::NoFace,
        AlertKind::MultipleFaces,
        AlertKind::SuspiciousObject,
        AlertKind::AudioActivity,
        AlertKind::TabSwitch,
        AlertKind::ManualTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::NoFace => "no_face",
            AlertKind::MultipleFaces => "multiple_faces",
            AlertKind::SuspiciousObject => "suspicious_object",
            AlertKind::AudioActivity => "audio_activity",
            AlertKind::TabSwitch => "tab_switch",
            AlertKind::ManualTest => "manual_test",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Image,
    Audio,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Image => "image",
            EvidenceKind::Audio => "audio",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "image" => Some(EvidenceKind::Image),
            "audio" => Some(EvidenceKind::Audio),
            _ => None,
        }
    }

    /// File extension used when the payload is persisted.
    pub fn extension(&self) -> &'static str {
        match self {
            EvidenceKind::Image => "jpg",
            EvidenceKind::Audio => "webm",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub session_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub details: String,
    pub recorded_at: String,
    #[serde(default)]
    pub evidence_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub evidence_id: String,
    pub session_id: String,
    pub kind: EvidenceKind,
    pub captured_at: String,
    pub byte_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: String,
    pub started_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosed {
    pub session_id: String,
    pub ended_at: String,
    pub risk_score: u32,
    /// True when the session had already ended before this request.
    pub already_ended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub client_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub risk_score: u32,
    pub alerts: Vec<Alert>,
    pub evidence: Vec<EvidenceRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub client_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub alert_count: u32,
    pub risk_score: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request parameters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartSessionParams {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitAlertParams {
    #[serde(default)]
    pub alert_id: Option<String>,
    pub session_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub recorded_at: Option<String>,
    #[serde(default)]
    pub evidence_id: Option<String>,
}

impl From<&Alert> for SubmitAlertParams {
    fn from(alert: &Alert) -> Self {
        Self {
            alert_id: Some(alert.alert_id.clone()),
            session_id: alert.session_id.clone(),
            kind: alert.kind,
            severity: alert.severity,
            details: alert.details.clone(),
            recorded_at: Some(alert.recorded_at.clone()),
            evidence_id: alert.evidence_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitEvidenceParams {
    #[serde(default)]
    pub evidence_id: Option<String>,
    pub session_id: String,
    pub kind: EvidenceKind,
    #[serde(default)]
    pub captured_at: Option<String>,
    /// Base64 (standard alphabet) encoded payload.
    pub payload: String,
}

impl StartSessionParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.client_id, "client_id")
    }
}

impl SessionParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")
    }
}

impl SubmitAlertParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        if let Some(alert_id) = &self.alert_id {
            require_id(alert_id, "alert_id")?;
        }
        if let Some(evidence_id) = &self.evidence_id {
            require_id(evidence_id, "evidence_id")?;
        }
        if let Some(recorded_at) = &self.recorded_at {
            require_timestamp(recorded_at, "recorded_at")?;
        }
        Ok(())
    }
}

impl SubmitEvidenceParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.session_id, "session_id")?;
        if let Some(evidence_id) = &self.evidence_id {
            require_id(evidence_id, "evidence_id")?;
        }
        if let Some(captured_at) = &self.captured_at {
            require_timestamp(captured_at, "captured_at")?;
        }
        if self.payload.trim().is_empty() {
            return Err(ErrorInfo::new("empty_payload", "payload is required"));
        }
        Ok(())
    }

    pub fn decode_payload(&self) -> Result<Vec<u8>, ErrorInfo> {
        let bytes = decode_payload(&self.payload)?;
        if bytes.is_empty() {
            return Err(ErrorInfo::new("empty_payload", "payload decoded to zero bytes"));
        }
        Ok(bytes)
    }
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_payload(value: &str) -> Result<Vec<u8>, ErrorInfo> {
    STANDARD.decode(value.trim()).map_err(|err| {
        ErrorInfo::new(
            "invalid_payload",
            format!("payload is not valid base64: {}", err),
        )
    })
}

pub fn parse_start_session(params: Option<Value>) -> Result<StartSessionParams, ErrorInfo> {
    let parsed: StartSessionParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_session(params: Option<Value>) -> Result<SessionParams, ErrorInfo> {
    let parsed: SessionParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_submit_alert(params: Option<Value>) -> Result<SubmitAlertParams, ErrorInfo> {
    let parsed: SubmitAlertParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_submit_evidence(params: Option<Value>) -> Result<SubmitEvidenceParams, ErrorInfo> {
    let parsed: SubmitEvidenceParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params =
        params.ok_or_else(|| ErrorInfo::new("invalid_params", "request params are required"))?;
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("request params are invalid: {}", err),
        )
    })
}

fn require_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ErrorInfo::new(
            "invalid_id",
            format!("{} must be {} characters or fewer", field, MAX_ID_LENGTH),
        ));
    }
    Ok(())
}

fn require_timestamp(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if DateTime::parse_from_rfc3339(value).is_err() {
        return Err(ErrorInfo::new(
            "invalid_timestamp",
            format!("{} must be RFC3339", field),
        ));
    }
    Ok(())
}
