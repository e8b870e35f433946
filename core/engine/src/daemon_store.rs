//! `SessionStore` backed by proctor-daemon over its Unix socket.
//!
//! One short-lived connection per request, newline-delimited JSON. Transport
//! failures map to `StoreError::Unavailable` so the delivery worker retries
//! them; daemon error responses map to `StoreError::Rejected`.

use crate::config::proctor_home;
use crate::error::StoreError;
use crate::evidence::CapturedEvidence;
use crate::store::SessionStore;
use proctor_daemon_protocol::{
    Alert, EvidenceRef, Method, Request, Response, SessionClosed, SessionParams, SessionReport,
    SessionStarted, SessionSummary, StartSessionParams, SubmitAlertParams, MAX_REQUEST_BYTES,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SOCKET_ENV: &str = "PROCTOR_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 2_000;

/// Resolves the daemon socket: `$PROCTOR_DAEMON_SOCKET`, else
/// `<proctor home>/daemon.sock`.
pub fn socket_path() -> Result<PathBuf, StoreError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    proctor_home()
        .map(|root| root.join(SOCKET_NAME))
        .ok_or_else(|| StoreError::Unavailable("Home directory not found".to_string()))
}

#[derive(Debug, Clone)]
pub struct DaemonSessionStore {
    socket: PathBuf,
    timeout: Duration,
}

impl DaemonSessionStore {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: Duration::from_millis(READ_TIMEOUT_MS),
        }
    }

    pub fn from_env() -> Result<Self, StoreError> {
        socket_path().map(Self::new)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn health(&self) -> Result<Value, StoreError> {
        self.call(Method::GetHealth, None::<&()>)
    }

    pub fn report(&self, session_id: &str) -> Result<SessionReport, StoreError> {
        self.call(
            Method::GetReport,
            Some(&SessionParams {
                session_id: session_id.to_string(),
            }),
        )
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.call(Method::ListSessions, None::<&()>)
    }

    fn call<P, T>(&self, method: Method, params: Option<&P>) -> Result<T, StoreError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let params = params
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| StoreError::Malformed(format!("Failed to serialize params: {}", err)))?;
        let mut request = Request::new(method, params);
        request.id = Some(ulid::Ulid::new().to_string());

        let response = self.send_request(&request)?;
        if !response.ok {
            return Err(match response.error {
                Some(info) => StoreError::from(info),
                None => StoreError::Malformed("Unknown daemon error".to_string()),
            });
        }
        let data = response
            .data
            .ok_or_else(|| StoreError::Malformed("Daemon response had no data".to_string()))?;
        serde_json::from_value(data)
            .map_err(|err| StoreError::Malformed(format!("Unexpected response shape: {}", err)))
    }

    fn send_request(&self, request: &Request) -> Result<Response, StoreError> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|err| {
            StoreError::Unavailable(format!("Failed to connect to daemon socket: {}", err))
        })?;
        let _ = stream.set_read_timeout(Some(self.timeout));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

        serde_json::to_writer(&mut stream, request)
            .map_err(|err| StoreError::Unavailable(format!("Failed to write request: {}", err)))?;
        stream
            .write_all(b"\n")
            .map_err(|err| StoreError::Unavailable(format!("Failed to flush request: {}", err)))?;
        stream.flush().ok();

        read_response(&mut stream)
    }
}

fn read_response(stream: &mut UnixStream) -> Result<Response, StoreError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(StoreError::Malformed(
                        "Response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(StoreError::Unavailable(
                    "Timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "Failed to read response: {}",
                    err
                )))
            }
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err(StoreError::Unavailable(
            "Daemon response was empty".to_string(),
        ));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| StoreError::Malformed(format!("Failed to parse response JSON: {}", err)))
}

impl SessionStore for DaemonSessionStore {
    fn start_session(&self, client_id: &str) -> Result<SessionStarted, StoreError> {
        self.call(
            Method::StartSession,
            Some(&StartSessionParams {
                client_id: client_id.to_string(),
            }),
        )
    }

    fn end_session(&self, session_id: &str) -> Result<SessionClosed, StoreError> {
        self.call(
            Method::EndSession,
            Some(&SessionParams {
                session_id: session_id.to_string(),
            }),
        )
    }

    fn submit_alert(&self, alert: &Alert) -> Result<Alert, StoreError> {
        self.call(Method::SubmitAlert, Some(&SubmitAlertParams::from(alert)))
    }

    fn submit_evidence(&self, evidence: &CapturedEvidence) -> Result<EvidenceRef, StoreError> {
        self.call(Method::SubmitEvidence, Some(&evidence.to_params()))
    }
}
