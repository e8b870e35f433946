//! Proctor daemon entrypoint.
//!
//! A small single-writer service that owns the session record: a socket
//! listener, strict request validation, SQLite for sessions, alerts and
//! evidence metadata, and payload files on disk.

use fs_err as fs;
use serde::Serialize;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use proctor_daemon_protocol::{
    parse_session, parse_start_session, parse_submit_alert, parse_submit_evidence, ErrorInfo,
    Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod config;
mod db;
mod evidence_store;
mod session_store;
mod state;

use db::Db;
use evidence_store::EvidenceStore;
use state::SharedState;

const READ_TIMEOUT_SECS: u64 = 5;
const READ_CHUNK_SIZE: usize = 64 * 1024;

fn main() {
    init_logging();

    let socket_path = match config::daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let daemon_config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load daemon config");
            std::process::exit(1);
        }
    };

    let evidence_dir = match daemon_config.resolve_evidence_dir() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve evidence directory");
            std::process::exit(1);
        }
    };

    let db_path = match config::daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    info!(
        evidence_dir = %evidence_dir.display(),
        max_evidence_bytes = daemon_config.max_evidence_bytes,
        max_details_len = daemon_config.max_details_len,
        "Daemon config loaded"
    );
    let shared_state = Arc::new(SharedState::new(
        db,
        EvidenceStore::new(evidence_dir),
        daemon_config,
    ));

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Proctor daemon started");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("PROCTOR_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
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
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;
    match request.method {
        Method::GetHealth => Response::ok(
            id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "evidence_dir": state.evidence_dir().display().to_string(),
            }),
        ),
        Method::StartSession => respond(
            id,
            "session",
            parse_start_session(params).and_then(|parsed| state.start_session(&parsed)),
        ),
        Method::EndSession => respond(
            id,
            "session",
            parse_session(params).and_then(|parsed| state.end_session(&parsed.session_id)),
        ),
        Method::SubmitAlert => respond(
            id,
            "alert",
            parse_submit_alert(params).and_then(|parsed| state.submit_alert(parsed)),
        ),
        Method::SubmitEvidence => respond(
            id,
            "evidence",
            parse_submit_evidence(params).and_then(|parsed| state.submit_evidence(parsed)),
        ),
        Method::GetReport => respond(
            id,
            "report",
            parse_session(params).and_then(|parsed| state.report(&parsed.session_id)),
        ),
        Method::ListSessions => {
            let result = state.sessions_snapshot();
            if let Ok(sessions) = &result {
                tracing::debug!(sessions = sessions.len(), "Sessions snapshot");
            }
            respond(id, "sessions", result)
        }
    }
}

fn respond<T: Serialize>(id: Option<String>, what: &str, result: Result<T, ErrorInfo>) -> Response {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize {}: {}", what, err),
            ),
        },
        Err(err) => {
            if err.is_transient() {
                error!(code = %err.code, message = %err.message, "Request failed in store");
            } else {
                info!(code = %err.code, message = %err.message, "Request rejected");
            }
            Response::error_with_info(id, err)
        }
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
