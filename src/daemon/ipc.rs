//! Client IPC protocol and codec.
//!
//! Protocol: newline-delimited JSON over a Unix socket.
//!
//! Request format: `{"op": "sid_to_id", ...}\n`
//! Response format: `{"ok": ...}\n` or `{"err": {"code": "...", "message": "..."}}\n`

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{IdKind, MapStatus, Mapping, TrustKind};
use crate::error::Transience;

/// Bumped whenever request or response shapes change incompatibly.
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// IPC request (lookup, mapping mutation, or control).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Resolve a SID to its unix id, if mapped.
    SidToId { sid: String },

    /// Resolve a unix id back to its SID, if mapped.
    IdToSid { kind: IdKind, id: u32 },

    /// Record an explicit mapping.
    SetMapping { sid: String, kind: IdKind, id: u32 },

    /// Remove a mapping; both sides must match what is stored.
    RemoveMapping { sid: String, kind: IdKind, id: u32 },

    /// Allocate the next free id for a SID.
    Allocate { sid: String, kind: IdKind },

    /// Resolve `domain\name` to a SID through the domain's controller.
    LookupName { domain: String, name: String },

    /// Resolve a SID to its qualified name through the owning domain.
    LookupSid { sid: String },

    /// Liveness and affinity of one domain, or all of them.
    DomainStatus {
        #[serde(default)]
        domain: Option<String>,
    },

    /// Force a domain offline (or lift the force); omitting `domain`
    /// applies to every non-internal domain. Lifting also clears the
    /// domain's negative-cache verdicts and triggers a reconnect.
    SetOffline {
        #[serde(default)]
        domain: Option<String>,
        offline: bool,
    },

    Ping,
    Shutdown,
}

/// Answer to the mapping operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingAnswer {
    pub status: MapStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<IdKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl MappingAnswer {
    pub fn mapped(mapping: &Mapping) -> Self {
        Self {
            status: MapStatus::Mapped,
            sid: Some(mapping.sid.to_string()),
            kind: Some(mapping.kind),
            id: Some(mapping.id),
        }
    }

    pub fn unmapped() -> Self {
        Self {
            status: MapStatus::Unmapped,
            sid: None,
            kind: None,
            id: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: MapStatus::Unknown,
            sid: None,
            kind: None,
            id: None,
        }
    }
}

/// Answer to the directory lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAnswer {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One domain's runtime status as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStatus {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub kind: TrustKind,
    pub liveness: String,
    pub forced_offline: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dc: Option<String>,
}

/// IPC response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: ResponsePayload },
    Err { err: ErrorPayload },
}

impl Response {
    pub fn ok(payload: ResponsePayload) -> Self {
        Response::Ok { ok: payload }
    }

    pub fn err(error: impl Into<ErrorPayload>) -> Self {
        Response::Err { err: error.into() }
    }
}

/// Successful response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Mapping(MappingAnswer),
    Resolved(ResolvedAnswer),
    Domains(Vec<DomainStatus>),
    Pong { version: String, protocol: u32 },
    Ack(Ack),
}

/// Bare acknowledgements, serialized as plain strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    Done,
    ShuttingDown,
}

/// Error response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Some(serde_json::json!({ "retryable": retryable })),
        }
    }
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client disconnected")]
    Disconnected,

    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),
}

impl IpcError {
    pub fn code(&self) -> &'static str {
        match self {
            IpcError::Parse(_) => "parse_error",
            IpcError::Io(_) => "io_error",
            IpcError::Disconnected => "disconnected",
            IpcError::DaemonUnavailable(_) => "daemon_unavailable",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            IpcError::Parse(_) => Transience::Permanent,
            IpcError::Io(_) => Transience::Unknown,
            IpcError::Disconnected => Transience::Retryable,
            IpcError::DaemonUnavailable(_) => Transience::Retryable,
        }
    }
}

impl From<IpcError> for ErrorPayload {
    fn from(e: IpcError) -> Self {
        ErrorPayload::new(e.code(), e.to_string(), e.transience().is_retryable())
    }
}

/// Daemon metadata written next to the socket for client version checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonMeta {
    pub version: String,
    pub protocol_version: u32,
    pub pid: u32,
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, IpcError> {
    let mut bytes = serde_json::to_vec(resp)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_request(line: &str) -> Result<Request, IpcError> {
    Ok(serde_json::from_str(line)?)
}

/// Create the socket directory with owner-only permissions.
pub fn ensure_socket_dir() -> Result<PathBuf, IpcError> {
    let dir = crate::paths::socket_dir();
    fs::create_dir_all(&dir)?;

    let mode = fs::metadata(&dir)?.permissions().mode() & 0o777;
    if mode != 0o700 {
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    Ok(dir)
}

/// Send one request to a running daemon and wait for its answer.
pub fn send_request(request: &Request) -> Result<Response, IpcError> {
    let socket = crate::paths::socket_path();
    let stream = UnixStream::connect(&socket).map_err(|e| {
        IpcError::DaemonUnavailable(format!("cannot reach {}: {e}", socket.display()))
    })?;

    let mut writer = stream.try_clone()?;
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;

    let mut reader = BufReader::new(stream);
    let mut answer = String::new();
    if reader.read_line(&mut answer)? == 0 {
        return Err(IpcError::Disconnected);
    }
    Ok(serde_json::from_str(&answer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_decode_from_tagged_json() {
        let req = decode_request(r#"{"op":"sid_to_id","sid":"S-1-5-21-1-2-3-500"}"#).unwrap();
        assert!(matches!(req, Request::SidToId { ref sid } if sid == "S-1-5-21-1-2-3-500"));

        let req = decode_request(r#"{"op":"id_to_sid","kind":"uid","id":10005}"#).unwrap();
        assert!(matches!(
            req,
            Request::IdToSid {
                kind: IdKind::Uid,
                id: 10005
            }
        ));

        let req = decode_request(r#"{"op":"domain_status"}"#).unwrap();
        assert!(matches!(req, Request::DomainStatus { domain: None }));
    }

    #[test]
    fn responses_encode_as_ok_or_err() {
        let ok = encode_response(&Response::ok(ResponsePayload::Ack(Ack::Done))).unwrap();
        assert_eq!(String::from_utf8(ok).unwrap(), "{\"ok\":\"done\"}\n");

        let err = encode_response(&Response::err(ErrorPayload::new(
            "none_mapped",
            "no such mapping",
            false,
        )))
        .unwrap();
        let text = String::from_utf8(err).unwrap();
        assert!(text.contains("\"code\":\"none_mapped\""));
    }

    #[test]
    fn mapping_answer_omits_empty_fields() {
        let raw = serde_json::to_string(&MappingAnswer::unmapped()).unwrap();
        assert_eq!(raw, r#"{"status":"unmapped"}"#);
    }
}
