//! Controller transport seam.
//!
//! The daemon orchestrates sessions through the [`SecurityProvider`] trait;
//! the SMB/RPC marshalling behind it is supplied by the embedder (tests use
//! scripted fakes). What lives here is the part we own end to end: racing a
//! TCP connect against both file-service ports under one deadline.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel;
use tracing::{debug, trace};

use crate::core::Secret;

/// The modern direct-hosted port. Connecting here skips the NetBIOS session
/// preamble.
pub const PORT_DIRECT: u16 = 445;
/// The legacy NetBIOS session port, which needs a called-name handshake
/// before SMB negotiation.
pub const PORT_LEGACY: u16 = 139;

/// One identity the establisher may present, in fallback order.
#[derive(Clone)]
pub enum AuthMethod {
    Kerberos {
        principal: String,
        realm: String,
    },
    NtlmMachine {
        domain: String,
        account: String,
        secret: Secret,
    },
    NtlmService {
        domain: String,
        user: String,
        secret: Secret,
    },
    Anonymous,
}

impl AuthMethod {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Kerberos { .. } => "kerberos",
            AuthMethod::NtlmMachine { .. } => "ntlm-machine",
            AuthMethod::NtlmService { .. } => "ntlm-service",
            AuthMethod::Anonymous => "anonymous",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak secrets through debug output.
        f.write_str(self.label())
    }
}

/// The named pipes we bind over an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeKind {
    /// Security-policy queries (domain SID, trust enumeration).
    Policy,
    /// Directory lookups (name<->SID translation).
    Directory,
    /// Credential validation.
    Auth,
}

impl PipeKind {
    pub const ALL: [PipeKind; 3] = [PipeKind::Policy, PipeKind::Directory, PipeKind::Auth];

    pub fn pipe_name(self) -> &'static str {
        match self {
            PipeKind::Policy => "lsarpc",
            PipeKind::Directory => "samr",
            PipeKind::Auth => "netlogon",
        }
    }
}

/// Pipe-level security, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeAuth {
    /// Sealed with the secure-channel key. Needs a machine credential
    /// exchange to have happened on this session.
    SchannelSealed,
    /// Sealed with the session's NTLM key.
    NtlmSealed,
    Anonymous,
}

/// An open pipe bind. Opaque to everything but the provider that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeHandle(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("share unavailable: {0}")]
    ShareUnavailable(String),
    #[error("pipe bind refused: {0}")]
    BindRefused(String),
    #[error("transport failed: {0}")]
    Transport(#[from] io::Error),
    #[error("no security backend linked")]
    Unsupported,
}

/// An established (but not necessarily authenticated) session with one
/// controller.
pub trait Session: Send {
    /// NetBIOS called-name handshake, required before negotiation on the
    /// legacy port only.
    fn legacy_session_setup(&mut self, called_name: &str) -> Result<(), SessionError>;

    fn negotiate(&mut self) -> Result<(), SessionError>;

    fn authenticate(&mut self, method: &AuthMethod) -> Result<(), SessionError>;

    /// Connect the IPC$ share the pipes live under.
    fn tree_connect_ipc(&mut self) -> Result<(), SessionError>;

    fn bind_pipe(&mut self, kind: PipeKind, auth: PipeAuth) -> Result<PipeHandle, SessionError>;

    fn close_pipe(&mut self, handle: PipeHandle);

    /// Whether a secure-channel key is available for schannel pipe binds.
    fn has_channel_key(&self) -> bool;

    /// Enumerate trusts via a bound policy pipe.
    fn enum_trusts(&mut self, pipe: PipeHandle) -> Result<Vec<crate::core::DomainInfo>, SessionError>;

    /// Resolve a name to a SID via a bound directory pipe.
    fn lookup_name(&mut self, pipe: PipeHandle, name: &str)
        -> Result<Option<crate::core::Sid>, SessionError>;

    /// Resolve a SID to a name via a bound directory pipe.
    fn lookup_sid(&mut self, pipe: PipeHandle, sid: &crate::core::Sid)
        -> Result<Option<String>, SessionError>;

    /// Current directory sequence number, used for cache validation.
    fn sequence_number(&mut self, pipe: PipeHandle) -> Result<u64, SessionError>;
}

/// Supplies sessions for controller addresses.
pub trait SecurityProvider: Send + Sync {
    fn open(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError>;
}

/// Race one connect per configured port under a shared deadline; the first
/// session to come up wins and the rest are abandoned.
pub fn race_connect(
    provider: &Arc<dyn SecurityProvider>,
    host: &str,
    ports: &[u16],
    timeout: Duration,
) -> Result<(Box<dyn Session>, u16), SessionError> {
    if ports.is_empty() {
        return Err(SessionError::Transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no ports configured",
        )));
    }

    let (tx, rx) = channel::bounded::<(u16, Result<Box<dyn Session>, SessionError>)>(ports.len());
    for &port in ports {
        let provider = Arc::clone(provider);
        let host = host.to_string();
        let tx = tx.clone();
        std::thread::spawn(move || {
            let result = provider.open(&host, port, timeout);
            let _ = tx.send((port, result));
        });
    }
    drop(tx);

    let mut last_err = None;
    let deadline = timeout + Duration::from_millis(250);
    for _ in 0..ports.len() {
        match rx.recv_timeout(deadline) {
            Ok((port, Ok(session))) => {
                trace!(host, port, "controller socket up");
                return Ok((session, port));
            }
            Ok((port, Err(err))) => {
                debug!(host, port, %err, "connect attempt failed");
                last_err = Some(err);
            }
            Err(_) => break,
        }
    }

    Err(last_err.unwrap_or_else(|| {
        SessionError::Transport(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
    }))
}

/// Plain-TCP provider used when no SMB security backend is linked in.
///
/// Socket establishment is real, so it is good enough for liveness probes;
/// every session operation past that reports [`SessionError::Unsupported`],
/// which the establisher treats like an exhausted auth chain.
pub struct TcpProbeProvider;

impl SecurityProvider for TcpProbeProvider {
    fn open(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, SessionError> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Ok(Box::new(TcpProbeSession { _stream: stream }))
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            SessionError::Transport(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {host}"),
            ))
        })
}

struct TcpProbeSession {
    _stream: TcpStream,
}

impl Session for TcpProbeSession {
    fn legacy_session_setup(&mut self, _called_name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn negotiate(&mut self) -> Result<(), SessionError> {
        Err(SessionError::Unsupported)
    }

    fn authenticate(&mut self, _method: &AuthMethod) -> Result<(), SessionError> {
        Err(SessionError::Unsupported)
    }

    fn tree_connect_ipc(&mut self) -> Result<(), SessionError> {
        Err(SessionError::Unsupported)
    }

    fn bind_pipe(&mut self, _kind: PipeKind, _auth: PipeAuth) -> Result<PipeHandle, SessionError> {
        Err(SessionError::Unsupported)
    }

    fn close_pipe(&mut self, _handle: PipeHandle) {}

    fn has_channel_key(&self) -> bool {
        false
    }

    fn enum_trusts(
        &mut self,
        _pipe: PipeHandle,
    ) -> Result<Vec<crate::core::DomainInfo>, SessionError> {
        Err(SessionError::Unsupported)
    }

    fn lookup_name(
        &mut self,
        _pipe: PipeHandle,
        _name: &str,
    ) -> Result<Option<crate::core::Sid>, SessionError> {
        Err(SessionError::Unsupported)
    }

    fn lookup_sid(
        &mut self,
        _pipe: PipeHandle,
        _sid: &crate::core::Sid,
    ) -> Result<Option<String>, SessionError> {
        Err(SessionError::Unsupported)
    }

    fn sequence_number(&mut self, _pipe: PipeHandle) -> Result<u64, SessionError> {
        Err(SessionError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn race_prefers_whichever_port_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let provider: Arc<dyn SecurityProvider> = Arc::new(TcpProbeProvider);

        // A port nobody listens on plus the live one; the live one must win.
        let (session, winner) = race_connect(
            &provider,
            "127.0.0.1",
            &[1, port],
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(winner, port);
        drop(session);
    }

    #[test]
    fn race_fails_when_nothing_listens() {
        let provider: Arc<dyn SecurityProvider> = Arc::new(TcpProbeProvider);
        let result = race_connect(&provider, "127.0.0.1", &[1], Duration::from_millis(300));
        assert!(result.is_err());
    }
}
