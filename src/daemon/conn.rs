//! An established controller connection with its pipe cache.
//!
//! Pipes are bound lazily, cached per kind, and invalidated together: a
//! transport error on any pipe means the session underneath is gone, so
//! keeping the siblings would just hand out dead handles.

use std::collections::HashMap;

use tracing::{debug, trace};

use super::discovery::DcCandidate;
use super::transport::{PipeAuth, PipeHandle, PipeKind, Session, SessionError};

pub struct Connection {
    pub dc: DcCandidate,
    session: Box<dyn Session>,
    pipes: HashMap<PipeKind, PipeHandle>,
}

impl Connection {
    pub fn new(dc: DcCandidate, session: Box<dyn Session>) -> Self {
        Self {
            dc,
            session,
            pipes: HashMap::new(),
        }
    }

    pub fn session(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    /// The cached handle for `kind`, binding it first if needed.
    ///
    /// Binding walks the pipe-security chain strongest first: schannel
    /// sealing when the session carries a secure-channel key, then sealed
    /// NTLM, then anonymous.
    pub fn pipe(&mut self, kind: PipeKind) -> Result<PipeHandle, SessionError> {
        if let Some(&handle) = self.pipes.get(&kind) {
            return Ok(handle);
        }

        let mut chain = Vec::with_capacity(3);
        if self.session.has_channel_key() {
            chain.push(PipeAuth::SchannelSealed);
        }
        chain.push(PipeAuth::NtlmSealed);
        chain.push(PipeAuth::Anonymous);

        let mut last_err = None;
        for auth in chain {
            match self.session.bind_pipe(kind, auth) {
                Ok(handle) => {
                    trace!(pipe = kind.pipe_name(), ?auth, "pipe bound");
                    self.pipes.insert(kind, handle);
                    return Ok(handle);
                }
                Err(SessionError::Transport(err)) => {
                    // Session is gone; no point trying weaker security.
                    return Err(SessionError::Transport(err));
                }
                Err(err) => {
                    trace!(pipe = kind.pipe_name(), ?auth, %err, "pipe bind refused");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(SessionError::Unsupported))
    }

    /// Drop every cached pipe handle at once.
    pub fn invalidate_pipes(&mut self) {
        if self.pipes.is_empty() {
            return;
        }
        debug!(dc = %self.dc.name, count = self.pipes.len(), "invalidating pipe cache");
        for (_, handle) in self.pipes.drain() {
            self.session.close_pipe(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DomainInfo, Sid};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Scripted session: refuses the given auth levels, counts binds/closes.
    struct FakeSession {
        refuse: Vec<PipeAuth>,
        channel_key: bool,
        next_handle: u64,
        binds: Arc<AtomicU64>,
        closes: Arc<AtomicU64>,
    }

    impl Session for FakeSession {
        fn legacy_session_setup(&mut self, _called_name: &str) -> Result<(), SessionError> {
            Ok(())
        }
        fn negotiate(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
        fn authenticate(
            &mut self,
            _method: &super::super::transport::AuthMethod,
        ) -> Result<(), SessionError> {
            Ok(())
        }
        fn tree_connect_ipc(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
        fn bind_pipe(
            &mut self,
            _kind: PipeKind,
            auth: PipeAuth,
        ) -> Result<PipeHandle, SessionError> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            if self.refuse.contains(&auth) {
                return Err(SessionError::BindRefused(format!("{auth:?}")));
            }
            self.next_handle += 1;
            Ok(PipeHandle(self.next_handle))
        }
        fn close_pipe(&mut self, _handle: PipeHandle) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn has_channel_key(&self) -> bool {
            self.channel_key
        }
        fn enum_trusts(&mut self, _pipe: PipeHandle) -> Result<Vec<DomainInfo>, SessionError> {
            Ok(Vec::new())
        }
        fn lookup_name(
            &mut self,
            _pipe: PipeHandle,
            _name: &str,
        ) -> Result<Option<Sid>, SessionError> {
            Ok(None)
        }
        fn lookup_sid(
            &mut self,
            _pipe: PipeHandle,
            _sid: &Sid,
        ) -> Result<Option<String>, SessionError> {
            Ok(None)
        }
        fn sequence_number(&mut self, _pipe: PipeHandle) -> Result<u64, SessionError> {
            Ok(0)
        }
    }

    fn conn(refuse: Vec<PipeAuth>, channel_key: bool) -> (Connection, Arc<AtomicU64>, Arc<AtomicU64>) {
        let binds = Arc::new(AtomicU64::new(0));
        let closes = Arc::new(AtomicU64::new(0));
        let session = FakeSession {
            refuse,
            channel_key,
            next_handle: 0,
            binds: binds.clone(),
            closes: closes.clone(),
        };
        (
            Connection::new(DcCandidate::new("DC01", "10.0.0.1"), Box::new(session)),
            binds,
            closes,
        )
    }

    #[test]
    fn bind_falls_back_down_the_chain() {
        // Schannel and NTLM refused, anonymous accepted: three attempts.
        let (mut conn, binds, _) =
            conn(vec![PipeAuth::SchannelSealed, PipeAuth::NtlmSealed], true);
        conn.pipe(PipeKind::Policy).unwrap();
        assert_eq!(binds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn schannel_is_skipped_without_channel_key() {
        let (mut conn, binds, _) = conn(Vec::new(), false);
        conn.pipe(PipeKind::Directory).unwrap();
        // Straight to ntlm-sealed.
        assert_eq!(binds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pipes_are_cached_per_kind() {
        let (mut conn, binds, _) = conn(Vec::new(), true);
        let first = conn.pipe(PipeKind::Policy).unwrap();
        let second = conn.pipe(PipeKind::Policy).unwrap();
        assert_eq!(first, second);
        assert_eq!(binds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_closes_everything_together() {
        let (mut conn, _, closes) = conn(Vec::new(), true);
        conn.pipe(PipeKind::Policy).unwrap();
        conn.pipe(PipeKind::Directory).unwrap();
        conn.invalidate_pipes();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        // Next use rebinds.
        let handle = conn.pipe(PipeKind::Policy).unwrap();
        assert_ne!(handle, PipeHandle(0));
    }
}
