//! Connection establishment.
//!
//! Orders candidates (remembered controller first), races the socket
//! connect, walks the authentication chain strongest-first, and connects
//! the IPC$ share. Candidates whose chain is exhausted are written to the
//! negative cache so the next establish call skips them while the entry
//! lives.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, ConnectConfig};
use crate::core::DomainInfo;
use crate::error::Transience;

use super::conn::Connection;
use super::discovery::{DcCandidate, Discovery, DiscoveryError};
use super::negcache::{FailReason, NegativeConnCache};
use super::registry::DcAffinity;
use super::transport::{race_connect, AuthMethod, SecurityProvider, SessionError, PORT_LEGACY};

#[derive(Debug, Error)]
pub enum ConnectError {
    /// No mechanism produced a candidate. No socket was ever dialed.
    #[error("no controllers discovered for {domain}")]
    DiscoveryEmpty { domain: String },

    /// Every candidate failed in every cycle.
    #[error("could not reach any controller for {domain} after {cycles} cycles")]
    Exhausted { domain: String, cycles: u32 },

    /// An operator forced the domain offline; nothing was attempted.
    #[error("{domain} is administratively offline")]
    ForcedOffline { domain: String },
}

impl ConnectError {
    pub fn transience(&self) -> Transience {
        match self {
            ConnectError::DiscoveryEmpty { .. } => Transience::Retryable,
            ConnectError::Exhausted { .. } => Transience::Retryable,
            ConnectError::ForcedOffline { .. } => Transience::Permanent,
        }
    }
}

/// Why one candidate was rejected, for the negative cache.
fn classify(err: &SessionError) -> FailReason {
    match err {
        SessionError::Transport(_) => FailReason::ConnectTimeout,
        SessionError::ShareUnavailable(_) => FailReason::ShareUnavailable,
        _ => FailReason::AuthRejected,
    }
}

pub struct Establisher {
    connect: ConnectConfig,
    auth: AuthConfig,
    provider: Arc<dyn SecurityProvider>,
}

impl Establisher {
    pub fn new(
        connect: ConnectConfig,
        auth: AuthConfig,
        provider: Arc<dyn SecurityProvider>,
    ) -> Self {
        Self {
            connect,
            auth,
            provider,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.connect.timeout()
    }

    /// Try to bring up a session with some controller of `domain`.
    ///
    /// Candidates negative-cached before this call are skipped; candidates
    /// failing during it are retried on later cycles and written to the
    /// cache only when the whole attempt gives up.
    pub fn establish(
        &self,
        domain: &DomainInfo,
        affinity: Option<&DcAffinity>,
        discovery: &Discovery,
        negcache: &mut NegativeConnCache,
    ) -> Result<Connection, ConnectError> {
        let mut candidates = match discovery.discover(domain) {
            Ok(candidates) => candidates,
            Err(DiscoveryError::Empty { domain }) => {
                return Err(ConnectError::DiscoveryEmpty { domain });
            }
            Err(err) => {
                warn!(domain = %domain.name, %err, "discovery failed outright");
                return Err(ConnectError::DiscoveryEmpty {
                    domain: domain.name.clone(),
                });
            }
        };

        if let Some(affinity) = affinity {
            promote_affinity(&mut candidates, affinity);
        }

        let skipped: Vec<String> = candidates
            .iter()
            .filter(|c| negcache.contains(&domain.name, &c.name))
            .map(|c| c.name.clone())
            .collect();
        if !skipped.is_empty() {
            debug!(domain = %domain.name, ?skipped, "skipping negative-cached controllers");
        }

        let mut last_failures: Vec<(String, FailReason)> = Vec::new();
        for cycle in 1..=self.connect.cycles {
            last_failures.clear();
            for candidate in &candidates {
                if skipped.contains(&candidate.name) {
                    continue;
                }
                match self.try_candidate(domain, candidate) {
                    Ok(connection) => {
                        info!(
                            domain = %domain.name,
                            dc = %candidate.name,
                            cycle,
                            "controller connection established"
                        );
                        return Ok(connection);
                    }
                    Err(err) => {
                        debug!(domain = %domain.name, dc = %candidate.name, cycle, %err, "candidate failed");
                        last_failures.push((candidate.name.clone(), classify(&err)));
                    }
                }
            }
        }

        for (name, reason) in last_failures {
            negcache.insert(&domain.name, &name, reason);
        }
        Err(ConnectError::Exhausted {
            domain: domain.name.clone(),
            cycles: self.connect.cycles,
        })
    }

    fn try_candidate(
        &self,
        domain: &DomainInfo,
        candidate: &DcCandidate,
    ) -> Result<Connection, SessionError> {
        let (mut session, port) = race_connect(
            &self.provider,
            &candidate.host,
            &self.connect.ports,
            self.connect.timeout(),
        )?;

        if port == PORT_LEGACY {
            session.legacy_session_setup(&candidate.name)?;
        }
        session.negotiate()?;

        let mut authenticated = false;
        let mut last_err = None;
        for method in self.auth_chain(domain) {
            match session.authenticate(&method) {
                Ok(()) => {
                    debug!(dc = %candidate.name, method = method.label(), "session authenticated");
                    authenticated = true;
                    break;
                }
                Err(SessionError::Transport(err)) => return Err(SessionError::Transport(err)),
                Err(err) => last_err = Some(err),
            }
        }
        if !authenticated {
            return Err(last_err
                .unwrap_or_else(|| SessionError::Rejected("empty auth chain".to_string())));
        }

        session.tree_connect_ipc().map_err(|err| match err {
            SessionError::Transport(io) => SessionError::Transport(io),
            other => SessionError::ShareUnavailable(other.to_string()),
        })?;

        Ok(Connection::new(candidate.clone(), session))
    }

    /// The identities to present, strongest first. Anonymous always closes
    /// the chain so a lookup-only session can still come up.
    fn auth_chain(&self, domain: &DomainInfo) -> Vec<AuthMethod> {
        let mut chain = Vec::with_capacity(4);

        if self.auth.kerberos && domain.attributes.active_directory {
            if let Some(realm) = self.auth.realm.clone() {
                chain.push(AuthMethod::Kerberos {
                    principal: self.auth.machine_account_or_default(),
                    realm,
                });
            }
        }

        chain.push(AuthMethod::NtlmMachine {
            domain: self.auth.domain.clone(),
            account: self.auth.machine_account_or_default(),
            secret: self.auth.machine_secret.clone(),
        });

        if self.auth.has_service_account() {
            chain.push(AuthMethod::NtlmService {
                domain: self.auth.domain.clone(),
                user: self.auth.service_user.clone().unwrap_or_default(),
                secret: self.auth.service_secret.clone(),
            });
        }

        chain.push(AuthMethod::Anonymous);
        chain
    }
}

/// Move the remembered controller to the front, adding it if discovery
/// forgot about it this round.
fn promote_affinity(candidates: &mut Vec<DcCandidate>, affinity: &DcAffinity) {
    if let Some(pos) = candidates
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(&affinity.name))
    {
        let preferred = candidates.remove(pos);
        candidates.insert(0, preferred);
    } else {
        candidates.insert(0, DcCandidate::new(affinity.name.clone(), affinity.host.clone()));
    }
}
