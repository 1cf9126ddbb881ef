//! Worker threads.
//!
//! Each non-internal domain gets a worker owning that domain's controller
//! connection; one mapper worker owns the idmap store. Workers consume
//! encoded request frames from their channel, answer on the shared event
//! channel, and never touch each other's state. The state loop is the only
//! other party.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::core::{DomainInfo, MapStatus};
use crate::store::{IdmapStore, StoreError};

use super::conn::Connection;
use super::discovery::Discovery;
use super::dispatch::Target;
use super::establish::{ConnectError, Establisher};
use super::negcache::NegativeConnCache;
use super::registry::DcAffinity;
use super::transport::{PipeKind, SessionError};
use super::wire::{self, ResponseFrame, WorkerReply, WorkerRequest};

/// Everything workers report back to the state loop.
pub enum WorkerEvent {
    /// An encoded [`ResponseFrame`] answering a dispatched request.
    Response { target: Target, frame: Vec<u8> },
    /// The domain worker lost (or failed to establish) its connection.
    ConnLost { domain: String },
    /// The domain worker came online, with the controller it landed on.
    ConnUp { domain: String, affinity: DcAffinity },
    /// A liveness probe finished (see [`super::liveness::spawn_prober`]).
    ProbeDone { domain: String, reachable: bool },
    /// A worker thread is gone. Requests parked on it will never be
    /// answered; the state loop fails them wholesale.
    WorkerExited { target: Target },
}

/// Sends [`WorkerEvent::WorkerExited`] when a worker loop returns, and also
/// when it unwinds.
struct ExitNotice {
    target: Target,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::WorkerExited {
            target: self.target.clone(),
        });
    }
}

pub struct DomainWorker {
    domain: DomainInfo,
    establisher: Arc<Establisher>,
    discovery: Arc<Discovery>,
    /// Per-worker: each domain remembers its own bad controllers.
    negcache: NegativeConnCache,
    affinity: Option<DcAffinity>,
    connection: Option<Connection>,
    /// Set after establishment exhausts its cycles. While set, requests
    /// short-circuit instead of re-burning connect timeouts; only a
    /// `Reconnect { bypass_offline: true }` clears it.
    offline: bool,
    events: Sender<WorkerEvent>,
}

impl DomainWorker {
    pub fn new(
        domain: DomainInfo,
        establisher: Arc<Establisher>,
        discovery: Arc<Discovery>,
        negcache_ttl: std::time::Duration,
        events: Sender<WorkerEvent>,
    ) -> Self {
        Self {
            domain,
            establisher,
            discovery,
            negcache: NegativeConnCache::new(negcache_ttl),
            affinity: None,
            connection: None,
            offline: false,
            events,
        }
    }

    fn target(&self) -> Target {
        Target::domain(&self.domain.name)
    }

    fn ensure_connection(&mut self, bypass_offline: bool) -> Result<(), WorkerReply> {
        if self.connection.is_some() {
            return Ok(());
        }
        if self.offline && !bypass_offline {
            return Err(WorkerReply::Fault {
                code: "domain_offline".to_string(),
                message: format!("{} is offline", self.domain.name),
                retryable: true,
            });
        }
        if bypass_offline {
            // A probe said the domain is back; stale verdicts must not veto.
            self.negcache.clear_domain(&self.domain.name);
        }

        match self.establisher.establish(
            &self.domain,
            self.affinity.as_ref(),
            &self.discovery,
            &mut self.negcache,
        ) {
            Ok(connection) => {
                let affinity = DcAffinity {
                    name: connection.dc.name.clone(),
                    host: connection.dc.host.clone(),
                };
                self.affinity = Some(affinity.clone());
                self.connection = Some(connection);
                self.offline = false;
                let _ = self.events.send(WorkerEvent::ConnUp {
                    domain: self.domain.name.clone(),
                    affinity,
                });
                Ok(())
            }
            Err(err) => {
                self.offline = true;
                let _ = self.events.send(WorkerEvent::ConnLost {
                    domain: self.domain.name.clone(),
                });
                Err(fault_from_connect(&err))
            }
        }
    }

    /// Drop the connection after a transport error and tell the parent.
    fn drop_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.invalidate_pipes();
        }
        self.offline = true;
        let _ = self.events.send(WorkerEvent::ConnLost {
            domain: self.domain.name.clone(),
        });
    }

    fn handle(&mut self, request: WorkerRequest) -> WorkerReply {
        let bypass = matches!(
            request,
            WorkerRequest::Reconnect {
                bypass_offline: true
            }
        );
        match request {
            WorkerRequest::Ping => WorkerReply::Pong,
            WorkerRequest::Reconnect { .. } => {
                // Force a fresh establishment even if one is up.
                if let Some(mut connection) = self.connection.take() {
                    connection.invalidate_pipes();
                }
                match (self.ensure_connection(bypass), self.affinity.clone()) {
                    (Ok(()), Some(dc)) => WorkerReply::Connected {
                        dc_name: dc.name,
                        dc_host: dc.host,
                    },
                    (Ok(()), None) => WorkerReply::Fault {
                        code: "internal".to_string(),
                        message: "connected without affinity".to_string(),
                        retryable: true,
                    },
                    (Err(fault), _) => fault,
                }
            }
            WorkerRequest::LookupName { name } => {
                self.with_pipe(PipeKind::Directory, move |session, pipe| {
                    session
                        .lookup_name(pipe, &name)
                        .map(|sid| WorkerReply::NameResolved { sid })
                })
            }
            WorkerRequest::LookupSid { sid } => {
                self.with_pipe(PipeKind::Directory, move |session, pipe| {
                    session
                        .lookup_sid(pipe, &sid)
                        .map(|name| WorkerReply::SidResolved { name })
                })
            }
            WorkerRequest::EnumTrusts => self.with_pipe(PipeKind::Policy, |session, pipe| {
                session
                    .enum_trusts(pipe)
                    .map(|domains| WorkerReply::Trusts { domains })
            }),
            WorkerRequest::SequenceNumber => {
                self.with_pipe(PipeKind::Policy, |session, pipe| {
                    session
                        .sequence_number(pipe)
                        .map(|value| WorkerReply::Sequence { value })
                })
            }
            // Mapping traffic routed here is a bug in the state loop.
            other => WorkerReply::Fault {
                code: "bad_target".to_string(),
                message: format!("domain worker cannot serve {other:?}"),
                retryable: false,
            },
        }
    }

    /// Run `op` over a bound pipe, translating transport failures into a
    /// dropped connection plus a retryable fault.
    fn with_pipe(
        &mut self,
        kind: PipeKind,
        op: impl FnOnce(
            &mut dyn super::transport::Session,
            super::transport::PipeHandle,
        ) -> Result<WorkerReply, SessionError>,
    ) -> WorkerReply {
        if let Err(fault) = self.ensure_connection(false) {
            return fault;
        }
        let Some(connection) = self.connection.as_mut() else {
            return WorkerReply::Fault {
                code: "internal".to_string(),
                message: "no connection after establishment".to_string(),
                retryable: true,
            };
        };
        let pipe = match connection.pipe(kind) {
            Ok(pipe) => pipe,
            Err(SessionError::Transport(err)) => {
                warn!(domain = %self.domain.name, %err, "transport died during pipe bind");
                self.drop_connection();
                return transport_fault(&err);
            }
            Err(err) => {
                return WorkerReply::Fault {
                    code: "pipe_bind_failed".to_string(),
                    message: err.to_string(),
                    retryable: true,
                };
            }
        };
        match op(connection.session(), pipe) {
            Ok(reply) => reply,
            Err(SessionError::Transport(err)) => {
                warn!(domain = %self.domain.name, %err, "transport died mid-call");
                self.drop_connection();
                transport_fault(&err)
            }
            Err(err) => WorkerReply::Fault {
                code: "call_failed".to_string(),
                message: err.to_string(),
                retryable: true,
            },
        }
    }
}

fn transport_fault(err: &std::io::Error) -> WorkerReply {
    WorkerReply::Fault {
        code: "transport_died".to_string(),
        message: err.to_string(),
        retryable: true,
    }
}

fn fault_from_connect(err: &ConnectError) -> WorkerReply {
    let code = match err {
        ConnectError::DiscoveryEmpty { .. } => "discovery_empty",
        ConnectError::Exhausted { .. } => "connect_exhausted",
        ConnectError::ForcedOffline { .. } => "forced_offline",
    };
    WorkerReply::Fault {
        code: code.to_string(),
        message: err.to_string(),
        retryable: err.transience().is_retryable(),
    }
}

/// Domain worker thread body. Exits when the request channel closes.
pub fn run_domain_loop(mut worker: DomainWorker, rx: Receiver<Vec<u8>>) {
    info!(domain = %worker.domain.name, "domain worker up");
    let _notice = ExitNotice {
        target: worker.target(),
        events: worker.events.clone(),
    };
    for raw in rx {
        let frame = match wire::decode_request(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                error!(domain = %worker.domain.name, %err, "undecodable request frame");
                continue;
            }
        };
        let reply = worker.handle(frame.body);
        respond(&worker.events, worker.target(), frame.correlation, reply);
    }
    debug!(domain = %worker.domain.name, "domain worker down");
}

/// Mapper worker: the only holder of the idmap store handle.
pub struct MapperWorker {
    store: IdmapStore,
    events: Sender<WorkerEvent>,
}

impl MapperWorker {
    pub fn new(store: IdmapStore, events: Sender<WorkerEvent>) -> Self {
        Self { store, events }
    }

    fn handle(&mut self, request: WorkerRequest) -> WorkerReply {
        match request {
            WorkerRequest::Ping => WorkerReply::Pong,
            WorkerRequest::SidToId { sid } => match self.store.lookup_sid(&sid) {
                Ok(Some(mapping)) => WorkerReply::MappingResult {
                    status: MapStatus::Mapped,
                    mapping: Some(mapping),
                },
                Ok(None) => WorkerReply::MappingResult {
                    status: MapStatus::Unmapped,
                    mapping: None,
                },
                Err(err) => fault_from_store(&err),
            },
            WorkerRequest::IdToSid { kind, id } => match self.store.lookup_id(kind, id) {
                Ok(Some(mapping)) => WorkerReply::MappingResult {
                    status: MapStatus::Mapped,
                    mapping: Some(mapping),
                },
                Ok(None) => WorkerReply::MappingResult {
                    status: MapStatus::Unmapped,
                    mapping: None,
                },
                Err(err) => fault_from_store(&err),
            },
            WorkerRequest::SetMapping { mapping } => match self.store.set_mapping(&mapping) {
                Ok(()) => WorkerReply::Done,
                Err(err) => fault_from_store(&err),
            },
            WorkerRequest::RemoveMapping { mapping } => {
                match self.store.remove_mapping(&mapping) {
                    Ok(()) => WorkerReply::Done,
                    Err(err) => fault_from_store(&err),
                }
            }
            WorkerRequest::Allocate { sid, kind } => match self.store.allocate(&sid, kind) {
                Ok(mapping) => WorkerReply::Allocated { mapping },
                Err(err) => fault_from_store(&err),
            },
            other => WorkerReply::Fault {
                code: "bad_target".to_string(),
                message: format!("mapper cannot serve {other:?}"),
                retryable: false,
            },
        }
    }
}

fn fault_from_store(err: &StoreError) -> WorkerReply {
    let code = match err {
        StoreError::Corruption { .. } => "store_corruption",
        StoreError::AllocationExhausted { .. } => "allocation_exhausted",
        StoreError::AlreadyMapped { .. } => "already_mapped",
        StoreError::NoneMapped { .. } => "none_mapped",
        StoreError::VersionFromTheFuture { .. } => "store_version",
        StoreError::BadRecord { .. } => "store_corruption",
        StoreError::Sqlite(_) | StoreError::Io { .. } => "store_io",
    };
    // Corruption is surfaced, never repaired in-band.
    if matches!(err, StoreError::Corruption { .. }) {
        error!(%err, "idmap store corruption");
    }
    WorkerReply::Fault {
        code: code.to_string(),
        message: err.to_string(),
        retryable: err.is_retryable(),
    }
}

/// Mapper worker thread body.
pub fn run_mapper_loop(mut worker: MapperWorker, rx: Receiver<Vec<u8>>) {
    info!("mapper worker up");
    let _notice = ExitNotice {
        target: Target::Mapper,
        events: worker.events.clone(),
    };
    for raw in rx {
        let frame = match wire::decode_request(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "undecodable request frame");
                continue;
            }
        };
        let reply = worker.handle(frame.body);
        respond(&worker.events, Target::Mapper, frame.correlation, reply);
    }
    debug!("mapper worker down");
}

fn respond(events: &Sender<WorkerEvent>, target: Target, correlation: u64, body: WorkerReply) {
    match wire::encode_response(&ResponseFrame { correlation, body }) {
        Ok(frame) => {
            let _ = events.send(WorkerEvent::Response { target, frame });
        }
        Err(err) => error!(%err, "response frame encoding failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IdKind, Mapping, Sid};
    use crate::store::IdmapConfig;
    use crossbeam::channel;

    fn mapper() -> (MapperWorker, Receiver<WorkerEvent>) {
        let (tx, rx) = channel::unbounded();
        let store = IdmapStore::open_in_memory(IdmapConfig::default()).unwrap();
        (MapperWorker::new(store, tx), rx)
    }

    fn sid(raw: &str) -> Sid {
        Sid::parse(raw).unwrap()
    }

    #[test]
    fn mapper_allocates_and_looks_up() {
        let (mut worker, _events) = mapper();
        let user = sid("S-1-5-21-1-2-3-1104");

        let reply = worker.handle(WorkerRequest::Allocate {
            sid: user.clone(),
            kind: IdKind::Uid,
        });
        let WorkerReply::Allocated { mapping } = reply else {
            panic!("expected allocation, got {reply:?}");
        };
        assert_eq!(mapping.id, 10_000);

        let reply = worker.handle(WorkerRequest::SidToId { sid: user });
        assert!(matches!(
            reply,
            WorkerReply::MappingResult {
                status: MapStatus::Mapped,
                mapping: Some(_)
            }
        ));
    }

    #[test]
    fn mapper_miss_is_authoritative_unmapped() {
        let (mut worker, _events) = mapper();
        let reply = worker.handle(WorkerRequest::SidToId {
            sid: sid("S-1-5-21-9-9-9-500"),
        });
        assert!(matches!(
            reply,
            WorkerReply::MappingResult {
                status: MapStatus::Unmapped,
                mapping: None
            }
        ));
    }

    #[test]
    fn mapper_double_allocate_faults() {
        let (mut worker, _events) = mapper();
        let user = sid("S-1-5-21-1-2-3-1104");
        worker.handle(WorkerRequest::Allocate {
            sid: user.clone(),
            kind: IdKind::Uid,
        });
        let reply = worker.handle(WorkerRequest::Allocate {
            sid: user,
            kind: IdKind::Uid,
        });
        let WorkerReply::Fault { code, .. } = reply else {
            panic!("expected fault, got {reply:?}");
        };
        assert_eq!(code, "already_mapped");
    }

    #[test]
    fn mapper_remove_requires_exact_pair() {
        let (mut worker, _events) = mapper();
        let user = sid("S-1-5-21-1-2-3-1104");
        worker.handle(WorkerRequest::Allocate {
            sid: user.clone(),
            kind: IdKind::Uid,
        });
        let reply = worker.handle(WorkerRequest::RemoveMapping {
            mapping: Mapping::new(user, IdKind::Uid, 19_999),
        });
        let WorkerReply::Fault { code, .. } = reply else {
            panic!("expected fault, got {reply:?}");
        };
        assert_eq!(code, "none_mapped");
    }

    #[test]
    fn mapper_rejects_domain_traffic() {
        let (mut worker, _events) = mapper();
        let reply = worker.handle(WorkerRequest::EnumTrusts);
        assert!(matches!(reply, WorkerReply::Fault { ref code, .. } if code == "bad_target"));
    }
}
