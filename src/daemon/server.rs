//! The daemon state loop.
//!
//! Single-threaded owner of the registry, the dispatcher and the probe
//! scheduler. Everything else reaches it through channels: client requests
//! from the socket acceptor, events from workers and probers, timer ticks
//! from the probe scheduler and the trust-rescan clock. Nothing in here
//! blocks; anything slow lives on a worker or prober thread.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{DomainInfo, Sid, TrustAttributes, TrustKind};
use crate::store::IdmapStore;

use super::dispatch::{Continuation, DispatchCore, Dispatched, Outcome, Target};
use super::discovery::Discovery;
use super::establish::Establisher;
use super::ipc::{
    Ack, DomainStatus, ErrorPayload, MappingAnswer, Request, ResolvedAnswer, Response,
    ResponsePayload, IPC_PROTOCOL_VERSION,
};
use super::liveness::{spawn_prober, ProbeScheduler};
use super::registry::{DomainRegistry, Liveness, Transition};
use super::transport::SecurityProvider;
use super::trust::{TrustWalk, WalkStep};
use super::wire::{self, WorkerReply, WorkerRequest};
use super::worker::{
    run_domain_loop, run_mapper_loop, DomainWorker, MapperWorker, WorkerEvent,
};

/// Message sent from socket handlers to the state thread.
pub struct RequestMessage {
    pub request: Request,
    pub respond: Sender<Response>,
}

/// The serialization point. All registry, dispatch and scheduler mutations
/// happen on the thread running [`run_state_loop`].
pub struct Daemon {
    config: Config,
    registry: DomainRegistry,
    dispatch: DispatchCore<Daemon>,
    probes: ProbeScheduler,
    discovery: Arc<Discovery>,
    establisher: Arc<Establisher>,
    provider: Arc<dyn SecurityProvider>,
    events_tx: Sender<WorkerEvent>,
    trust_walk: Option<TrustWalk>,
    worker_handles: Vec<JoinHandle<()>>,
    shutting_down: bool,
}

impl Daemon {
    pub fn new(
        config: Config,
        provider: Arc<dyn SecurityProvider>,
        discovery: Arc<Discovery>,
        store: IdmapStore,
        events_tx: Sender<WorkerEvent>,
        probe_timer_tx: Sender<String>,
    ) -> Self {
        let establisher = Arc::new(Establisher::new(
            config.connect.clone(),
            config.auth.clone(),
            Arc::clone(&provider),
        ));

        let mut daemon = Self {
            probes: ProbeScheduler::new(probe_timer_tx),
            registry: DomainRegistry::new(),
            dispatch: DispatchCore::new(),
            discovery,
            establisher,
            provider,
            events_tx,
            trust_walk: None,
            worker_handles: Vec::new(),
            shutting_down: false,
            config,
        };
        daemon.spawn_mapper(store);
        daemon.register_initial_domains();
        daemon
    }

    fn spawn_mapper(&mut self, store: IdmapStore) {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.dispatch.register_worker(Target::Mapper, tx);
        let worker = MapperWorker::new(store, self.events_tx.clone());
        self.worker_handles
            .push(std::thread::spawn(move || run_mapper_loop(worker, rx)));
    }

    fn register_initial_domains(&mut self) {
        // The synthetic local domains. Always online, no worker to feed.
        self.register_domain(
            DomainInfo::new("BUILTIN", TrustKind::Internal).with_sid(Sid::builtin()),
        );
        let machine = whoami::fallible::hostname()
            .unwrap_or_else(|_| "localhost".into())
            .to_uppercase();
        self.register_domain(DomainInfo::new(machine, TrustKind::Internal));

        if !self.config.auth.domain.is_empty() {
            let mut primary =
                DomainInfo::new(self.config.auth.domain.clone(), TrustKind::Primary);
            if let Some(realm) = &self.config.auth.realm {
                primary = primary.with_alt_name(realm.clone()).with_attributes(
                    TrustAttributes {
                        active_directory: true,
                        ..TrustAttributes::default()
                    },
                );
            }
            self.register_domain(primary);
        }

        let static_domains: Vec<DomainInfo> = self
            .config
            .static_domains
            .iter()
            .filter_map(|entry| {
                let mut info = DomainInfo::new(entry.name.clone(), TrustKind::External);
                if let Some(alt) = &entry.alt_name {
                    info = info.with_alt_name(alt.clone());
                }
                if let Some(raw) = &entry.sid {
                    match Sid::parse(raw) {
                        Ok(sid) => info = info.with_sid(sid),
                        Err(err) => {
                            warn!(domain = %entry.name, %err, "ignoring static domain with bad sid");
                            return None;
                        }
                    }
                }
                Some(info)
            })
            .collect();
        for info in static_domains {
            self.register_domain(info);
        }
    }

    /// Add a domain and bring up its worker. Registration is add-only, so a
    /// re-reported domain changes nothing.
    fn register_domain(&mut self, info: DomainInfo) -> bool {
        let internal = info.is_internal();
        if !self.registry.register(info.clone()) {
            return false;
        }
        if !internal {
            self.spawn_domain_worker(info);
        }
        true
    }

    fn spawn_domain_worker(&mut self, info: DomainInfo) {
        let target = Target::domain(&info.name);
        if self.dispatch.has_worker(&target) {
            return;
        }
        let (tx, rx) = crossbeam::channel::unbounded();
        self.dispatch.register_worker(target, tx);
        let worker = DomainWorker::new(
            info,
            Arc::clone(&self.establisher),
            Arc::clone(&self.discovery),
            self.config.connect.negative_cache_ttl(),
            self.events_tx.clone(),
        );
        self.worker_handles
            .push(std::thread::spawn(move || run_domain_loop(worker, rx)));
    }

    /// Kick the primary connection; the first trust walk starts once it is
    /// up. Connection failure produces a `ConnLost` event and the probe
    /// cycle takes it from there.
    pub fn start(&mut self) {
        let Some(primary) = self.registry.primary() else {
            info!("no primary domain configured; mapping service only");
            return;
        };
        let name = primary.name().to_string();
        self.dispatch_to(
            Target::domain(&name),
            WorkerRequest::Reconnect {
                bypass_offline: false,
            },
            Box::new(|daemon: &mut Daemon, outcome| {
                if let Outcome::Reply(WorkerReply::Connected { .. }) = outcome {
                    daemon.start_trust_walk();
                }
            }),
        );
    }

    /// Send through the dispatcher. A request whose worker is gone fails
    /// through its continuation with a transport failure, never by leaving
    /// the caller waiting on an answer that cannot come; any requests
    /// already parked on that worker fail first.
    fn dispatch_to(
        &mut self,
        target: Target,
        request: WorkerRequest,
        continuation: Continuation<Daemon>,
    ) {
        match self.dispatch.send(target.clone(), request, continuation) {
            Ok(Dispatched::Queued(_)) => {}
            Ok(Dispatched::WorkerGone(continuation)) => {
                warn!(%target, "worker gone, failing request");
                self.fail_worker(&target);
                continuation(self, Outcome::TransportFailed);
            }
            Err(err) => {
                warn!(%target, %err, "dispatch failed");
            }
        }
    }

    /// Fail every request parked on `target` wholesale.
    fn fail_worker(&mut self, target: &Target) {
        for continuation in self.dispatch.fail_target(target) {
            continuation(self, Outcome::TransportFailed);
        }
    }

    // === client requests ===

    pub fn handle_request(&mut self, msg: RequestMessage) {
        let RequestMessage { request, respond } = msg;
        match request {
            Request::Ping => {
                let _ = respond.send(Response::ok(ResponsePayload::Pong {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    protocol: IPC_PROTOCOL_VERSION,
                }));
            }
            Request::Shutdown => {
                info!("shutdown requested over IPC");
                self.shutting_down = true;
                let _ = respond.send(Response::ok(ResponsePayload::Ack(Ack::ShuttingDown)));
            }
            Request::DomainStatus { domain } => {
                let statuses = self.domain_statuses(domain.as_deref());
                let _ = respond.send(Response::ok(ResponsePayload::Domains(statuses)));
            }
            Request::SetOffline { domain, offline } => match domain {
                Some(domain) => self.handle_set_offline(&domain, offline, respond),
                None => self.handle_set_offline_all(offline, respond),
            },
            Request::SidToId { sid } => match Sid::parse(&sid) {
                Ok(sid) => self.send_mapping(WorkerRequest::SidToId { sid }, respond),
                Err(err) => respond_invalid_sid(&respond, &err),
            },
            Request::IdToSid { kind, id } => {
                self.send_mapping(WorkerRequest::IdToSid { kind, id }, respond)
            }
            Request::SetMapping { sid, kind, id } => match Sid::parse(&sid) {
                Ok(sid) => self.send_mapping(
                    WorkerRequest::SetMapping {
                        mapping: crate::core::Mapping::new(sid, kind, id),
                    },
                    respond,
                ),
                Err(err) => respond_invalid_sid(&respond, &err),
            },
            Request::RemoveMapping { sid, kind, id } => match Sid::parse(&sid) {
                Ok(sid) => self.send_mapping(
                    WorkerRequest::RemoveMapping {
                        mapping: crate::core::Mapping::new(sid, kind, id),
                    },
                    respond,
                ),
                Err(err) => respond_invalid_sid(&respond, &err),
            },
            Request::Allocate { sid, kind } => match Sid::parse(&sid) {
                Ok(sid) => self.send_mapping(WorkerRequest::Allocate { sid, kind }, respond),
                Err(err) => respond_invalid_sid(&respond, &err),
            },
            Request::LookupName { domain, name } => {
                self.handle_lookup_name(&domain, name, respond)
            }
            Request::LookupSid { sid } => match Sid::parse(&sid) {
                Ok(sid) => self.handle_lookup_sid(sid, respond),
                Err(err) => respond_invalid_sid(&respond, &err),
            },
        }
    }

    fn handle_lookup_name(&mut self, domain: &str, name: String, respond: Sender<Response>) {
        let Some(record) = self.registry.find(domain) else {
            let _ = respond.send(Response::err(ErrorPayload::new(
                "unknown_domain",
                format!("no such domain {domain}"),
                false,
            )));
            return;
        };
        let target = Target::domain(record.name());
        self.dispatch_to(
            target,
            WorkerRequest::LookupName { name },
            Box::new(move |_daemon: &mut Daemon, outcome| {
                let response = match outcome {
                    Outcome::Reply(WorkerReply::NameResolved { sid }) => {
                        Response::ok(ResponsePayload::Resolved(ResolvedAnswer {
                            found: sid.is_some(),
                            sid: sid.map(|s| s.to_string()),
                            name: None,
                        }))
                    }
                    other => lookup_failure(other),
                };
                let _ = respond.send(response);
            }),
        );
    }

    fn handle_lookup_sid(&mut self, sid: Sid, respond: Sender<Response>) {
        let Some(record) = self.registry.find_by_member_sid(&sid) else {
            let _ = respond.send(Response::err(ErrorPayload::new(
                "unknown_domain",
                format!("no known domain owns {sid}"),
                false,
            )));
            return;
        };
        let target = Target::domain(record.name());
        let echo = sid.to_string();
        self.dispatch_to(
            target,
            WorkerRequest::LookupSid { sid },
            Box::new(move |_daemon: &mut Daemon, outcome| {
                let response = match outcome {
                    Outcome::Reply(WorkerReply::SidResolved { name }) => {
                        Response::ok(ResponsePayload::Resolved(ResolvedAnswer {
                            found: name.is_some(),
                            sid: Some(echo),
                            name,
                        }))
                    }
                    other => lookup_failure(other),
                };
                let _ = respond.send(response);
            }),
        );
    }

    fn domain_statuses(&self, filter: Option<&str>) -> Vec<DomainStatus> {
        self.registry
            .iter()
            .filter(|d| filter.map_or(true, |name| d.info.matches_name(name)))
            .map(|d| DomainStatus {
                name: d.info.name.clone(),
                alt_name: d.info.alt_name.clone(),
                sid: d.info.sid.as_ref().map(|s| s.to_string()),
                kind: d.info.kind,
                liveness: liveness_label(d.reported_liveness()).to_string(),
                forced_offline: d.forced_offline,
                dc: d.affinity.as_ref().map(|a| a.name.clone()),
            })
            .collect()
    }

    fn handle_set_offline(&mut self, domain: &str, offline: bool, respond: Sender<Response>) {
        let Some(record) = self.registry.find_mut(domain) else {
            let _ = respond.send(Response::err(ErrorPayload::new(
                "unknown_domain",
                format!("no such domain {domain}"),
                false,
            )));
            return;
        };
        if record.info.is_internal() {
            let _ = respond.send(Response::err(ErrorPayload::new(
                "internal_domain",
                format!("{} cannot be forced offline", record.name()),
                false,
            )));
            return;
        }
        record.forced_offline = offline;
        let name = record.name().to_string();
        if offline {
            info!(domain = %name, "forced offline");
            self.probes.cancel(&name);
        } else {
            info!(domain = %name, "force lifted, reconnecting");
            // Fire-and-forget; liveness events carry the result back.
            self.dispatch_to(
                Target::domain(&name),
                WorkerRequest::Reconnect {
                    bypass_offline: true,
                },
                Box::new(|_, _| {}),
            );
        }
        let _ = respond.send(Response::ok(ResponsePayload::Ack(Ack::Done)));
    }

    /// The global switch: force every non-internal domain offline, or lift
    /// the force everywhere and reconnect.
    fn handle_set_offline_all(&mut self, offline: bool, respond: Sender<Response>) {
        let names: Vec<String> = self
            .registry
            .iter_mut()
            .filter(|d| !d.info.is_internal())
            .map(|d| {
                d.forced_offline = offline;
                d.name().to_string()
            })
            .collect();
        info!(domains = names.len(), offline, "global offline switch");
        for name in names {
            if offline {
                self.probes.cancel(&name);
            } else {
                self.dispatch_to(
                    Target::domain(&name),
                    WorkerRequest::Reconnect {
                        bypass_offline: true,
                    },
                    Box::new(|_, _| {}),
                );
            }
        }
        let _ = respond.send(Response::ok(ResponsePayload::Ack(Ack::Done)));
    }

    /// Dispatch a mapping operation; the continuation owns the client's
    /// response channel.
    fn send_mapping(&mut self, request: WorkerRequest, respond: Sender<Response>) {
        self.dispatch_to(
            Target::Mapper,
            request,
            Box::new(move |_daemon: &mut Daemon, outcome| {
                let _ = respond.send(mapping_response(outcome));
            }),
        );
    }

    // === worker events ===

    pub fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Response { target, frame } => self.handle_response(target, &frame),
            WorkerEvent::ConnUp { domain, affinity } => {
                if let Some(record) = self.registry.find_mut(&domain) {
                    record.mark_online(affinity);
                    self.probes.cancel(&domain);
                    self.refresh_sequence(&domain);
                }
            }
            WorkerEvent::ConnLost { domain } => self.handle_conn_lost(&domain),
            WorkerEvent::ProbeDone { domain, reachable } => {
                self.handle_probe_done(&domain, reachable)
            }
            WorkerEvent::WorkerExited { target } => {
                warn!(%target, "worker exited");
                self.fail_worker(&target);
            }
        }
    }

    fn handle_response(&mut self, target: Target, frame: &[u8]) {
        let frame = match wire::decode_response(frame) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%target, %err, "undecodable response frame");
                return;
            }
        };
        let Some((_, continuation)) = self.dispatch.take(frame.correlation) else {
            debug!(correlation = frame.correlation, "stale response dropped");
            return;
        };
        continuation(self, Outcome::Reply(frame.body));
    }

    fn handle_conn_lost(&mut self, domain: &str) {
        let Some(record) = self.registry.find_mut(domain) else {
            return;
        };
        let transition = record.mark_offline();
        if record.forced_offline {
            return;
        }
        let in_grace = record.in_startup_grace(self.config.server.startup_grace());
        if matches!(transition, Transition::Changed { .. }) || !self.probes.is_pending(domain)
        {
            let delay = ProbeScheduler::delay_for(&self.config.server, in_grace);
            self.probes.schedule(domain, delay);
        }
    }

    /// A probe timer fired; dispatch the actual prober if still relevant.
    pub fn handle_probe_timer(&mut self, domain: String) {
        if !self.probes.should_fire(&domain) {
            return;
        }
        let Some(record) = self.registry.find_mut(&domain) else {
            return;
        };
        if !matches!(record.mark_probing(), Transition::Changed { .. }) {
            return;
        }
        spawn_prober(
            record.info.clone(),
            Arc::clone(&self.discovery),
            Arc::clone(&self.provider),
            self.config.connect.ports.clone(),
            self.config.connect.timeout(),
            self.events_tx.clone(),
        );
    }

    fn handle_probe_done(&mut self, domain: &str, reachable: bool) {
        if !reachable {
            self.record_probe_failure(domain);
            return;
        }
        if self.registry.find(domain).is_none() {
            return;
        }

        // Reachable at socket level; ask the worker for the real thing.
        // The worker's ConnUp/ConnLost events drive the final transition.
        info!(domain, "probe positive, re-establishing");
        let name = domain.to_string();
        self.dispatch_to(
            Target::domain(domain),
            WorkerRequest::Reconnect {
                bypass_offline: true,
            },
            Box::new(move |daemon: &mut Daemon, outcome| {
                if !matches!(outcome, Outcome::Reply(WorkerReply::Connected { .. })) {
                    daemon.record_probe_failure(&name);
                }
            }),
        );
    }

    /// Pull the directory sequence number after a connection comes up so
    /// status reports carry a current value.
    fn refresh_sequence(&mut self, domain: &str) {
        let name = domain.to_string();
        self.dispatch_to(
            Target::domain(domain),
            WorkerRequest::SequenceNumber,
            Box::new(move |daemon: &mut Daemon, outcome| {
                if let Outcome::Reply(WorkerReply::Sequence { value }) = outcome {
                    if let Some(record) = daemon.registry.find_mut(&name) {
                        record.sequence = Some(value);
                    }
                }
            }),
        );
    }

    /// Put a probing domain back to offline and line up the next probe.
    fn record_probe_failure(&mut self, domain: &str) {
        let grace = self.config.server.startup_grace();
        if let Some(record) = self.registry.find_mut(domain) {
            record.mark_probe_failed();
            if !record.forced_offline {
                let in_grace = record.in_startup_grace(grace);
                let delay = ProbeScheduler::delay_for(&self.config.server, in_grace);
                self.probes.schedule(domain, delay);
            }
        }
    }

    // === trust walking ===

    pub fn start_trust_walk(&mut self) {
        if self.trust_walk.is_some() {
            debug!("trust walk already in progress");
            return;
        }
        let Some(primary) = self.registry.primary() else {
            return;
        };
        let primary = primary.name().to_string();
        info!(domain = %primary, "trust walk starting");
        let mut walk = TrustWalk::new(primary);
        let step = walk.begin();
        self.trust_walk = Some(walk);
        self.issue_walk_step(step);
    }

    fn issue_walk_step(&mut self, step: WalkStep) {
        match step {
            WalkStep::Query(names) => {
                for name in names {
                    let result = self.dispatch.send(
                        Target::domain(&name),
                        WorkerRequest::EnumTrusts,
                        Box::new({
                            let name = name.clone();
                            move |daemon: &mut Daemon, outcome| {
                                daemon.on_walk_answer(&name, outcome)
                            }
                        }),
                    );
                    match result {
                        Ok(Dispatched::Queued(_)) => {}
                        Ok(Dispatched::WorkerGone(continuation)) => {
                            // Routes into on_walk_answer, which records the
                            // failure and advances the walk.
                            self.fail_worker(&Target::domain(&name));
                            continuation(self, Outcome::TransportFailed);
                        }
                        Err(err) => {
                            warn!(domain = %name, %err, "trust query dispatch failed");
                            let step = self
                                .trust_walk
                                .as_mut()
                                .map(|walk| walk.on_failure(&name, err.to_string()));
                            if let Some(step) = step {
                                self.issue_walk_step(step);
                            }
                        }
                    }
                }
            }
            WalkStep::Done { failures } => {
                for failure in &failures {
                    warn!(%failure, "trust walk partial failure");
                }
                info!(domains = self.registry.len(), "trust walk finished");
                self.trust_walk = None;
            }
        }
    }

    fn on_walk_answer(&mut self, from: &str, outcome: Outcome) {
        let Some(mut walk) = self.trust_walk.take() else {
            return;
        };
        let step = match outcome {
            Outcome::Reply(WorkerReply::Trusts { domains }) => {
                let (register, step) = walk.on_trusts(from, domains);
                self.trust_walk = Some(walk);
                for info in register {
                    self.register_domain(info);
                }
                step
            }
            Outcome::Reply(WorkerReply::Fault { message, .. }) => {
                let step = walk.on_failure(from, message);
                self.trust_walk = Some(walk);
                step
            }
            Outcome::Reply(other) => {
                let step = walk.on_failure(from, format!("unexpected reply {other:?}"));
                self.trust_walk = Some(walk);
                step
            }
            Outcome::TransportFailed => {
                let step = walk.on_failure(from, "transport failed");
                self.trust_walk = Some(walk);
                step
            }
        };
        self.issue_walk_step(step);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Close worker channels and wait for the threads.
    fn shutdown_workers(mut self) {
        let handles = std::mem::take(&mut self.worker_handles);
        // Dropping the dispatcher closes every worker's request channel.
        drop(self);
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn liveness_label(liveness: Liveness) -> &'static str {
    match liveness {
        Liveness::Uninitialized => "uninitialized",
        Liveness::Online => "online",
        Liveness::Offline => "offline",
        Liveness::Probing => "probing",
    }
}

fn respond_invalid_sid(respond: &Sender<Response>, err: &crate::core::SidParseError) {
    let _ = respond.send(Response::err(ErrorPayload::new(
        "invalid_sid",
        err.to_string(),
        false,
    )));
}

fn lookup_failure(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Reply(WorkerReply::Fault {
            code,
            message,
            retryable,
        }) => Response::err(ErrorPayload::new(code, message, retryable)),
        Outcome::Reply(other) => Response::err(ErrorPayload::new(
            "internal",
            format!("unexpected lookup reply {other:?}"),
            false,
        )),
        Outcome::TransportFailed => Response::err(ErrorPayload::new(
            "transport_died",
            "domain worker unavailable",
            true,
        )),
    }
}

fn mapping_response(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Reply(WorkerReply::MappingResult { status, mapping }) => match mapping {
            Some(mapping) => {
                Response::ok(ResponsePayload::Mapping(MappingAnswer::mapped(&mapping)))
            }
            None => Response::ok(ResponsePayload::Mapping(match status {
                crate::core::MapStatus::Unknown => MappingAnswer::unknown(),
                _ => MappingAnswer::unmapped(),
            })),
        },
        Outcome::Reply(WorkerReply::Allocated { mapping }) => {
            Response::ok(ResponsePayload::Mapping(MappingAnswer::mapped(&mapping)))
        }
        Outcome::Reply(WorkerReply::Done) => Response::ok(ResponsePayload::Ack(Ack::Done)),
        Outcome::Reply(WorkerReply::Fault {
            code,
            message,
            retryable,
        }) => Response::err(ErrorPayload::new(code, message, retryable)),
        Outcome::Reply(other) => Response::err(ErrorPayload::new(
            "internal",
            format!("unexpected mapper reply {other:?}"),
            false,
        )),
        Outcome::TransportFailed => Response::err(ErrorPayload::new(
            "transport_died",
            "mapper worker unavailable",
            true,
        )),
    }
}

/// Run the state thread loop.
///
/// Uses crossbeam::select! for fair multi-channel receive. Returns when a
/// shutdown request arrives or every request producer hangs up.
pub fn run_state_loop(
    mut daemon: Daemon,
    req_rx: Receiver<RequestMessage>,
    event_rx: Receiver<WorkerEvent>,
    probe_timer_rx: Receiver<String>,
    trust_tick_rx: Receiver<()>,
) {
    daemon.start();
    loop {
        crossbeam::select! {
            recv(req_rx) -> msg => match msg {
                Ok(msg) => daemon.handle_request(msg),
                Err(_) => break,
            },
            recv(event_rx) -> event => match event {
                Ok(event) => daemon.handle_event(event),
                Err(_) => break,
            },
            recv(probe_timer_rx) -> domain => {
                if let Ok(domain) = domain {
                    daemon.handle_probe_timer(domain);
                }
            },
            recv(trust_tick_rx) -> tick => {
                if tick.is_ok() {
                    daemon.start_trust_walk();
                }
            },
        }
        if daemon.shutting_down() {
            break;
        }
    }
    info!("state loop exiting");
    daemon.shutdown_workers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::discovery::StaticLocator;
    use crate::daemon::registry::DcAffinity;
    use crate::daemon::transport::TcpProbeProvider;
    use crate::store::IdmapConfig;
    use crossbeam::channel;

    fn test_daemon(config: Config) -> (Daemon, Receiver<WorkerEvent>) {
        let (events_tx, events_rx) = channel::unbounded();
        let (probe_tx, _probe_rx) = channel::unbounded();
        let provider: Arc<dyn SecurityProvider> = Arc::new(TcpProbeProvider);
        let discovery = Arc::new(Discovery::new(vec![Box::new(StaticLocator::new(
            Vec::new(),
        ))]));
        let store = IdmapStore::open_in_memory(IdmapConfig::default()).unwrap();
        (
            Daemon::new(config, provider, discovery, store, events_tx, probe_tx),
            events_rx,
        )
    }

    /// Issue a request and pump worker events until its answer lands.
    /// Control requests answer synchronously; mapping and lookup requests
    /// need one or more worker round trips.
    fn request(
        daemon: &mut Daemon,
        events: &Receiver<WorkerEvent>,
        request: Request,
    ) -> Response {
        let (tx, rx) = channel::bounded(1);
        daemon.handle_request(RequestMessage {
            request,
            respond: tx,
        });
        for _ in 0..32 {
            if let Ok(response) = rx.try_recv() {
                return response;
            }
            let event = events
                .recv_timeout(std::time::Duration::from_secs(5))
                .expect("worker event");
            daemon.handle_event(event);
        }
        panic!("no response after 32 worker events");
    }

    #[test]
    fn ping_answers_synchronously() {
        let (mut daemon, events) = test_daemon(Config::default());
        let response = request(&mut daemon, &events, Request::Ping);
        assert!(matches!(
            response,
            Response::Ok {
                ok: ResponsePayload::Pong { protocol: 1, .. }
            }
        ));
    }

    #[test]
    fn mapping_round_trip_through_real_mapper() {
        let (mut daemon, events) = test_daemon(Config::default());
        let sid = "S-1-5-21-1-2-3-1104";

        let response = request(
            &mut daemon,
            &events,
            Request::Allocate {
                sid: sid.to_string(),
                kind: crate::core::IdKind::Uid,
            },
        );
        let Response::Ok {
            ok: ResponsePayload::Mapping(answer),
        } = response
        else {
            panic!("expected mapping answer");
        };
        assert_eq!(answer.id, Some(10_000));

        let response = request(
            &mut daemon,
            &events,
            Request::SidToId {
                sid: sid.to_string(),
            },
        );
        let Response::Ok {
            ok: ResponsePayload::Mapping(answer),
        } = response
        else {
            panic!("expected mapping answer");
        };
        assert_eq!(answer.status, crate::core::MapStatus::Mapped);
        assert_eq!(answer.id, Some(10_000));
    }

    #[test]
    fn invalid_sid_is_rejected_without_dispatch() {
        let (mut daemon, events) = test_daemon(Config::default());
        let response = request(
            &mut daemon,
            &events,
            Request::SidToId {
                sid: "not-a-sid".to_string(),
            },
        );
        assert!(matches!(
            response,
            Response::Err { ref err } if err.code == "invalid_sid"
        ));
        assert_eq!(daemon.dispatch.pending_count(), 0);
    }

    #[test]
    fn internal_domains_are_preregistered_and_online() {
        let (mut daemon, events) = test_daemon(Config::default());
        let response = request(&mut daemon, &events, Request::DomainStatus { domain: None });
        let Response::Ok {
            ok: ResponsePayload::Domains(domains),
        } = response
        else {
            panic!("expected domain list");
        };
        let builtin = domains.iter().find(|d| d.name == "BUILTIN").unwrap();
        assert_eq!(builtin.liveness, "online");
    }

    #[test]
    fn set_offline_rejects_internal_domains() {
        let (mut daemon, events) = test_daemon(Config::default());
        let response = request(
            &mut daemon,
            &events,
            Request::SetOffline {
                domain: Some("BUILTIN".to_string()),
                offline: true,
            },
        );
        assert!(matches!(
            response,
            Response::Err { ref err } if err.code == "internal_domain"
        ));
    }

    #[test]
    fn forced_offline_is_visible_in_status() {
        let mut config = Config::default();
        config.auth.domain = "CORP".to_string();
        let (mut daemon, events) = test_daemon(config);

        let response = request(
            &mut daemon,
            &events,
            Request::SetOffline {
                domain: Some("CORP".to_string()),
                offline: true,
            },
        );
        assert!(matches!(response, Response::Ok { .. }));

        let response = request(
            &mut daemon,
            &events,
            Request::DomainStatus {
                domain: Some("CORP".to_string()),
            },
        );
        let Response::Ok {
            ok: ResponsePayload::Domains(domains),
        } = response
        else {
            panic!("expected domain list");
        };
        assert_eq!(domains.len(), 1);
        assert!(domains[0].forced_offline);
        assert_eq!(domains[0].liveness, "offline");
    }

    #[test]
    fn global_offline_spares_internal_domains() {
        let mut config = Config::default();
        config.auth.domain = "CORP".to_string();
        let (mut daemon, events) = test_daemon(config);

        let response = request(
            &mut daemon,
            &events,
            Request::SetOffline {
                domain: None,
                offline: true,
            },
        );
        assert!(matches!(response, Response::Ok { .. }));

        let response = request(&mut daemon, &events, Request::DomainStatus { domain: None });
        let Response::Ok {
            ok: ResponsePayload::Domains(domains),
        } = response
        else {
            panic!("expected domain list");
        };
        for d in &domains {
            if d.name == "CORP" {
                assert!(d.forced_offline);
                assert_eq!(d.liveness, "offline");
            } else {
                assert!(!d.forced_offline);
                assert_eq!(d.liveness, "online");
            }
        }
    }

    #[test]
    fn lookups_route_to_the_owning_domain_worker() {
        let mut config = Config::default();
        config.auth.domain = "CORP".to_string();
        let (mut daemon, events) = test_daemon(config);

        // Empty discovery: the worker cannot connect and faults the lookup.
        let response = request(
            &mut daemon,
            &events,
            Request::LookupName {
                domain: "CORP".to_string(),
                name: "alice".to_string(),
            },
        );
        assert!(matches!(
            response,
            Response::Err { ref err } if err.code == "discovery_empty"
        ));

        // No registered domain owns this SID.
        let response = request(
            &mut daemon,
            &events,
            Request::LookupSid {
                sid: "S-1-5-21-9-9-9-512".to_string(),
            },
        );
        assert!(matches!(
            response,
            Response::Err { ref err } if err.code == "unknown_domain"
        ));

        let response = request(
            &mut daemon,
            &events,
            Request::LookupName {
                domain: "NOWHERE".to_string(),
                name: "alice".to_string(),
            },
        );
        assert!(matches!(
            response,
            Response::Err { ref err } if err.code == "unknown_domain"
        ));
    }

    #[test]
    fn worker_death_fails_requests_instead_of_parking_them() {
        let (mut daemon, _events) = test_daemon(Config::default());

        // Replace the mapper channel with one nobody serves, so the request
        // parks with no answer coming.
        let (tx, _keep_alive) = channel::unbounded();
        daemon.dispatch.register_worker(Target::Mapper, tx);
        let (respond_tx, respond_rx) = channel::bounded(1);
        daemon.handle_request(RequestMessage {
            request: Request::IdToSid {
                kind: crate::core::IdKind::Uid,
                id: 10_000,
            },
            respond: respond_tx,
        });
        assert_eq!(daemon.dispatch.pending_count(), 1);

        daemon.handle_event(WorkerEvent::WorkerExited {
            target: Target::Mapper,
        });
        let response = respond_rx.try_recv().expect("wholesale failure response");
        assert!(matches!(
            response,
            Response::Err { ref err } if err.code == "transport_died"
        ));
        assert_eq!(daemon.dispatch.pending_count(), 0);

        // A request issued after the worker is gone fails immediately too.
        let (respond_tx, respond_rx) = channel::bounded(1);
        daemon.handle_request(RequestMessage {
            request: Request::IdToSid {
                kind: crate::core::IdKind::Uid,
                id: 10_000,
            },
            respond: respond_tx,
        });
        let response = respond_rx.try_recv().expect("immediate failure response");
        assert!(matches!(
            response,
            Response::Err { ref err } if err.code == "transport_died"
        ));
        assert_eq!(daemon.dispatch.pending_count(), 0);
    }

    fn liveness_of(
        daemon: &mut Daemon,
        events: &Receiver<WorkerEvent>,
        domain: &str,
    ) -> String {
        let response = request(
            daemon,
            events,
            Request::DomainStatus {
                domain: Some(domain.to_string()),
            },
        );
        let Response::Ok {
            ok: ResponsePayload::Domains(domains),
        } = response
        else {
            panic!("expected domain list");
        };
        domains[0].liveness.clone()
    }

    #[test]
    fn offline_probe_cycle_flips_online_exactly_once() {
        let mut config = Config::default();
        config.auth.domain = "CORP".to_string();
        config.server.startup_probe_secs = 0;
        let (mut daemon, events) = test_daemon(config);

        daemon.handle_event(WorkerEvent::ConnLost {
            domain: "CORP".into(),
        });
        assert_eq!(liveness_of(&mut daemon, &events, "CORP"), "offline");
        assert!(daemon.probes.is_pending("CORP"));

        // The timer fires: the domain moves to probing and a prober runs.
        daemon.handle_probe_timer("CORP".to_string());
        assert_eq!(liveness_of(&mut daemon, &events, "CORP"), "probing");

        // No controllers to reach, so the probe comes back negative: back
        // to offline with the next probe queued.
        let event = events
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("probe result");
        assert!(matches!(
            &event,
            WorkerEvent::ProbeDone {
                reachable: false,
                ..
            }
        ));
        daemon.handle_event(event);
        assert_eq!(liveness_of(&mut daemon, &events, "CORP"), "offline");
        assert!(daemon.probes.is_pending("CORP"));

        // A positive probe asks the worker for a real re-establishment; the
        // domain stays probing until the worker reports the connection up.
        daemon.handle_probe_timer("CORP".to_string());
        daemon.handle_event(WorkerEvent::ProbeDone {
            domain: "CORP".into(),
            reachable: true,
        });
        assert_eq!(liveness_of(&mut daemon, &events, "CORP"), "probing");

        let affinity = DcAffinity {
            name: "DC01".into(),
            host: "10.0.0.1".into(),
        };
        daemon.handle_event(WorkerEvent::ConnUp {
            domain: "CORP".into(),
            affinity: affinity.clone(),
        });
        assert_eq!(liveness_of(&mut daemon, &events, "CORP"), "online");
        assert!(!daemon.probes.is_pending("CORP"));

        // A duplicate report and a stale timer change nothing.
        daemon.handle_event(WorkerEvent::ConnUp {
            domain: "CORP".into(),
            affinity,
        });
        daemon.handle_probe_timer("CORP".to_string());
        assert_eq!(liveness_of(&mut daemon, &events, "CORP"), "online");
    }

    #[test]
    fn shutdown_flips_the_flag() {
        let (mut daemon, events) = test_daemon(Config::default());
        let response = request(&mut daemon, &events, Request::Shutdown);
        assert!(matches!(
            response,
            Response::Ok {
                ok: ResponsePayload::Ack(Ack::ShuttingDown)
            }
        ));
        assert!(daemon.shutting_down());
    }
}
