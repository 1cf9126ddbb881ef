//! Daemon module - the identity-resolution service.
//!
//! Provides:
//! - Controller discovery (directory query + broadcast)
//! - Connection establishment with the credential chain
//! - Per-domain liveness tracking and offline probing
//! - Trust topology walking into the flat registry
//! - The SID/unix-id mapping store worker
//! - IPC over a Unix socket

pub mod conn;
pub mod discovery;
pub mod dispatch;
pub mod establish;
pub mod ipc;
pub mod liveness;
pub mod mailslot;
pub mod negcache;
pub mod registry;
pub mod run;
pub mod server;
pub mod transport;
pub mod trust;
pub mod wire;
pub mod worker;

pub use dispatch::{DispatchCore, DispatchError, Dispatched, Outcome, Target};
pub use establish::ConnectError;
pub use ipc::{
    decode_request, encode_response, send_request, DaemonMeta, ErrorPayload, IpcError,
    MappingAnswer, Request, ResolvedAnswer, Response, ResponsePayload, IPC_PROTOCOL_VERSION,
};
pub use liveness::ProbeScheduler;
pub use negcache::{FailReason, NegativeConnCache};
pub use registry::{DcAffinity, Domain, DomainRegistry, Liveness, Transition};
pub use run::run_daemon;
pub use server::{run_state_loop, Daemon, RequestMessage};
pub use trust::{TrustError, TrustWalk, WalkStep};
pub use worker::WorkerEvent;
