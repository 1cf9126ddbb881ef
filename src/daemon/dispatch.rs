//! Asynchronous request dispatch.
//!
//! The state loop never blocks on a worker. A request is assigned a fresh
//! correlation id, encoded, and queued on the target worker's channel; the
//! caller's continuation is parked in a table. When the matching response
//! frame arrives the continuation is taken out (so it can only run once)
//! and invoked with the outcome. If a worker's channel dies, every
//! continuation parked on that target fails wholesale.

use std::collections::HashMap;

use crossbeam::channel::Sender;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Transience;

use super::wire::{self, RequestFrame, WireError, WorkerReply, WorkerRequest};

/// Who a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// The worker owning one domain's connection.
    Domain(String),
    /// The identity-mapping worker.
    Mapper,
}

impl Target {
    pub fn domain(name: &str) -> Self {
        Target::Domain(name.to_uppercase())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Domain(name) => write!(f, "domain:{name}"),
            Target::Mapper => f.write_str("mapper"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("wire encoding failed: {0}")]
    Wire(#[from] WireError),
}

impl DispatchError {
    pub fn transience(&self) -> Transience {
        match self {
            DispatchError::Wire(_) => Transience::Permanent,
        }
    }
}

/// How a send left the dispatcher.
pub enum Dispatched<C> {
    /// Queued on the worker's channel under this correlation id.
    Queued(u64),
    /// No live worker for the target: never registered, or its channel
    /// closed. The continuation comes back so the caller can fail it with
    /// [`Outcome::TransportFailed`], after draining any parked siblings
    /// through [`DispatchCore::fail_target`].
    WorkerGone(Continuation<C>),
}

/// How a dispatched request ended.
#[derive(Debug)]
pub enum Outcome {
    Reply(WorkerReply),
    /// The worker (or its transport to us) died before answering.
    TransportFailed,
}

/// A parked callback. Runs on the state loop thread with the daemon context
/// re-borrowed, so it may issue further dispatches.
pub type Continuation<C> = Box<dyn FnOnce(&mut C, Outcome) + Send>;

struct Pending<C> {
    target: Target,
    continuation: Continuation<C>,
}

pub struct DispatchCore<C> {
    next_correlation: u64,
    workers: HashMap<Target, Sender<Vec<u8>>>,
    pending: HashMap<u64, Pending<C>>,
}

impl<C> Default for DispatchCore<C> {
    fn default() -> Self {
        Self {
            next_correlation: 1,
            workers: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

impl<C> DispatchCore<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_worker(&mut self, target: Target, tx: Sender<Vec<u8>>) {
        self.workers.insert(target, tx);
    }

    pub fn has_worker(&self, target: &Target) -> bool {
        self.workers.contains_key(target)
    }

    /// Queue `request` for `target` and park `continuation` under a fresh
    /// correlation id.
    ///
    /// Per-target ordering is the channel's FIFO order; two sends to the
    /// same target are answered in the order they were issued.
    pub fn send(
        &mut self,
        target: Target,
        request: WorkerRequest,
        continuation: Continuation<C>,
    ) -> Result<Dispatched<C>, DispatchError> {
        let Some(tx) = self.workers.get(&target) else {
            debug!(%target, "no worker for target");
            return Ok(Dispatched::WorkerGone(continuation));
        };

        let correlation = self.next_correlation;
        self.next_correlation += 1;

        let frame = wire::encode_request(&RequestFrame {
            correlation,
            body: request,
        })?;

        if tx.send(frame).is_err() {
            // Worker hung up. Parking would leave a continuation nothing can
            // ever fire; hand it back instead.
            warn!(%target, "worker channel closed");
            self.workers.remove(&target);
            return Ok(Dispatched::WorkerGone(continuation));
        }

        self.pending.insert(
            correlation,
            Pending {
                target,
                continuation,
            },
        );
        Ok(Dispatched::Queued(correlation))
    }

    /// Take the continuation for a response frame. `None` means the
    /// correlation id is unknown (stale or duplicate response); such frames
    /// are dropped by the caller.
    pub fn take(&mut self, correlation: u64) -> Option<(Target, Continuation<C>)> {
        let pending = self.pending.remove(&correlation)?;
        Some((pending.target, pending.continuation))
    }

    /// Drain every continuation parked on `target`, for wholesale failure
    /// when the worker's transport dies.
    pub fn fail_target(&mut self, target: &Target) -> Vec<Continuation<C>> {
        self.workers.remove(target);
        let correlations: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.target == *target)
            .map(|(&c, _)| c)
            .collect();
        if !correlations.is_empty() {
            debug!(%target, count = correlations.len(), "failing in-flight requests");
        }
        // Preserve issue order so callers observe FIFO failure too.
        let mut sorted = correlations;
        sorted.sort_unstable();
        sorted
            .into_iter()
            .filter_map(|c| self.pending.remove(&c))
            .map(|p| p.continuation)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn queued(dispatched: Dispatched<()>) -> u64 {
        match dispatched {
            Dispatched::Queued(correlation) => correlation,
            Dispatched::WorkerGone(_) => panic!("worker unexpectedly gone"),
        }
    }

    #[test]
    fn responses_find_their_continuation_exactly_once() {
        let mut core: DispatchCore<()> = DispatchCore::new();
        let (tx, rx) = channel::unbounded();
        core.register_worker(Target::Mapper, tx);

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let corr = queued(
            core.send(
                Target::Mapper,
                WorkerRequest::Ping,
                Box::new(move |_, outcome| {
                    push(&log2, format!("{outcome:?}"));
                }),
            )
            .unwrap(),
        );

        // The frame went out.
        assert_eq!(rx.len(), 1);

        let (_, k) = core.take(corr).unwrap();
        k(&mut (), Outcome::Reply(WorkerReply::Pong));
        assert_eq!(log.lock().unwrap().len(), 1);

        // A duplicate response for the same correlation finds nothing.
        assert!(core.take(corr).is_none());
    }

    #[test]
    fn per_target_frames_stay_fifo() {
        let mut core: DispatchCore<()> = DispatchCore::new();
        let (tx, rx) = channel::unbounded();
        core.register_worker(Target::domain("CORP"), tx);

        let c1 = queued(
            core.send(Target::domain("CORP"), WorkerRequest::Ping, Box::new(|_, _| {}))
                .unwrap(),
        );
        let c2 = queued(
            core.send(
                Target::domain("CORP"),
                WorkerRequest::EnumTrusts,
                Box::new(|_, _| {}),
            )
            .unwrap(),
        );
        assert!(c2 > c1);

        let first = wire::decode_request(&rx.recv().unwrap()).unwrap();
        let second = wire::decode_request(&rx.recv().unwrap()).unwrap();
        assert_eq!(first.correlation, c1);
        assert_eq!(second.correlation, c2);
    }

    #[test]
    fn transport_death_fails_all_pending_in_order() {
        let mut core: DispatchCore<()> = DispatchCore::new();
        let (tx, _rx) = channel::unbounded();
        core.register_worker(Target::domain("CORP"), tx.clone());
        let (other_tx, _other_rx) = channel::unbounded();
        core.register_worker(Target::Mapper, other_tx);

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = log.clone();
            core.send(
                Target::domain("CORP"),
                WorkerRequest::Ping,
                Box::new(move |_, outcome| {
                    assert!(matches!(outcome, Outcome::TransportFailed));
                    push(&log, name);
                }),
            )
            .unwrap();
        }
        let log2 = log.clone();
        core.send(
            Target::Mapper,
            WorkerRequest::Ping,
            Box::new(move |_, _| push(&log2, "mapper")),
        )
        .unwrap();

        for k in core.fail_target(&Target::domain("CORP")) {
            k(&mut (), Outcome::TransportFailed);
        }

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        // The mapper's request is untouched.
        assert_eq!(core.pending_count(), 1);
        assert!(!core.has_worker(&Target::domain("CORP")));
    }

    #[test]
    fn dead_worker_send_hands_the_continuation_back() {
        let mut core: DispatchCore<()> = DispatchCore::new();
        let (tx, rx) = channel::unbounded();
        core.register_worker(Target::Mapper, tx);
        drop(rx);

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let dispatched = core
            .send(
                Target::Mapper,
                WorkerRequest::Ping,
                Box::new(move |_, outcome| {
                    assert!(matches!(outcome, Outcome::TransportFailed));
                    push(&log2, "failed");
                }),
            )
            .unwrap();
        let Dispatched::WorkerGone(k) = dispatched else {
            panic!("expected the continuation back");
        };

        // Nothing parked: the caller owns the failure.
        assert_eq!(core.pending_count(), 0);
        assert!(!core.has_worker(&Target::Mapper));
        k(&mut (), Outcome::TransportFailed);
        assert_eq!(*log.lock().unwrap(), vec!["failed"]);
    }

    #[test]
    fn unknown_target_hands_the_continuation_back() {
        let mut core: DispatchCore<()> = DispatchCore::new();
        let dispatched = core
            .send(Target::domain("NOPE"), WorkerRequest::Ping, Box::new(|_, _| {}))
            .unwrap();
        assert!(matches!(dispatched, Dispatched::WorkerGone(_)));
        assert_eq!(core.pending_count(), 0);
    }
}
