//! The flat domain registry.
//!
//! One record per known domain, created when the trust walker (or static
//! config) first reports the domain and never removed while the daemon runs.
//! Records own the per-domain runtime state: liveness, controller affinity,
//! and the startup grace window. Connection handles live with the domain
//! worker threads, not here.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::{DomainInfo, Sid, TrustKind};

/// Where a domain is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Known but never connected.
    Uninitialized,
    /// A controller connection was established.
    Online,
    /// Establishment failed; a probe is (or will be) scheduled.
    Offline,
    /// A probe is in flight. Further probe requests are no-ops.
    Probing,
}

/// What a liveness event did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: Liveness, to: Liveness },
    NoOp,
}

/// Last controller that worked for a domain. Tried first next time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcAffinity {
    pub name: String,
    pub host: String,
}

/// Runtime record for one domain.
#[derive(Debug, Clone)]
pub struct Domain {
    pub info: DomainInfo,
    pub liveness: Liveness,
    /// Set by an operator via IPC; while set the domain reports offline and
    /// no probes are scheduled.
    pub forced_offline: bool,
    pub affinity: Option<DcAffinity>,
    /// Directory sequence number from the last successful poll, used to
    /// decide whether cached answers are still current.
    pub sequence: Option<u64>,
    registered_at: Instant,
}

impl Domain {
    fn new(info: DomainInfo) -> Self {
        // Internal domains never have controllers to lose.
        let liveness = if info.is_internal() {
            Liveness::Online
        } else {
            Liveness::Uninitialized
        };
        Self {
            info,
            liveness,
            forced_offline: false,
            affinity: None,
            sequence: None,
            registered_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// What clients should be told, folding in the forced flag.
    pub fn reported_liveness(&self) -> Liveness {
        if self.forced_offline && !self.info.is_internal() {
            Liveness::Offline
        } else {
            self.liveness
        }
    }

    pub fn is_online(&self) -> bool {
        self.reported_liveness() == Liveness::Online
    }

    /// Whether this domain is still inside its post-registration grace
    /// window, during which probes run on the short interval.
    pub fn in_startup_grace(&self, grace: Duration) -> bool {
        self.registered_at.elapsed() < grace
    }

    /// A connection attempt succeeded.
    ///
    /// Only `Uninitialized`, `Offline` and `Probing` records move to
    /// `Online`; a record already online stays put so duplicate probe
    /// responses cannot re-fire the online transition.
    pub fn mark_online(&mut self, affinity: DcAffinity) -> Transition {
        self.affinity = Some(affinity);
        let from = self.liveness;
        if from == Liveness::Online {
            return Transition::NoOp;
        }
        self.liveness = Liveness::Online;
        info!(domain = self.name(), ?from, "domain online");
        Transition::Changed {
            from,
            to: Liveness::Online,
        }
    }

    /// A connection died or establishment exhausted its candidates.
    pub fn mark_offline(&mut self) -> Transition {
        if self.info.is_internal() {
            return Transition::NoOp;
        }
        let from = self.liveness;
        if from == Liveness::Offline {
            return Transition::NoOp;
        }
        self.liveness = Liveness::Offline;
        warn!(domain = self.name(), ?from, "domain offline");
        Transition::Changed {
            from,
            to: Liveness::Offline,
        }
    }

    /// A probe is being dispatched. Returns `NoOp` when one is already in
    /// flight or the domain is not offline, so at most one prober runs per
    /// domain.
    pub fn mark_probing(&mut self) -> Transition {
        if self.forced_offline || self.liveness != Liveness::Offline {
            return Transition::NoOp;
        }
        self.liveness = Liveness::Probing;
        debug!(domain = self.name(), "probing");
        Transition::Changed {
            from: Liveness::Offline,
            to: Liveness::Probing,
        }
    }

    /// A probe came back negative.
    pub fn mark_probe_failed(&mut self) -> Transition {
        if self.liveness != Liveness::Probing {
            return Transition::NoOp;
        }
        self.liveness = Liveness::Offline;
        Transition::Changed {
            from: Liveness::Probing,
            to: Liveness::Offline,
        }
    }
}

/// All domains the daemon knows about, flat, keyed by insertion order.
///
/// The trust topology is remembered only through each record's `TrustKind`;
/// there is no tree to rebalance and no parent pointers to chase.
#[derive(Default)]
pub struct DomainRegistry {
    domains: Vec<Domain>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record if no domain with this name or SID exists yet.
    ///
    /// Registration is add-only: a second report of the same domain updates
    /// nothing and returns `false`. A second `Primary` record is refused
    /// outright.
    pub fn register(&mut self, info: DomainInfo) -> bool {
        if self.find(&info.name).is_some() {
            return false;
        }
        if let Some(sid) = &info.sid {
            if self.find_by_sid(sid).is_some() {
                return false;
            }
        }
        if info.kind == TrustKind::Primary && self.primary().is_some() {
            warn!(domain = %info.name, "refusing second primary domain");
            return false;
        }
        info!(domain = %info.name, kind = ?info.kind, "registered domain");
        self.domains.push(Domain::new(info));
        true
    }

    pub fn find(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.info.matches_name(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Domain> {
        self.domains.iter_mut().find(|d| d.info.matches_name(name))
    }

    /// Exact domain-SID match only; member SIDs go through
    /// [`DomainRegistry::find_by_member_sid`].
    pub fn find_by_sid(&self, sid: &Sid) -> Option<&Domain> {
        self.domains
            .iter()
            .find(|d| d.info.sid.as_ref() == Some(sid))
    }

    /// The domain whose SID is a prefix of `sid` (i.e. `sid` names one of
    /// its members).
    pub fn find_by_member_sid(&self, sid: &Sid) -> Option<&Domain> {
        self.domains.iter().find(|d| {
            d.info
                .sid
                .as_ref()
                .is_some_and(|domain_sid| domain_sid.is_domain_of(sid))
        })
    }

    pub fn primary(&self) -> Option<&Domain> {
        self.domains
            .iter()
            .find(|d| d.info.kind == TrustKind::Primary)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Domain> {
        self.domains.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Domain> {
        self.domains.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
