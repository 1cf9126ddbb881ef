//! Trust topology walker.
//!
//! Three fixed phases, no recursion: (1) enumerate the primary domain's
//! direct trusts, (2) enumerate the forest root's trusts, (3) enumerate the
//! trusts of forest-transitive peers found so far. Results are handed to
//! the registry, which is add-only, so a domain that stops being advertised
//! stays known until restart. The walker itself is a state machine; the
//! state loop owns the dispatching and feeds results back in.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{DomainInfo, TrustKind};
use crate::error::Transience;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrustError {
    #[error("trust enumeration against {domain} failed: {reason}")]
    EnumerationFailed { domain: String, reason: String },
}

impl TrustError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    PrimaryTrusts,
    ForestRoot,
    TransitivePeers,
    Done,
}

/// What the driver should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum WalkStep {
    /// Send an enumerate-trusts request to each named domain.
    Query(Vec<String>),
    /// The walk is over; `failures` names domains whose enumeration failed.
    Done { failures: Vec<TrustError> },
}

/// One in-flight rescan of the topology.
pub struct TrustWalk {
    primary: String,
    phase: Phase,
    /// Domains queried in any phase; never queried twice per walk.
    queried: HashSet<String>,
    /// Outstanding queries in the current phase.
    outstanding: usize,
    /// Everything enumeration reported this walk.
    found: Vec<DomainInfo>,
    failures: Vec<TrustError>,
}

impl TrustWalk {
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into().to_uppercase(),
            phase: Phase::PrimaryTrusts,
            queried: HashSet::new(),
            outstanding: 0,
            found: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Phase one: the primary domain's own trust list.
    pub fn begin(&mut self) -> WalkStep {
        self.issue(vec![self.primary.clone()])
    }

    /// Feed one enumeration answer back in. Returns the domains to register
    /// plus the next step.
    pub fn on_trusts(
        &mut self,
        from: &str,
        trusts: Vec<DomainInfo>,
    ) -> (Vec<DomainInfo>, WalkStep) {
        debug!(from, count = trusts.len(), phase = ?self.phase, "trusts enumerated");
        let register = trusts.clone();
        self.found.extend(trusts);
        self.outstanding = self.outstanding.saturating_sub(1);
        let step = self.advance_if_drained();
        (register, step)
    }

    /// One enumeration failed. The walk continues; a partial answer is
    /// better than none and the next rescan will retry.
    pub fn on_failure(&mut self, from: &str, reason: impl Into<String>) -> WalkStep {
        let reason = reason.into();
        warn!(from, %reason, "trust enumeration failed");
        self.failures.push(TrustError::EnumerationFailed {
            domain: from.to_uppercase(),
            reason,
        });
        self.outstanding = self.outstanding.saturating_sub(1);
        self.advance_if_drained()
    }

    fn advance_if_drained(&mut self) -> WalkStep {
        if self.outstanding > 0 {
            return WalkStep::Query(Vec::new());
        }
        loop {
            self.phase = match self.phase {
                Phase::PrimaryTrusts => Phase::ForestRoot,
                Phase::ForestRoot => Phase::TransitivePeers,
                Phase::TransitivePeers | Phase::Done => Phase::Done,
            };
            match self.phase {
                Phase::ForestRoot => {
                    let roots = self.targets(|d| d.attributes.forest_root);
                    if !roots.is_empty() {
                        return self.issue(roots);
                    }
                    // No distinct forest root reported; fall through.
                }
                Phase::TransitivePeers => {
                    let peers = self.targets(|d| {
                        d.attributes.forest_transitive && d.kind != TrustKind::External
                    });
                    if !peers.is_empty() {
                        return self.issue(peers);
                    }
                }
                _ => {}
            }
            if self.phase == Phase::Done {
                return WalkStep::Done {
                    failures: std::mem::take(&mut self.failures),
                };
            }
        }
    }

    fn targets(&self, select: impl Fn(&DomainInfo) -> bool) -> Vec<String> {
        let mut names = Vec::new();
        for domain in &self.found {
            if select(domain)
                && !self.queried.contains(&domain.name)
                && !names.contains(&domain.name)
            {
                names.push(domain.name.clone());
            }
        }
        names
    }

    fn issue(&mut self, names: Vec<String>) -> WalkStep {
        self.outstanding = names.len();
        for name in &names {
            self.queried.insert(name.clone());
        }
        WalkStep::Query(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TrustAttributes;

    fn domain(name: &str, kind: TrustKind) -> DomainInfo {
        DomainInfo::new(name, kind)
    }

    fn forest_root(name: &str) -> DomainInfo {
        domain(name, TrustKind::InForest).with_attributes(TrustAttributes {
            forest_root: true,
            forest_transitive: true,
            active_directory: true,
        })
    }

    fn transitive(name: &str) -> DomainInfo {
        domain(name, TrustKind::ForestTransitive).with_attributes(TrustAttributes {
            forest_transitive: true,
            active_directory: true,
            forest_root: false,
        })
    }

    #[test]
    fn walk_runs_three_phases() {
        let mut walk = TrustWalk::new("corp");
        assert_eq!(walk.begin(), WalkStep::Query(vec!["CORP".to_string()]));

        // Phase 1 answer: a forest root and an external trust.
        let (register, step) = walk.on_trusts(
            "CORP",
            vec![forest_root("ROOT"), domain("OLDDOM", TrustKind::External)],
        );
        assert_eq!(register.len(), 2);
        assert_eq!(step, WalkStep::Query(vec!["ROOT".to_string()]));

        // Phase 2 answer: the root names a sibling forest.
        let (_, step) = walk.on_trusts("ROOT", vec![transitive("PARTNER")]);
        assert_eq!(step, WalkStep::Query(vec!["PARTNER".to_string()]));

        // Phase 3 answer ends the walk; whatever PARTNER reports is
        // registered but not queried further.
        let (register, step) = walk.on_trusts("PARTNER", vec![transitive("FARAWAY")]);
        assert_eq!(register.len(), 1);
        assert!(matches!(step, WalkStep::Done { ref failures } if failures.is_empty()));
    }

    #[test]
    fn failure_is_recorded_but_not_fatal() {
        let mut walk = TrustWalk::new("CORP");
        walk.begin();
        let (_, step) = walk.on_trusts("CORP", vec![forest_root("ROOT")]);
        assert_eq!(step, WalkStep::Query(vec!["ROOT".to_string()]));

        let step = walk.on_failure("ROOT", "connection lost");
        let WalkStep::Done { failures } = step else {
            panic!("expected walk end, got {step:?}");
        };
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn domains_are_queried_once_per_walk() {
        let mut walk = TrustWalk::new("CORP");
        walk.begin();
        // The root advertises itself again; it must not be re-queried.
        let (_, step) = walk.on_trusts("CORP", vec![forest_root("ROOT")]);
        assert_eq!(step, WalkStep::Query(vec!["ROOT".to_string()]));
        let (_, step) = walk.on_trusts("ROOT", vec![forest_root("ROOT")]);
        assert!(matches!(step, WalkStep::Done { .. }));
    }

    #[test]
    fn empty_primary_answer_ends_immediately() {
        let mut walk = TrustWalk::new("CORP");
        walk.begin();
        let (_, step) = walk.on_trusts("CORP", Vec::new());
        assert!(matches!(step, WalkStep::Done { .. }));
    }

    #[test]
    fn phase_two_fans_out_over_all_outstanding() {
        let mut walk = TrustWalk::new("CORP");
        walk.begin();
        let (_, step) = walk.on_trusts("CORP", vec![forest_root("R1"), forest_root("R2")]);
        assert_eq!(
            step,
            WalkStep::Query(vec!["R1".to_string(), "R2".to_string()])
        );
        // First of two answers: still waiting.
        let (_, step) = walk.on_trusts("R1", Vec::new());
        assert_eq!(step, WalkStep::Query(Vec::new()));
        let (_, step) = walk.on_trusts("R2", Vec::new());
        assert!(matches!(step, WalkStep::Done { .. }));
    }
}
