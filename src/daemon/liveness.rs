//! Offline-domain probing.
//!
//! When a domain goes offline the state loop schedules a probe; the
//! scheduler parks the due time and fires a name down the timer channel
//! when it passes. The probe itself runs on a short-lived thread and only
//! checks socket-level reachability; a positive result makes the parent ask
//! the domain worker for a full re-establishment, it never flips the domain
//! online by itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use tracing::debug;

use crate::config::ServerConfig;
use crate::core::DomainInfo;

use super::discovery::Discovery;
use super::transport::{race_connect, SecurityProvider};
use super::worker::WorkerEvent;

/// Delayed probe triggers, one pending slot per domain.
///
/// Rescheduling an already-pending domain keeps the earlier fire time, so a
/// flood of offline events collapses into one probe.
pub struct ProbeScheduler {
    pending: HashMap<String, Instant>,
    timer_tx: Sender<String>,
}

impl ProbeScheduler {
    pub fn new(timer_tx: Sender<String>) -> Self {
        Self {
            pending: HashMap::new(),
            timer_tx,
        }
    }

    /// The probe delay for a domain: short while it is inside its startup
    /// grace window, the regular cache-refresh interval afterwards.
    pub fn delay_for(config: &ServerConfig, in_startup_grace: bool) -> Duration {
        if in_startup_grace {
            config.startup_probe()
        } else {
            config.cache_refresh()
        }
    }

    pub fn schedule(&mut self, domain: &str, delay: Duration) {
        let domain = domain.to_uppercase();
        let fire_at = Instant::now() + delay;

        if let Some(&existing) = self.pending.get(&domain) {
            if existing <= fire_at {
                return;
            }
        }

        debug!(domain = %domain, ?delay, "probe scheduled");
        self.pending.insert(domain.clone(), fire_at);

        let tx = self.timer_tx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            // Ignore send errors, the receiver may have been dropped.
            let _ = tx.send(domain);
        });
    }

    /// Whether a timer message means its probe is actually due. Removes the
    /// pending entry when it fires; stale timers (rescheduled or cancelled
    /// domains) return false.
    pub fn should_fire(&mut self, domain: &str) -> bool {
        let domain = domain.to_uppercase();
        if let Some(&fire_at) = self.pending.get(&domain) {
            if Instant::now() >= fire_at {
                self.pending.remove(&domain);
                return true;
            }
        }
        false
    }

    pub fn cancel(&mut self, domain: &str) {
        self.pending.remove(&domain.to_uppercase());
    }

    pub fn is_pending(&self, domain: &str) -> bool {
        self.pending.contains_key(&domain.to_uppercase())
    }
}

/// Check reachability of any controller of `domain` on a background thread
/// and report through the event channel.
pub fn spawn_prober(
    domain: DomainInfo,
    discovery: Arc<Discovery>,
    provider: Arc<dyn SecurityProvider>,
    ports: Vec<u16>,
    timeout: Duration,
    events: Sender<WorkerEvent>,
) {
    std::thread::spawn(move || {
        let reachable = probe(&domain, &discovery, &provider, &ports, timeout);
        let _ = events.send(WorkerEvent::ProbeDone {
            domain: domain.name,
            reachable,
        });
    });
}

fn probe(
    domain: &DomainInfo,
    discovery: &Discovery,
    provider: &Arc<dyn SecurityProvider>,
    ports: &[u16],
    timeout: Duration,
) -> bool {
    let candidates = match discovery.discover(domain) {
        Ok(candidates) => candidates,
        Err(_) => return false,
    };
    for candidate in candidates {
        if race_connect(provider, &candidate.host, ports, timeout).is_ok() {
            debug!(domain = %domain.name, dc = %candidate.name, "probe reached a controller");
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn schedule_and_fire() {
        let (tx, rx) = channel::unbounded();
        let mut scheduler = ProbeScheduler::new(tx);
        scheduler.schedule("CORP", Duration::from_millis(10));
        assert!(scheduler.is_pending("corp"));

        let fired = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(fired, "CORP");
        assert!(scheduler.should_fire(&fired));
        assert!(!scheduler.is_pending("CORP"));
    }

    #[test]
    fn earlier_schedule_wins() {
        let (tx, _rx) = channel::unbounded();
        let mut scheduler = ProbeScheduler::new(tx);
        scheduler.schedule("CORP", Duration::from_millis(10));
        scheduler.schedule("CORP", Duration::from_secs(300));
        std::thread::sleep(Duration::from_millis(20));
        assert!(scheduler.should_fire("CORP"));
    }

    #[test]
    fn cancelled_probe_does_not_fire() {
        let (tx, _rx) = channel::unbounded();
        let mut scheduler = ProbeScheduler::new(tx);
        scheduler.schedule("CORP", Duration::from_millis(5));
        scheduler.cancel("CORP");
        std::thread::sleep(Duration::from_millis(10));
        assert!(!scheduler.should_fire("CORP"));
    }

    #[test]
    fn grace_window_uses_short_interval() {
        let config = ServerConfig::default();
        assert_eq!(
            ProbeScheduler::delay_for(&config, true),
            Duration::from_secs(10)
        );
        assert_eq!(
            ProbeScheduler::delay_for(&config, false),
            Duration::from_secs(300)
        );
    }
}
