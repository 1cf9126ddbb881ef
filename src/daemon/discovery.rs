//! Controller discovery.
//!
//! Turns a domain name into an ordered list of controller candidates.
//! Mechanisms run in order and their results are merged, first writer wins
//! per controller name: the directory query (DNS over the domain's DNS
//! name), then the subnet get-DC broadcast. Controller affinity is not a
//! mechanism; the establisher moves the remembered controller to the front
//! itself.

use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::ConnectConfig;
use crate::core::DomainInfo;

use super::mailslot::{self, GetDcQuery, MailslotFrame};
use super::transport::PORT_DIRECT;

/// One controller worth trying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcCandidate {
    /// Controller machine name, uppercase.
    pub name: String,
    /// Hostname or address to dial.
    pub host: String,
}

impl DcCandidate {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into().to_uppercase(),
            host: host.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Every mechanism came back empty. The domain is unreachable and no
    /// connect attempt should even start.
    #[error("no controllers discovered for {domain}")]
    Empty { domain: String },

    #[error("discovery I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One discovery mechanism.
pub trait DcLocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidates for `domain`, best first. An empty list is not an error;
    /// mechanisms that cannot apply (no DNS name, say) return empty.
    fn locate(&self, domain: &DomainInfo) -> Result<Vec<DcCandidate>, DiscoveryError>;
}

/// Runs the configured mechanisms in order and merges their answers.
pub struct Discovery {
    locators: Vec<Box<dyn DcLocator>>,
}

impl Discovery {
    pub fn new(locators: Vec<Box<dyn DcLocator>>) -> Self {
        Self { locators }
    }

    /// Standard stack: directory query first, broadcast second.
    pub fn standard(config: &ConnectConfig, machine: String) -> Self {
        Self::new(vec![
            Box::new(DnsLocator),
            Box::new(BroadcastLocator::new(config, machine)),
        ])
    }

    pub fn discover(&self, domain: &DomainInfo) -> Result<Vec<DcCandidate>, DiscoveryError> {
        let mut merged: Vec<DcCandidate> = Vec::new();
        for locator in &self.locators {
            match locator.locate(domain) {
                Ok(found) => {
                    trace!(
                        domain = %domain.name,
                        mechanism = locator.name(),
                        count = found.len(),
                        "discovery mechanism done"
                    );
                    for candidate in found {
                        if !merged.iter().any(|c| c.name == candidate.name) {
                            merged.push(candidate);
                        }
                    }
                }
                Err(err) => {
                    // One mechanism failing must not sink the others.
                    warn!(domain = %domain.name, mechanism = locator.name(), %err, "discovery mechanism failed");
                }
            }
        }

        if merged.is_empty() {
            return Err(DiscoveryError::Empty {
                domain: domain.name.clone(),
            });
        }
        debug!(domain = %domain.name, count = merged.len(), "controllers discovered");
        Ok(merged)
    }
}

/// Directory query over the domain's DNS name.
///
/// Resolves the DNS domain name; every address the resolver hands back is a
/// candidate. Controller names come back from the reverse of what we dialed
/// once a session is up, so here the DNS name itself stands in.
pub struct DnsLocator;

impl DcLocator for DnsLocator {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn locate(&self, domain: &DomainInfo) -> Result<Vec<DcCandidate>, DiscoveryError> {
        let Some(dns_name) = domain.alt_name.as_deref() else {
            return Ok(Vec::new());
        };
        let addrs = match (dns_name, PORT_DIRECT).to_socket_addrs() {
            Ok(addrs) => addrs,
            // NXDOMAIN and friends mean "mechanism has nothing", not I/O
            // failure worth aborting over.
            Err(_) => return Ok(Vec::new()),
        };
        Ok(addrs
            .map(|addr| DcCandidate::new(dns_name, addr.ip().to_string()))
            .collect())
    }
}

/// Subnet get-DC broadcast with a bounded poll loop.
pub struct BroadcastLocator {
    polls: u32,
    poll_interval: Duration,
    machine: String,
}

impl BroadcastLocator {
    pub fn new(config: &ConnectConfig, machine: String) -> Self {
        Self {
            polls: config.broadcast_polls,
            poll_interval: config.broadcast_poll(),
            machine,
        }
    }
}

const DATAGRAM_PORT: u16 = 138;

impl DcLocator for BroadcastLocator {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn locate(&self, domain: &DomainInfo) -> Result<Vec<DcCandidate>, DiscoveryError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(self.poll_interval))?;

        let token = rand::random::<u32>();
        let query = mailslot::encode(&MailslotFrame::Query(GetDcQuery {
            token,
            domain: domain.name.clone(),
            machine: self.machine.clone(),
        }));
        socket.send_to(&query, ("255.255.255.255", DATAGRAM_PORT))?;

        // One recv per poll round; responses for a stale token are dropped.
        let mut found = Vec::new();
        let mut buf = [0u8; 1024];
        for _ in 0..self.polls {
            let (len, _peer) = match socket.recv_from(&mut buf) {
                Ok(got) => got,
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match mailslot::decode(&buf[..len]) {
                Ok(MailslotFrame::Response(resp))
                    if resp.token == token && domain.matches_name(&resp.domain) =>
                {
                    found.push(DcCandidate::new(resp.dc_name, resp.dc_host));
                }
                Ok(_) => {}
                Err(err) => trace!(%err, "ignoring undecodable datagram"),
            }
        }
        Ok(found)
    }
}

/// Fixed candidate list, for tests and statically configured controllers.
pub struct StaticLocator {
    candidates: Vec<DcCandidate>,
}

impl StaticLocator {
    pub fn new(candidates: Vec<DcCandidate>) -> Self {
        Self { candidates }
    }
}

impl DcLocator for StaticLocator {
    fn name(&self) -> &'static str {
        "static"
    }

    fn locate(&self, _domain: &DomainInfo) -> Result<Vec<DcCandidate>, DiscoveryError> {
        Ok(self.candidates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TrustKind;

    struct FailingLocator;

    impl DcLocator for FailingLocator {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn locate(&self, _domain: &DomainInfo) -> Result<Vec<DcCandidate>, DiscoveryError> {
            Err(DiscoveryError::Io(std::io::Error::other("boom")))
        }
    }

    fn corp() -> DomainInfo {
        DomainInfo::new("CORP", TrustKind::Primary)
    }

    #[test]
    fn mechanisms_merge_without_duplicates() {
        let discovery = Discovery::new(vec![
            Box::new(StaticLocator::new(vec![
                DcCandidate::new("DC01", "10.0.0.1"),
                DcCandidate::new("DC02", "10.0.0.2"),
            ])),
            Box::new(StaticLocator::new(vec![
                DcCandidate::new("dc01", "10.0.0.99"),
                DcCandidate::new("DC03", "10.0.0.3"),
            ])),
        ]);
        let found = discovery.discover(&corp()).unwrap();
        assert_eq!(found.len(), 3);
        // First mechanism's answer wins for DC01.
        assert_eq!(found[0].host, "10.0.0.1");
    }

    #[test]
    fn one_failing_mechanism_does_not_sink_the_rest() {
        let discovery = Discovery::new(vec![
            Box::new(FailingLocator),
            Box::new(StaticLocator::new(vec![DcCandidate::new(
                "DC01", "10.0.0.1",
            )])),
        ]);
        assert_eq!(discovery.discover(&corp()).unwrap().len(), 1);
    }

    #[test]
    fn empty_everywhere_is_an_error() {
        let discovery = Discovery::new(vec![Box::new(StaticLocator::new(Vec::new()))]);
        assert!(matches!(
            discovery.discover(&corp()),
            Err(DiscoveryError::Empty { .. })
        ));
    }
}
