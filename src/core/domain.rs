//! Trust-relationship descriptors.

use serde::{Deserialize, Serialize};

use super::sid::Sid;

/// How a trusted domain relates to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustKind {
    /// The domain this machine is joined to.
    Primary,
    /// Synthetic local domains (BUILTIN, local SAM). Always online.
    Internal,
    /// Trust inside our own forest.
    InForest,
    /// Trust reachable transitively through a forest root (sibling forest).
    ForestTransitive,
    /// Explicit external trust.
    External,
}

/// Directory-service trust attributes we care about when walking topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustAttributes {
    /// Trust crosses forest boundaries transitively.
    pub forest_transitive: bool,
    /// The trusted domain runs Active Directory (Kerberos-capable).
    pub active_directory: bool,
    /// This domain is the root of its forest.
    pub forest_root: bool,
}

/// Static description of one domain in the trust topology.
///
/// Runtime state (online flag, connection, worker) lives on the registry's
/// `Domain` record; this is just what discovery/enumeration tells us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Short (NetBIOS) name, uppercase.
    pub name: String,
    /// DNS name, if the domain has one.
    pub alt_name: Option<String>,
    pub sid: Option<Sid>,
    pub kind: TrustKind,
    pub attributes: TrustAttributes,
}

impl DomainInfo {
    pub fn new(name: impl Into<String>, kind: TrustKind) -> Self {
        Self {
            name: name.into().to_uppercase(),
            alt_name: None,
            sid: None,
            kind,
            attributes: TrustAttributes::default(),
        }
    }

    pub fn with_sid(mut self, sid: Sid) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn with_alt_name(mut self, alt_name: impl Into<String>) -> Self {
        self.alt_name = Some(alt_name.into().to_lowercase());
        self
    }

    pub fn with_attributes(mut self, attributes: TrustAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.kind, TrustKind::Internal)
    }

    /// Matches either the short or the DNS name, case-insensitively.
    pub fn matches_name(&self, name: &str) -> bool {
        if self.name.eq_ignore_ascii_case(name) {
            return true;
        }
        self.alt_name
            .as_deref()
            .is_some_and(|alt| alt.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_normalized() {
        let info = DomainInfo::new("corp", TrustKind::Primary).with_alt_name("CORP.Example.COM");
        assert_eq!(info.name, "CORP");
        assert_eq!(info.alt_name.as_deref(), Some("corp.example.com"));
    }

    #[test]
    fn matches_either_name() {
        let info = DomainInfo::new("CORP", TrustKind::Primary).with_alt_name("corp.example.com");
        assert!(info.matches_name("corp"));
        assert!(info.matches_name("CORP.EXAMPLE.COM"));
        assert!(!info.matches_name("other"));
    }
}
