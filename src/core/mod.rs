//! Core value types shared across the daemon.
//!
//! Sid: structured security identifier
//! DomainInfo / TrustKind: trust-relationship descriptors
//! IdKind / Mapping: identity-mapping atoms
//! Secret: opaque credential storage

pub mod domain;
pub mod id;
pub mod secret;
pub mod sid;

pub use domain::{DomainInfo, TrustAttributes, TrustKind};
pub use id::{IdKind, MapStatus, Mapping, UnixId};
pub use secret::Secret;
pub use sid::{Sid, SidParseError};
