//! Identity-mapping atoms.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::sid::Sid;

/// Which numeric namespace an id lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Uid,
    Gid,
}

impl IdKind {
    /// Store-key prefix. These spellings are persisted; do not change them.
    pub fn key_prefix(self) -> &'static str {
        match self {
            IdKind::Uid => "UID",
            IdKind::Gid => "GID",
        }
    }

    /// High-water-mark key for this id type.
    pub fn hwm_key(self) -> &'static str {
        match self {
            IdKind::Uid => "USER HWM",
            IdKind::Gid => "GROUP HWM",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Uid => write!(f, "uid"),
            IdKind::Gid => write!(f, "gid"),
        }
    }
}

/// A numeric unix id within some `IdKind` namespace.
pub type UnixId = u32;

/// Authoritativeness of a lookup answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapStatus {
    /// A mapping exists.
    Mapped,
    /// Authoritatively known to have no mapping.
    Unmapped,
    /// Could not be determined (transient).
    Unknown,
}

/// A resolved SID<->id pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub sid: Sid,
    pub kind: IdKind,
    pub id: UnixId,
}

impl Mapping {
    pub fn new(sid: Sid, kind: IdKind, id: UnixId) -> Self {
        Self { sid, kind, id }
    }

    /// The forward store key (`"UID 10005"`).
    pub fn id_key(&self) -> String {
        format!("{} {}", self.kind.key_prefix(), self.id)
    }
}
