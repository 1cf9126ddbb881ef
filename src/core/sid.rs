//! Security identifiers.
//!
//! A SID is `S-<revision>-<authority>-<sub1>-...-<subN>`. Domain SIDs carry
//! the machine/domain subauthorities; principal SIDs append one final
//! subauthority, the RID.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Most SIDs in the wild have 4-5 subauthorities; Windows caps at 15.
const MAX_SUBAUTHORITIES: usize = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SidParseError {
    #[error("sid {raw:?}: {reason}")]
    Invalid { raw: String, reason: String },
}

/// Structured security identifier.
///
/// Parsed form is canonical: `to_string` always reproduces the normalized
/// `S-1-...` spelling regardless of input case.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sid {
    revision: u8,
    authority: u64,
    subauthorities: Vec<u32>,
}

impl Sid {
    pub fn new(revision: u8, authority: u64, subauthorities: Vec<u32>) -> Result<Self, SidParseError> {
        if subauthorities.len() > MAX_SUBAUTHORITIES {
            return Err(SidParseError::Invalid {
                raw: format!("S-{}-{}-...", revision, authority),
                reason: format!("more than {} subauthorities", MAX_SUBAUTHORITIES),
            });
        }
        Ok(Self {
            revision,
            authority,
            subauthorities,
        })
    }

    pub fn parse(s: &str) -> Result<Self, SidParseError> {
        let invalid = |reason: &str| SidParseError::Invalid {
            raw: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.split('-');
        match parts.next() {
            Some(p) if p.eq_ignore_ascii_case("s") => {}
            _ => return Err(invalid("must start with 'S-'")),
        }
        let revision: u8 = parts
            .next()
            .ok_or_else(|| invalid("missing revision"))?
            .parse()
            .map_err(|_| invalid("bad revision"))?;
        let authority: u64 = parts
            .next()
            .ok_or_else(|| invalid("missing authority"))?
            .parse()
            .map_err(|_| invalid("bad authority"))?;

        let mut subauthorities = Vec::new();
        for part in parts {
            if subauthorities.len() == MAX_SUBAUTHORITIES {
                return Err(invalid("too many subauthorities"));
            }
            let sub: u32 = part.parse().map_err(|_| invalid("bad subauthority"))?;
            subauthorities.push(sub);
        }

        Ok(Self {
            revision,
            authority,
            subauthorities,
        })
    }

    /// The well-known BUILTIN domain SID (S-1-5-32).
    pub fn builtin() -> Self {
        Self {
            revision: 1,
            authority: 5,
            subauthorities: vec![32],
        }
    }

    /// Append a RID, producing a principal SID within this domain.
    pub fn with_rid(&self, rid: u32) -> Result<Self, SidParseError> {
        let mut subauthorities = self.subauthorities.clone();
        if subauthorities.len() == MAX_SUBAUTHORITIES {
            return Err(SidParseError::Invalid {
                raw: self.to_string(),
                reason: "cannot append rid: subauthority limit".into(),
            });
        }
        subauthorities.push(rid);
        Ok(Self {
            revision: self.revision,
            authority: self.authority,
            subauthorities,
        })
    }

    /// Split into (domain SID, RID). None if there is no subauthority to strip.
    pub fn split_rid(&self) -> Option<(Sid, u32)> {
        let (&rid, rest) = self.subauthorities.split_last()?;
        Some((
            Sid {
                revision: self.revision,
                authority: self.authority,
                subauthorities: rest.to_vec(),
            },
            rid,
        ))
    }

    /// True if `other` is a principal directly within this domain SID.
    pub fn is_domain_of(&self, other: &Sid) -> bool {
        match other.split_rid() {
            Some((domain, _)) => domain == *self,
            None => false,
        }
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-{}", self.revision, self.authority)?;
        for sub in &self.subauthorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", self)
    }
}

impl FromStr for Sid {
    type Err = SidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sid::parse(s)
    }
}

impl TryFrom<String> for Sid {
    type Error = SidParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Sid::parse(&s)
    }
}

impl From<Sid> for String {
    fn from(sid: Sid) -> String {
        sid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let raw = "S-1-5-21-3623811015-3361044348-30300820";
        let sid = Sid::parse(raw).unwrap();
        assert_eq!(sid.to_string(), raw);
    }

    #[test]
    fn parse_normalizes_case() {
        let sid = Sid::parse("s-1-5-32").unwrap();
        assert_eq!(sid, Sid::builtin());
        assert_eq!(sid.to_string(), "S-1-5-32");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Sid::parse("").is_err());
        assert!(Sid::parse("S-1").is_err());
        assert!(Sid::parse("X-1-5-32").is_err());
        assert!(Sid::parse("S-1-5-abc").is_err());
    }

    #[test]
    fn rid_split_and_append() {
        let domain = Sid::parse("S-1-5-21-1-2-3").unwrap();
        let user = domain.with_rid(1104).unwrap();
        assert_eq!(user.to_string(), "S-1-5-21-1-2-3-1104");

        let (back, rid) = user.split_rid().unwrap();
        assert_eq!(back, domain);
        assert_eq!(rid, 1104);
        assert!(domain.is_domain_of(&user));
        assert!(!user.is_domain_of(&domain));
    }

    #[test]
    fn serde_as_string() {
        let sid = Sid::parse("S-1-5-21-1-2-3").unwrap();
        let json = serde_json::to_string(&sid).unwrap();
        assert_eq!(json, "\"S-1-5-21-1-2-3\"");
        let parsed: Sid = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sid);
    }
}
