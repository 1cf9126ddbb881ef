//! Opaque credential storage.
//!
//! Replaces mlock'd raw buffers with a narrow store/expose/destroy surface.
//! The backing is zeroized on drop; Debug/Display never print the value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A credential byte string that is wiped when dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn store(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run `f` over the secret bytes without letting the value escape as an
    /// owned String.
    pub fn expose<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(&self.0)
    }

    /// Wipe in place without waiting for drop.
    pub fn destroy(&mut self) {
        wipe(&mut self.0);
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

fn wipe(s: &mut String) {
    // Overwrite in place before truncation so the allocation is scrubbed.
    // SAFETY-free: operate on the owned buffer via a zeroed replacement.
    let len = s.len();
    s.clear();
    s.push_str(&"\0".repeat(len));
    s.clear();
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_sees_value_debug_does_not() {
        let secret = Secret::store("hunter2");
        assert_eq!(secret.expose(|s| s.len()), 7);
        assert_eq!(format!("{:?}", secret), "Secret(***)");
    }

    #[test]
    fn destroy_empties() {
        let mut secret = Secret::store("hunter2");
        secret.destroy();
        assert!(secret.is_empty());
    }
}
