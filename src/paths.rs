//! XDG directory helpers for config/state/runtime locations.

use std::path::PathBuf;

/// Base directory for persistent state (the idmap store, logs).
///
/// Uses `DOMAIND_STATE_DIR` if set, otherwise `$XDG_STATE_HOME/domaind` or
/// `~/.local/state/domaind`.
pub(crate) fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DOMAIND_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    std::env::var("XDG_STATE_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("state")
        })
        .join("domaind")
}

/// The idmap store database.
///
/// `DOMAIND_STORE` overrides the full path, for tests and packaging.
pub fn idmap_store_path() -> PathBuf {
    if let Ok(path) = std::env::var("DOMAIND_STORE") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    state_dir().join("idmap.sqlite")
}

/// Directory holding the daemon control socket and its metadata file.
///
/// Uses `DOMAIND_SOCKET_DIR` if set, otherwise `$XDG_RUNTIME_DIR/domaind`,
/// falling back to the state directory when no runtime dir exists.
pub fn socket_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DOMAIND_SOCKET_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    std::env::var("XDG_RUNTIME_DIR")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|dir| PathBuf::from(dir).join("domaind"))
        .unwrap_or_else(|| state_dir().join("run"))
}

/// The daemon control socket.
pub fn socket_path() -> PathBuf {
    socket_dir().join("domaind.sock")
}

/// Daemon metadata (version, protocol, pid) written next to the socket.
pub fn meta_path() -> PathBuf {
    socket_dir().join("meta.json")
}

/// Where rotated log files go.
pub fn log_dir() -> PathBuf {
    state_dir().join("logs")
}

/// Base directory for configuration files.
///
/// Uses `DOMAIND_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/domaind` or
/// `~/.config/domaind`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DOMAIND_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("domaind")
}
