#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
mod paths;
pub mod store;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    DomainInfo, IdKind, MapStatus, Mapping, Secret, Sid, SidParseError, TrustAttributes, TrustKind,
    UnixId,
};
pub use crate::paths::{idmap_store_path, meta_path, socket_dir, socket_path};
