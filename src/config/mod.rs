//! Config loading and persistence.

mod load;
mod schema;

pub use load::{apply_env_overrides, config_path, load, load_or_init, write_config};
pub use schema::{
    AuthConfig, Config, ConnectConfig, FileLoggingConfig, IdmapRangeConfig, LogFormat, LogRotation,
    LoggingConfig, ServerConfig, StaticDomainConfig,
};
