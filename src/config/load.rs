use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

use super::Config;

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("domaind.toml")
}

pub fn load() -> Result<Config> {
    let path = config_path();
    if !path.exists() {
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        return Ok(config);
    }
    let contents = fs::read_to_string(&path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    let mut config: Config = toml::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load, falling back to defaults on error, and write a starter config on
/// first run so operators have something to edit.
pub fn load_or_init() -> Config {
    let path = config_path();
    let had_config = path.exists();

    let config = match load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if !had_config {
        if let Err(e) = write_config(&path, &Config::default()) {
            tracing::warn!("failed to write default config: {e}");
        }
    }

    config
}

/// Environment wins over the config file for the knobs operators most often
/// need to flip without editing anything.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(domain) = std::env::var("DOMAIND_DOMAIN") {
        if !domain.trim().is_empty() {
            config.auth.domain = domain.trim().to_uppercase();
        }
    }
    if let Ok(realm) = std::env::var("DOMAIND_REALM") {
        if !realm.trim().is_empty() {
            config.auth.realm = Some(realm.trim().to_uppercase());
        }
    }
    if let Ok(filter) = std::env::var("DOMAIND_LOG") {
        if !filter.trim().is_empty() {
            config.logging.filter = Some(filter);
        }
    }
    if let Ok(path) = std::env::var("DOMAIND_STORE") {
        if !path.trim().is_empty() {
            config.idmap.path = Some(PathBuf::from(path));
        }
    }
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(cfg)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| config_error("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), data)
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> Error {
    Error::Config { reason }
}
