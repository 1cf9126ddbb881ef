//! Store schema upgrades.
//!
//! Version 1 keyed mappings by `DOMAIN/rid` on the directory side. Version 2
//! keys them by the full SID string. The upgrade rewrites every legacy record
//! in one transaction, gated on the version key, so a crash mid-upgrade
//! leaves the store fully old or fully new.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use crate::core::Sid;

use super::idmap::{StoreError, VERSION_KEY};

pub const SCHEMA_VERSION: u32 = 2;

pub(crate) fn version(conn: &Connection) -> Result<u32, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", [VERSION_KEY], |row| row.get(0))
        .optional()?;
    match raw {
        Some(raw) => raw.parse().map_err(|_| StoreError::BadRecord {
            key: VERSION_KEY.to_string(),
            value: raw,
        }),
        // Pre-versioned stores are version 1 by definition.
        None => Ok(1),
    }
}

pub(crate) fn run(
    conn: &mut Connection,
    resolve_domain: impl Fn(&str) -> Option<Sid>,
) -> Result<(), StoreError> {
    let current = version(conn)?;
    if current == SCHEMA_VERSION {
        return Ok(());
    }
    if current > SCHEMA_VERSION {
        return Err(StoreError::VersionFromTheFuture {
            got: current,
            newest: SCHEMA_VERSION,
        });
    }

    let tx = conn.transaction()?;

    let rows: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT key, value FROM kv")?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        mapped.collect::<Result<_, _>>()?
    };

    let mut rewritten = 0usize;
    for (key, value) in rows {
        let legacy_key = parse_legacy(&key);
        let legacy_value = parse_legacy(&value);
        if legacy_key.is_none() && legacy_value.is_none() {
            continue;
        }

        let new_key = match legacy_key {
            Some((domain, rid)) => Some(resolve_legacy(&resolve_domain, &key, domain, rid)?),
            None => None,
        };
        let new_value = match legacy_value {
            Some((domain, rid)) => Some(resolve_legacy(&resolve_domain, &key, domain, rid)?),
            None => None,
        };

        tx.execute("DELETE FROM kv WHERE key = ?1", [&key])?;
        tx.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![
                new_key.map(|s| s.to_string()).unwrap_or(key),
                new_value.map(|s| s.to_string()).unwrap_or(value)
            ],
        )?;
        rewritten += 1;
    }

    tx.execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
        params![VERSION_KEY, SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;

    if rewritten > 0 {
        info!(rewritten, from = current, to = SCHEMA_VERSION, "upgraded idmap store");
    }
    Ok(())
}

fn resolve_legacy(
    resolve_domain: &impl Fn(&str) -> Option<Sid>,
    record_key: &str,
    domain: &str,
    rid: u32,
) -> Result<Sid, StoreError> {
    let Some(domain_sid) = resolve_domain(domain) else {
        warn!(domain, record = record_key, "cannot resolve legacy idmap domain");
        return Err(StoreError::Corruption {
            key: record_key.to_string(),
            detail: format!("legacy record references unknown domain {domain:?}"),
        });
    };
    domain_sid.with_rid(rid).map_err(|_| StoreError::Corruption {
        key: record_key.to_string(),
        detail: format!("cannot append rid {rid} to {domain_sid}"),
    })
}

/// `DOMAIN/rid` if this string is a legacy directory-side record.
fn parse_legacy(raw: &str) -> Option<(&str, u32)> {
    let (domain, rid) = raw.split_once('/')?;
    if domain.is_empty() || domain.starts_with("S-") || domain.contains(' ') {
        return None;
    }
    let rid: u32 = rid.parse().ok()?;
    Some((domain, rid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IdKind;
    use crate::store::idmap::{raw_get, raw_put, IdmapConfig, IdmapStore};
    use std::path::Path;

    fn resolver(name: &str) -> Option<Sid> {
        (name == "CORP").then(|| Sid::parse("S-1-5-21-1-2-3").unwrap())
    }

    #[test]
    fn fresh_store_is_current_version() {
        let store = IdmapStore::open_in_memory(IdmapConfig::default()).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn legacy_records_are_rewritten_to_sid_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idmap.sqlite");

        // Seed a v1-shaped store by hand.
        seed_legacy(&path);

        let store = IdmapStore::open(&path, IdmapConfig::default(), resolver).unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);

        let sid = Sid::parse("S-1-5-21-1-2-3-512").unwrap();
        let mapping = store.lookup_sid(&sid).unwrap().unwrap();
        assert_eq!(mapping.kind, IdKind::Gid);
        assert_eq!(mapping.id, 10_007);
        assert_eq!(store.lookup_id(IdKind::Gid, 10_007).unwrap().unwrap().sid, sid);
    }

    #[test]
    fn unknown_legacy_domain_fails_the_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idmap.sqlite");
        seed_legacy(&path);

        let Err(err) = IdmapStore::open(&path, IdmapConfig::default(), |_| None) else {
            panic!("expected the upgrade to fail");
        };
        assert!(matches!(err, StoreError::Corruption { .. }));
    }

    fn seed_legacy(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )
        .unwrap();
        raw_put(&conn, "CORP/512", "GID 10007").unwrap();
        raw_put(&conn, "GID 10007", "CORP/512").unwrap();
        // No version key: that is what marks it as v1.
        assert!(raw_get(&conn, VERSION_KEY).unwrap().is_none());
    }
}
