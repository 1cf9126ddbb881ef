//! SQLite-backed SID<->id mapping engine.
//!
//! Layout is a flat key/value table:
//! - `"UID <n>"` / `"GID <n>"` -> SID string
//! - SID string -> `"UID <n>"` / `"GID <n>"`
//! - `"USER HWM"` / `"GROUP HWM"` -> next unallocated id
//! - `"IDMAP_VERSION"` -> schema version
//!
//! The two directions of a mapping are always written and deleted in one
//! transaction. A read that finds one direction without the other is
//! corruption and is surfaced, never repaired.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::{IdKind, Mapping, Sid};

use super::upgrade;

const BUSY_TIMEOUT_MS: u64 = 5_000;

pub(crate) const VERSION_KEY: &str = "IDMAP_VERSION";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Paired records disagree. Never repaired silently.
    #[error("store corruption at {key:?}: {detail}")]
    Corruption { key: String, detail: String },

    #[error("{kind} allocation exhausted: high water mark reached ceiling {ceiling}")]
    AllocationExhausted { kind: IdKind, ceiling: u32 },

    #[error("sid {sid} already mapped to {existing:?}")]
    AlreadyMapped { sid: Sid, existing: String },

    /// Removal target does not exist or the supplied pair does not match.
    #[error("no matching mapping for {sid} <-> {id_key}")]
    NoneMapped { sid: Sid, id_key: String },

    #[error("malformed store record {key:?}: {value:?}")]
    BadRecord { key: String, value: String },

    #[error("unsupported store schema version {got} (newest known: {newest})")]
    VersionFromTheFuture { got: u32, newest: u32 },
}

impl StoreError {
    /// Whether a caller-side retry may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Sqlite(_) | StoreError::Io { .. })
    }
}

/// Inclusive allocation bounds for one id type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub low: u32,
    pub high: u32,
}

impl IdRange {
    pub fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }
}

impl Default for IdRange {
    fn default() -> Self {
        Self {
            low: 10_000,
            high: 20_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdmapConfig {
    pub uid_range: IdRange,
    pub gid_range: IdRange,
    /// Override the store file location.
    pub path: Option<PathBuf>,
}

impl IdmapConfig {
    fn range(&self, kind: IdKind) -> IdRange {
        match kind {
            IdKind::Uid => self.uid_range,
            IdKind::Gid => self.gid_range,
        }
    }
}

/// Handle to the mapping store. Owned exclusively by the mapping worker;
/// nothing else touches the file while the daemon runs.
pub struct IdmapStore {
    conn: Connection,
    config: IdmapConfig,
}

impl IdmapStore {
    /// Open (creating if needed) and upgrade the store at `path`.
    ///
    /// `resolve_domain` maps a legacy short domain name to its SID for the
    /// schema upgrade pass; pass the registry's view of known domains.
    pub fn open(
        path: &Path,
        config: IdmapConfig,
        resolve_domain: impl Fn(&str) -> Option<Sid>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;

        let mut store = Self { conn, config };
        store.init_counters()?;
        upgrade::run(&mut store.conn, resolve_domain)?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(config: IdmapConfig) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        let mut store = Self { conn, config };
        store.init_counters()?;
        upgrade::run(&mut store.conn, |_| None)?;
        Ok(store)
    }

    fn init_counters(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for kind in [IdKind::Uid, IdKind::Gid] {
            let existing: Option<String> = tx
                .query_row("SELECT value FROM kv WHERE key = ?1", [kind.hwm_key()], |row| {
                    row.get(0)
                })
                .optional()?;
            if existing.is_none() {
                let floor = self.config.range(kind).low;
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)",
                    params![kind.hwm_key(), floor.to_string()],
                )?;
                debug!(kind = %kind, floor, "initialized high water mark");
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Current high water mark (next unallocated id) for `kind`.
    pub fn high_water_mark(&self, kind: IdKind) -> Result<u32, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [kind.hwm_key()], |row| {
                row.get(0)
            })
            .optional()?;
        let raw = raw.ok_or_else(|| StoreError::Corruption {
            key: kind.hwm_key().to_string(),
            detail: "high water mark record missing".into(),
        })?;
        parse_counter(kind.hwm_key(), &raw)
    }

    /// Look up the mapping for a SID, checking both directions agree.
    pub fn lookup_sid(&self, sid: &Sid) -> Result<Option<Mapping>, StoreError> {
        let sid_key = sid.to_string();
        let forward: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [&sid_key], |row| row.get(0))
            .optional()?;
        let Some(id_key) = forward else {
            return Ok(None);
        };
        let (kind, id) = parse_id_key(&sid_key, &id_key)?;

        let reverse: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [&id_key], |row| row.get(0))
            .optional()?;
        match reverse {
            Some(back) if back == sid_key => Ok(Some(Mapping::new(sid.clone(), kind, id))),
            Some(back) => Err(StoreError::Corruption {
                key: id_key,
                detail: format!("reverse record points at {back:?}, expected {sid_key:?}"),
            }),
            None => Err(StoreError::Corruption {
                key: id_key,
                detail: "forward record present, reverse record missing".into(),
            }),
        }
    }

    /// Look up the mapping for a numeric id, checking both directions agree.
    pub fn lookup_id(&self, kind: IdKind, id: u32) -> Result<Option<Mapping>, StoreError> {
        let id_key = format!("{} {}", kind.key_prefix(), id);
        let forward: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [&id_key], |row| row.get(0))
            .optional()?;
        let Some(sid_key) = forward else {
            return Ok(None);
        };
        let sid = Sid::parse(&sid_key).map_err(|_| StoreError::BadRecord {
            key: id_key.clone(),
            value: sid_key.clone(),
        })?;

        let reverse: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [&sid_key], |row| row.get(0))
            .optional()?;
        match reverse {
            Some(back) if back == id_key => Ok(Some(Mapping::new(sid, kind, id))),
            Some(back) => Err(StoreError::Corruption {
                key: sid_key,
                detail: format!("reverse record points at {back:?}, expected {id_key:?}"),
            }),
            None => Err(StoreError::Corruption {
                key: sid_key,
                detail: "id record present, sid record missing".into(),
            }),
        }
    }

    /// Write an explicit mapping. Both directions commit in one transaction.
    pub fn set_mapping(&mut self, mapping: &Mapping) -> Result<(), StoreError> {
        let sid_key = mapping.sid.to_string();
        let id_key = mapping.id_key();

        let tx = self.conn.transaction()?;
        for key in [&sid_key, &id_key] {
            let existing: Option<String> = tx
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()?;
            if let Some(existing) = existing {
                return Err(StoreError::AlreadyMapped {
                    sid: mapping.sid.clone(),
                    existing,
                });
            }
        }
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)",
            params![sid_key, id_key],
        )?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)",
            params![id_key, sid_key],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a mapping. The caller must supply the exact pair; a mismatched
    /// id is rejected without touching the store.
    pub fn remove_mapping(&mut self, mapping: &Mapping) -> Result<(), StoreError> {
        let sid_key = mapping.sid.to_string();
        let id_key = mapping.id_key();

        let tx = self.conn.transaction()?;
        let forward: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [&sid_key], |row| row.get(0))
            .optional()?;
        let reverse: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [&id_key], |row| row.get(0))
            .optional()?;

        match (forward.as_deref(), reverse.as_deref()) {
            (Some(f), Some(r)) if f == id_key && r == sid_key => {}
            (None, None) => {
                return Err(StoreError::NoneMapped {
                    sid: mapping.sid.clone(),
                    id_key,
                });
            }
            (Some(f), _) if f != id_key => {
                // The SID is mapped, but not to the id the caller named.
                return Err(StoreError::NoneMapped {
                    sid: mapping.sid.clone(),
                    id_key,
                });
            }
            _ => {
                return Err(StoreError::Corruption {
                    key: sid_key,
                    detail: "paired records disagree during removal".into(),
                });
            }
        }

        tx.execute("DELETE FROM kv WHERE key = ?1", [&sid_key])?;
        tx.execute("DELETE FROM kv WHERE key = ?1", [&id_key])?;
        tx.commit()?;
        Ok(())
    }

    /// Allocate the next id of `kind` for `sid` and persist the pair.
    ///
    /// Counter read, bounds check, counter bump and both mapping records are
    /// one transaction: a crash either commits the whole allocation or none
    /// of it. Concurrent allocators do not arise; the mapping worker is the
    /// only writer.
    pub fn allocate(&mut self, sid: &Sid, kind: IdKind) -> Result<Mapping, StoreError> {
        let range = self.config.range(kind);
        let sid_key = sid.to_string();

        let tx = self.conn.transaction()?;

        let existing: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [&sid_key], |row| row.get(0))
            .optional()?;
        if let Some(existing) = existing {
            return Err(StoreError::AlreadyMapped {
                sid: sid.clone(),
                existing,
            });
        }

        let raw: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [kind.hwm_key()], |row| {
                row.get(0)
            })
            .optional()?;
        let raw = raw.ok_or_else(|| StoreError::Corruption {
            key: kind.hwm_key().to_string(),
            detail: "high water mark record missing".into(),
        })?;
        let hwm = parse_counter(kind.hwm_key(), &raw)?;

        if hwm > range.high {
            // Transaction rolls back on drop; the counter stays put.
            return Err(StoreError::AllocationExhausted {
                kind,
                ceiling: range.high,
            });
        }

        let id = hwm;
        let id_key = format!("{} {}", kind.key_prefix(), id);

        tx.execute(
            "UPDATE kv SET value = ?2 WHERE key = ?1",
            params![kind.hwm_key(), (hwm + 1).to_string()],
        )?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)",
            params![sid_key, id_key],
        )?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)",
            params![id_key, sid_key],
        )?;
        tx.commit()?;

        info!(sid = %sid, kind = %kind, id, "allocated new mapping");
        Ok(Mapping::new(sid.clone(), kind, id))
    }

    /// Number of mapping records (both directions counted once).
    pub fn mapping_count(&self) -> Result<u64, StoreError> {
        let count: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE key LIKE 'S-%'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        upgrade::version(&self.conn)
    }
}

fn parse_counter(key: &str, raw: &str) -> Result<u32, StoreError> {
    raw.parse().map_err(|_| StoreError::BadRecord {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Parse `"UID 10005"` / `"GID 10005"` into (kind, id).
fn parse_id_key(owner: &str, raw: &str) -> Result<(IdKind, u32), StoreError> {
    let bad = || StoreError::BadRecord {
        key: owner.to_string(),
        value: raw.to_string(),
    };
    let (prefix, num) = raw.split_once(' ').ok_or_else(bad)?;
    let kind = match prefix {
        "UID" => IdKind::Uid,
        "GID" => IdKind::Gid,
        _ => return Err(bad()),
    };
    let id: u32 = num.parse().map_err(|_| bad())?;
    Ok((kind, id))
}

pub(crate) fn raw_get(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    let value = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

#[cfg(test)]
pub(crate) fn raw_put(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdmapStore {
        IdmapStore::open_in_memory(IdmapConfig::default()).unwrap()
    }

    fn sid(n: u32) -> Sid {
        Sid::parse(&format!("S-1-5-21-1-2-3-{n}")).unwrap()
    }

    #[test]
    fn counters_start_at_floor() {
        let store = store();
        assert_eq!(store.high_water_mark(IdKind::Uid).unwrap(), 10_000);
        assert_eq!(store.high_water_mark(IdKind::Gid).unwrap(), 10_000);
    }

    #[test]
    fn allocate_is_monotonic_per_kind() {
        let mut store = store();
        let a = store.allocate(&sid(1000), IdKind::Uid).unwrap();
        let b = store.allocate(&sid(1001), IdKind::Uid).unwrap();
        let g = store.allocate(&sid(1002), IdKind::Gid).unwrap();
        assert!(b.id > a.id);
        assert_eq!(g.id, 10_000); // gid counter is independent
    }

    #[test]
    fn exhaustion_leaves_counter_unchanged() {
        let config = IdmapConfig {
            uid_range: IdRange::new(100, 101),
            ..IdmapConfig::default()
        };
        let mut store = IdmapStore::open_in_memory(config).unwrap();

        store.allocate(&sid(1), IdKind::Uid).unwrap();
        store.allocate(&sid(2), IdKind::Uid).unwrap();
        let err = store.allocate(&sid(3), IdKind::Uid).unwrap_err();
        assert!(matches!(err, StoreError::AllocationExhausted { .. }));
        assert_eq!(store.high_water_mark(IdKind::Uid).unwrap(), 102);

        // Still exhausted; counter still put.
        let err = store.allocate(&sid(4), IdKind::Uid).unwrap_err();
        assert!(matches!(err, StoreError::AllocationExhausted { .. }));
        assert_eq!(store.high_water_mark(IdKind::Uid).unwrap(), 102);
    }

    #[test]
    fn roundtrip_both_directions() {
        let mut store = store();
        let mapping = store.allocate(&sid(1104), IdKind::Uid).unwrap();

        let by_sid = store.lookup_sid(&sid(1104)).unwrap().unwrap();
        let by_id = store.lookup_id(IdKind::Uid, mapping.id).unwrap().unwrap();
        assert_eq!(by_sid, mapping);
        assert_eq!(by_id, mapping);
    }

    #[test]
    fn missing_reverse_is_corruption_not_repair() {
        let mut store = store();
        let mapping = store.allocate(&sid(1104), IdKind::Uid).unwrap();

        // Sabotage: delete only the reverse record.
        store
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", [mapping.id_key()])
            .unwrap();

        let err = store.lookup_sid(&sid(1104)).unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }));

        // The surviving direction was not deleted behind our back.
        let forward = raw_get(&store.conn, &sid(1104).to_string()).unwrap();
        assert!(forward.is_some());
    }

    #[test]
    fn remove_requires_exact_pair() {
        let mut store = store();
        let mapping = store.allocate(&sid(1), IdKind::Uid).unwrap();

        let wrong = Mapping::new(sid(1), IdKind::Uid, mapping.id + 7);
        let err = store.remove_mapping(&wrong).unwrap_err();
        assert!(matches!(err, StoreError::NoneMapped { .. }));
        assert!(store.lookup_sid(&sid(1)).unwrap().is_some());

        store.remove_mapping(&mapping).unwrap();
        assert!(store.lookup_sid(&sid(1)).unwrap().is_none());
        assert!(store.lookup_id(IdKind::Uid, mapping.id).unwrap().is_none());
    }

    #[test]
    fn double_allocate_same_sid_is_rejected() {
        let mut store = store();
        store.allocate(&sid(1), IdKind::Uid).unwrap();
        let err = store.allocate(&sid(1), IdKind::Gid).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyMapped { .. }));
    }
}
