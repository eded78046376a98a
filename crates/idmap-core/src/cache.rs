//! Identity-mapping and name cache.
//!
//! Rows are never swept. A row past its expiration is treated as absent when
//! read, except for ephemeral ids: those stay valid for plain lookups because
//! the id may still be in use on disk. Only a lookup that is about to do
//! name-based mapping sees an expired ephemeral row as stale.
//!
//! Negative results are never cached.

// SQLite stores ids and rids as i64; they always fit in u32.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::time::Duration;

use rusqlite::{OptionalExtension, Row, params};

use crate::error::{IdmapError, PrincipalType};
use crate::request::{ExpiredEphemeral, RequestFlags};
use crate::sid::{Direction, IdType, Identity, Sid, is_ephemeral};
use crate::store::StoreHandle;

/// Outcome of a windows-to-unix cache lookup that found a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sid2PidLookup {
    /// A usable mapping.
    Mapped {
        /// The cached id.
        id: Identity,
        /// Direction of the cached row.
        direction: Direction,
        /// Cached unix name, if any.
        unixname: Option<String>,
    },
    /// Only an expired ephemeral mapping, and the request may do name-based
    /// mapping; the caller should resolve afresh.
    Expired(ExpiredEphemeral),
}

/// A cached unix-to-windows mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pid2SidHit {
    /// The cached SID.
    pub sid: Sid,
    /// Direction of the cached row.
    pub direction: Direction,
    /// Cached windows name, if any.
    pub winname: Option<String>,
    /// Cached windows domain, if any.
    pub windomain: Option<String>,
}

/// A cached SID-to-name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// Account name.
    pub name: Option<String>,
    /// Domain name.
    pub domain: Option<String>,
    /// Principal type.
    pub principal: PrincipalType,
}

/// One row to write to the mapping cache.
#[derive(Debug, Clone, Copy)]
pub struct MappingRecord<'a> {
    /// Windows side.
    pub sid: &'a Sid,
    /// Windows name, if known.
    pub winname: Option<&'a str>,
    /// Windows domain, if known.
    pub windomain: Option<&'a str>,
    /// POSIX side.
    pub pid: u32,
    /// Unix name, if known.
    pub unixname: Option<&'a str>,
    /// Uid or gid.
    pub is_user: bool,
    /// Direction the mapping was resolved with.
    pub direction: Direction,
}

/// A row of the mapping cache, for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMapping {
    /// Windows side.
    pub sid: Sid,
    /// Windows name.
    pub winname: Option<String>,
    /// Windows domain.
    pub windomain: Option<String>,
    /// POSIX side.
    pub id: Identity,
    /// Unix name.
    pub unixname: Option<String>,
    /// Which directions are currently valid.
    pub direction: Direction,
    /// Unix time after which the row is stale; `None` never expires.
    pub expiration: Option<i64>,
}

/// Lifetimes applied when writing.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtl {
    /// Identity mapping rows.
    pub mapping: Duration,
    /// Name cache rows.
    pub name: Duration,
}

#[allow(clippy::cast_possible_wrap)]
fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(ttl.as_secs() as i64)
}

fn flag(value: Option<i64>) -> bool {
    value.is_some_and(|v| v != 0)
}

// =============================================================================
// Reads
// =============================================================================

/// Looks up the cached id for `sid`.
///
/// # Errors
///
/// Fails with [`IdmapError::NotFound`] when there is no usable row, and with
/// [`IdmapError::TypeMismatch`] when the cached id is of the wrong kind.
pub fn lookup_sid2pid(
    store: &mut StoreHandle,
    sid: &Sid,
    target: IdType,
    flags: RequestFlags,
    now: i64,
) -> Result<Sid2PidLookup, IdmapError> {
    type Row5 = (Option<i64>, Option<i64>, Option<i64>, Option<String>, Option<i64>);
    let row: Option<Row5> = store.with_retry(|conn| {
        conn.query_row(
            "SELECT pid, is_user, expiration, unixname, u2w FROM idmap_cache \
             WHERE sidprefix = ?1 AND rid = ?2 AND w2u = 1 AND \
             (pid >= 2147483648 OR expiration = 0 OR expiration IS NULL OR expiration > ?3)",
            params![sid.prefix, sid.rid, now],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
    })?;
    let Some((pid, is_user, expiration, unixname, u2w)) = row else {
        return Err(IdmapError::NotFound);
    };
    let (Some(pid), Some(is_user)) = (pid, is_user) else {
        return Err(IdmapError::CacheCorrupt(format!("mapping row for {sid}")));
    };
    let pid = pid as u32;
    let is_user = is_user != 0;

    // Stale ephemeral row: kept for reuse, but resolve again unless the caller
    // asked for lookups only.
    if !flags.lookup_only()
        && is_ephemeral(pid)
        && expiration.is_some_and(|exp| exp != 0 && exp <= now)
    {
        return Ok(Sid2PidLookup::Expired(ExpiredEphemeral { pid, is_user }));
    }

    let kind = target.resolve_kind(PrincipalType::from_is_user(is_user))?;
    Ok(Sid2PidLookup::Mapped {
        id: Identity::posix(pid, kind == IdType::Uid),
        direction: Direction::from_w2u(flag(u2w)),
        unixname,
    })
}

/// Looks up the cached SID for a uid (`is_user`) or gid.
///
/// # Errors
///
/// [`IdmapError::NotFound`] when there is no usable row, and
/// [`IdmapError::Internal`] when the store fails.
pub fn lookup_pid2sid(
    store: &mut StoreHandle,
    pid: u32,
    is_user: bool,
    now: i64,
) -> Result<Pid2SidHit, IdmapError> {
    type Row5 = (Option<String>, Option<i64>, Option<String>, Option<String>, Option<i64>);
    let row: Option<Row5> = store.with_retry(|conn| {
        conn.query_row(
            "SELECT sidprefix, rid, winname, windomain, w2u FROM idmap_cache \
             WHERE pid = ?1 AND u2w = 1 AND is_user = ?2 AND \
             (pid >= 2147483648 OR expiration = 0 OR expiration IS NULL OR expiration > ?3)",
            params![pid, is_user, now],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
    })?;
    let Some((prefix, rid, winname, windomain, w2u)) = row else {
        return Err(IdmapError::NotFound);
    };
    let (Some(prefix), Some(rid)) = (prefix, rid) else {
        return Err(IdmapError::CacheCorrupt(format!("mapping row for pid {pid}")));
    };
    Ok(Pid2SidHit {
        sid: Sid::new(prefix, rid as u32),
        direction: Direction::from_u2w(flag(w2u)),
        winname,
        windomain,
    })
}

/// Looks up the cached name of `sid`.
///
/// # Errors
///
/// [`IdmapError::NotFound`] when there is no usable row, and
/// [`IdmapError::CacheCorrupt`] when the row has no principal type.
pub fn lookup_sid2name(
    store: &mut StoreHandle,
    sid: &Sid,
    now: i64,
) -> Result<NameEntry, IdmapError> {
    type Row3 = (Option<String>, Option<String>, Option<i64>);
    let row: Option<Row3> = store.with_retry(|conn| {
        conn.query_row(
            "SELECT name, domain, type FROM name_cache \
             WHERE sidprefix = ?1 AND rid = ?2 AND \
             (expiration = 0 OR expiration IS NULL OR expiration > ?3)",
            params![sid.prefix, sid.rid, now],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    })?;
    let Some((name, domain, ty)) = row else {
        return Err(IdmapError::NotFound);
    };
    let ty = ty.ok_or_else(|| IdmapError::CacheCorrupt(format!("name row for {sid}")))?;
    Ok(NameEntry {
        name,
        domain,
        principal: PrincipalType::from_code(ty),
    })
}

/// Looks up the cached SID of `name@domain`. Names compare case-insensitively.
///
/// # Errors
///
/// [`IdmapError::NotFound`] when there is no usable row, and
/// [`IdmapError::Internal`] when the store fails.
pub fn lookup_name2sid(
    store: &mut StoreHandle,
    name: &str,
    domain: &str,
    now: i64,
) -> Result<(Sid, PrincipalType), IdmapError> {
    type Row3 = (Option<String>, Option<i64>, Option<i64>);
    let row: Option<Row3> = store.with_retry(|conn| {
        conn.query_row(
            "SELECT sidprefix, rid, type FROM name_cache \
             WHERE name = ?1 COLLATE NOCASE AND domain = ?2 COLLATE NOCASE AND \
             (expiration = 0 OR expiration IS NULL OR expiration > ?3)",
            params![name, domain, now],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    })?;
    let Some((prefix, rid, ty)) = row else {
        return Err(IdmapError::NotFound);
    };
    match (prefix, rid, ty) {
        (Some(prefix), Some(rid), Some(ty)) => {
            Ok((Sid::new(prefix, rid as u32), PrincipalType::from_code(ty)))
        },
        _ => Err(IdmapError::CacheCorrupt(format!("name row for {name}@{domain}"))),
    }
}

// =============================================================================
// Writes
// =============================================================================

/// Records a windows-to-unix resolution.
///
/// When `stale` is set and the new id is not ephemeral, the stale ephemeral
/// row loses its `w2u` validity first. The name cache is written only when
/// `learned_name` is set and the record has a windows name.
///
/// # Errors
///
/// [`IdmapError::Internal`] when the write fails; nothing is recorded then.
pub fn store_sid2pid(
    store: &mut StoreHandle,
    record: &MappingRecord<'_>,
    stale: Option<ExpiredEphemeral>,
    learned_name: bool,
    now: i64,
    ttl: CacheTtl,
) -> Result<(), IdmapError> {
    let u2w: Option<i64> = (record.direction == Direction::Bidirectional).then_some(1);
    store.with_retry(|conn| {
        let tx = conn.transaction()?;
        if let Some(stale) = stale {
            if !is_ephemeral(record.pid) {
                // NULL rather than 0 so several invalidated rows can coexist
                // under the (sidprefix, rid, w2u) index.
                tx.execute(
                    "UPDATE idmap_cache SET w2u = NULL \
                     WHERE sidprefix = ?1 AND rid = ?2 AND w2u = 1 AND \
                     pid >= 2147483648 AND is_user = ?3",
                    params![record.sid.prefix, record.sid.rid, stale.is_user],
                )?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO idmap_cache \
             (sidprefix, rid, windomain, winname, pid, unixname, is_user, expiration, w2u, u2w) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
            params![
                record.sid.prefix,
                record.sid.rid,
                record.windomain,
                record.winname,
                record.pid,
                record.unixname,
                record.is_user,
                expiry(now, ttl.mapping),
                u2w,
            ],
        )?;
        if learned_name {
            if let Some(name) = record.winname {
                insert_name(&tx, record, name, now, ttl)?;
            }
        }
        tx.commit()
    })
}

/// Records a unix-to-windows resolution.
///
/// # Errors
///
/// [`IdmapError::Internal`] when the write fails; nothing is recorded then.
pub fn store_pid2sid(
    store: &mut StoreHandle,
    record: &MappingRecord<'_>,
    learned_name: bool,
    now: i64,
    ttl: CacheTtl,
) -> Result<(), IdmapError> {
    let w2u: Option<i64> = (record.direction == Direction::Bidirectional).then_some(1);
    store.with_retry(|conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO idmap_cache \
             (sidprefix, rid, windomain, winname, pid, unixname, is_user, expiration, w2u, u2w) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
            params![
                record.sid.prefix,
                record.sid.rid,
                record.windomain,
                record.winname,
                record.pid,
                record.unixname,
                record.is_user,
                expiry(now, ttl.mapping),
                w2u,
            ],
        )?;
        if learned_name {
            if let Some(name) = record.winname {
                insert_name(&tx, record, name, now, ttl)?;
            }
        }
        tx.commit()
    })
}

fn insert_name(
    tx: &rusqlite::Transaction<'_>,
    record: &MappingRecord<'_>,
    name: &str,
    now: i64,
    ttl: CacheTtl,
) -> rusqlite::Result<usize> {
    tx.execute(
        "INSERT OR REPLACE INTO name_cache (sidprefix, rid, name, domain, type, expiration) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.sid.prefix,
            record.sid.rid,
            name,
            record.windomain,
            PrincipalType::from_is_user(record.is_user).code(),
            expiry(now, ttl.name),
        ],
    )
}

// =============================================================================
// Listing
// =============================================================================

fn cached_mapping(row: &Row<'_>) -> rusqlite::Result<CachedMapping> {
    let prefix: String = row.get(0)?;
    let rid: i64 = row.get(1)?;
    let pid: i64 = row.get(4)?;
    let is_user: bool = row.get(6)?;
    let w2u = flag(row.get(7)?);
    let u2w = flag(row.get(8)?);
    let direction = match (w2u, u2w) {
        (true, false) => Direction::WinToUnix,
        (false, true) => Direction::UnixToWin,
        _ => Direction::Bidirectional,
    };
    Ok(CachedMapping {
        sid: Sid::new(prefix, rid as u32),
        windomain: row.get(2)?,
        winname: row.get(3)?,
        id: Identity::posix(pid as u32, is_user),
        unixname: row.get(5)?,
        direction,
        expiration: row.get::<_, Option<i64>>(9)?.filter(|&e| e != 0),
    })
}

/// Lists cached mappings that are valid in at least one direction, oldest
/// first. `limit` of `None` lists everything.
///
/// # Errors
///
/// [`IdmapError::Internal`] when the store cannot be read, and
/// [`IdmapError::CacheCorrupt`] for a row with an unusable id.
pub fn list_mappings(
    store: &mut StoreHandle,
    limit: Option<u32>,
) -> Result<Vec<CachedMapping>, IdmapError> {
    let limit = limit.map_or(-1, i64::from);
    store.with_retry(|conn| {
        let mut stmt = conn.prepare(
            "SELECT sidprefix, rid, windomain, winname, pid, unixname, is_user, w2u, u2w, \
             expiration FROM idmap_cache \
             WHERE (w2u = 1 OR u2w = 1) AND sidprefix IS NOT NULL AND rid IS NOT NULL \
             AND pid IS NOT NULL AND is_user IS NOT NULL \
             ORDER BY rowid LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], cached_mapping)?;
        rows.collect()
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::IdmapConfig;
    use crate::store::{StoreKind, init_stores};

    const NOW: i64 = 1_700_000_000;
    const TTL: CacheTtl = CacheTtl {
        mapping: Duration::from_secs(600),
        name: Duration::from_secs(3600),
    };

    fn cache_store(dir: &TempDir) -> StoreHandle {
        let mut config = IdmapConfig::default();
        config.stores.rules_path = dir.path().join("idmap.db");
        config.stores.cache_path = dir.path().join("idmap_cache.db");
        init_stores(&config).expect("init stores");
        StoreHandle::open(
            StoreKind::Cache,
            &config.stores.cache_path,
            config.stores.cache_busy.clone(),
        )
        .expect("open cache")
    }

    fn bob() -> Sid {
        Sid::new("S-1-5-21-1-2-3", 1104)
    }

    fn record(sid: &Sid, pid: u32, direction: Direction) -> MappingRecord<'_> {
        MappingRecord {
            sid,
            winname: Some("bob"),
            windomain: Some("SFBAY"),
            pid,
            unixname: Some("bob"),
            is_user: true,
            direction,
        }
    }

    #[test]
    fn test_sid2pid_roundtrip_and_expiry_boundary() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = cache_store(&dir);
        let sid = bob();
        store_sid2pid(&mut store, &record(&sid, 501, Direction::Bidirectional), None, true, NOW, TTL)
            .expect("store");

        let hit = lookup_sid2pid(&mut store, &sid, IdType::PosixId, RequestFlags::default(), NOW)
            .expect("hit");
        assert_eq!(
            hit,
            Sid2PidLookup::Mapped {
                id: Identity::Uid(501),
                direction: Direction::Bidirectional,
                unixname: Some("bob".to_string()),
            }
        );

        // expiration == now counts as expired.
        let at_expiry = NOW + 600;
        assert_eq!(
            lookup_sid2pid(&mut store, &sid, IdType::Uid, RequestFlags::default(), at_expiry),
            Err(IdmapError::NotFound)
        );
        assert!(
            lookup_sid2pid(&mut store, &sid, IdType::Uid, RequestFlags::default(), at_expiry - 1)
                .is_ok()
        );
    }

    #[test]
    fn test_sid2pid_type_mismatch() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = cache_store(&dir);
        let sid = bob();
        store_sid2pid(&mut store, &record(&sid, 501, Direction::WinToUnix), None, false, NOW, TTL)
            .expect("store");
        assert!(matches!(
            lookup_sid2pid(&mut store, &sid, IdType::Gid, RequestFlags::default(), NOW),
            Err(IdmapError::TypeMismatch { .. })
        ));
        // w2u-only row is invisible to reverse lookups.
        assert_eq!(lookup_pid2sid(&mut store, 501, true, NOW), Err(IdmapError::NotFound));
    }

    #[test]
    fn test_expired_ephemeral_row() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = cache_store(&dir);
        let sid = bob();
        let eph = 2_147_483_700;
        store_sid2pid(&mut store, &record(&sid, eph, Direction::Bidirectional), None, false, NOW, TTL)
            .expect("store");
        let later = NOW + 10_000;

        // Plain lookups still see it.
        let lookup_only = RequestFlags {
            no_new_id_alloc: true,
            no_nameservice: false,
        };
        assert!(matches!(
            lookup_sid2pid(&mut store, &sid, IdType::Uid, lookup_only, later),
            Ok(Sid2PidLookup::Mapped { id: Identity::Uid(pid), .. }) if pid == eph
        ));
        // A full resolution is told to start over.
        assert_eq!(
            lookup_sid2pid(&mut store, &sid, IdType::Uid, RequestFlags::default(), later),
            Ok(Sid2PidLookup::Expired(ExpiredEphemeral { pid: eph, is_user: true }))
        );
        // Reverse direction ignores expiry for ephemeral ids.
        assert_eq!(lookup_pid2sid(&mut store, eph, true, later).expect("hit").sid, sid);

        // Re-resolving to a durable id invalidates the stale row.
        let stale = ExpiredEphemeral { pid: eph, is_user: true };
        store_sid2pid(&mut store, &record(&sid, 501, Direction::Bidirectional), Some(stale), false, later, TTL)
            .expect("store");
        assert!(matches!(
            lookup_sid2pid(&mut store, &sid, IdType::Uid, RequestFlags::default(), later),
            Ok(Sid2PidLookup::Mapped { id: Identity::Uid(501), .. })
        ));
        let listed = list_mappings(&mut store, None).expect("list");
        let stale_row = listed
            .iter()
            .find(|m| m.id == Identity::Uid(eph))
            .expect("stale row still listed for u2w");
        assert_eq!(stale_row.direction, Direction::UnixToWin);
    }

    #[test]
    fn test_name_cache() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = cache_store(&dir);
        let sid = bob();
        store_pid2sid(&mut store, &record(&sid, 501, Direction::Bidirectional), true, NOW, TTL)
            .expect("store");

        let entry = lookup_sid2name(&mut store, &sid, NOW).expect("name");
        assert_eq!(entry.name.as_deref(), Some("bob"));
        assert_eq!(entry.principal, PrincipalType::User);
        assert_eq!(
            lookup_name2sid(&mut store, "BOB", "sfbay", NOW),
            Ok((sid.clone(), PrincipalType::User))
        );
        assert_eq!(
            lookup_name2sid(&mut store, "bob", "sfbay", NOW + 3600),
            Err(IdmapError::NotFound)
        );
    }

    #[test]
    fn test_list_respects_limit() {
        let dir = TempDir::new().expect("tempdir");
        let mut store = cache_store(&dir);
        for rid in 0..5 {
            let sid = Sid::new("S-1-5-21-1-2-3", 2000 + rid);
            store_pid2sid(&mut store, &record(&sid, 600 + rid, Direction::UnixToWin), false, NOW, TTL)
                .expect("store");
        }
        assert_eq!(list_mappings(&mut store, Some(3)).expect("list").len(), 3);
        assert_eq!(list_mappings(&mut store, None).expect("list").len(), 5);
    }
}
