//! Persistent stores: the name-rule store and the mapping cache store.
//!
//! Each worker owns a [`WorkerStores`] and opens its connections lazily; a
//! connection is never handed to another worker. All statements run through
//! [`StoreHandle::with_retry`], which retries on lock contention according to
//! the store's [`BusyPolicy`]. `SQLite`'s own busy timeout is switched off so the
//! policy is the only thing deciding how long to wait.
//!
//! Schemas are created by [`init_stores`]: the `CREATE ... IF NOT EXISTS`
//! statements run inside one transaction, so a rerun against existing stores
//! leaves them untouched.

pub mod busy;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, error, info, warn};

use self::busy::{BusyDecision, BusyTracker, is_busy};
use crate::config::{BusyPolicy, IdmapConfig};
use crate::error::IdmapError;

const RULES_SCHEMA_SQL: &str = include_str!("rules.sql");
const CACHE_SCHEMA_SQL: &str = include_str!("cache.sql");

/// The two logical stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Administrator name rules. Never deleted automatically.
    Rules,
    /// Mapping and name cache. Safe to rebuild from scratch.
    Cache,
}

impl StoreKind {
    const fn schema(self) -> &'static str {
        match self {
            Self::Rules => RULES_SCHEMA_SQL,
            Self::Cache => CACHE_SCHEMA_SQL,
        }
    }

    /// Table whose presence means the schema exists.
    const fn main_table(self) -> &'static str {
        match self {
            Self::Rules => "namerules",
            Self::Cache => "idmap_cache",
        }
    }

    /// Whether an unreadable store file may be deleted and recreated.
    const fn remove_if_corrupt(self) -> bool {
        matches!(self, Self::Cache)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rules => f.write_str("rules"),
            Self::Cache => f.write_str("cache"),
        }
    }
}

/// Outcome of [`init_stores`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreInitReport {
    /// The rules schema was created by this call.
    pub rules_created: bool,
    /// The cache schema was created by this call. A fresh cache means any
    /// ephemeral ids handed out before are no longer recorded.
    pub cache_created: bool,
}

/// One open store connection with its contention policy.
pub struct StoreHandle {
    kind: StoreKind,
    path: PathBuf,
    conn: Connection,
    policy: BusyPolicy,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StoreHandle {
    /// Opens (creating if needed) the store file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::Internal`] if the file cannot be opened or is not
    /// a database.
    pub fn open(kind: StoreKind, path: &Path, policy: BusyPolicy) -> Result<Self, IdmapError> {
        let conn = open_connection(path).map_err(|e| {
            error!(store = %kind, path = %path.display(), error = %e, "cannot open store");
            IdmapError::from(e)
        })?;
        Ok(Self {
            kind,
            path: path.to_path_buf(),
            conn,
            policy,
        })
    }

    /// Which store this is.
    #[must_use]
    pub const fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Location of the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `op`, retrying it while the store is busy.
    ///
    /// `op` must be safe to re-run from the start: a transaction opened inside
    /// it is rolled back when dropped on the busy error.
    ///
    /// # Errors
    ///
    /// Returns the error of `op` mapped to [`IdmapError`], or
    /// [`IdmapError::Internal`] once the busy policy gives up.
    pub fn with_retry<T, F>(&mut self, mut op: F) -> Result<T, IdmapError>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let store = self.kind.to_string();
        let mut tracker = BusyTracker::new(&store, &self.policy);
        loop {
            match op(&mut self.conn) {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => match tracker.on_busy() {
                    BusyDecision::Retry(delay) => std::thread::sleep(delay),
                    BusyDecision::GiveUp => {
                        return Err(IdmapError::internal(format!("{store} store is busy")));
                    },
                },
                Err(e) => {
                    let err = IdmapError::from(e);
                    if matches!(err, IdmapError::Internal(_)) {
                        error!(store = %store, error = %err, "store statement failed");
                    }
                    return Err(err);
                },
            }
        }
    }

    /// Creates the schema if absent. Returns `true` when it was created.
    fn create_schema(&mut self) -> Result<bool, IdmapError> {
        let kind = self.kind;
        self.with_retry(|conn| {
            let tx = conn.transaction()?;
            let present: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![kind.main_table()],
                |row| row.get(0),
            )?;
            if present {
                debug!(store = %kind, "schema already present");
            }
            tx.execute_batch(kind.schema())?;
            tx.commit()?;
            Ok(!present)
        })
    }
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::ZERO)?;
    // Forces a read of the file header so a non-database file fails here.
    conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))?;
    Ok(conn)
}

/// Opens one store for initialisation, deleting and recreating the file once
/// when the store kind allows it.
fn init_store_instance(
    kind: StoreKind,
    path: &Path,
    policy: &BusyPolicy,
) -> Result<bool, IdmapError> {
    let mut handle = match StoreHandle::open(kind, path, policy.clone()) {
        Ok(handle) => handle,
        Err(e) if kind.remove_if_corrupt() => {
            warn!(store = %kind, path = %path.display(), error = %e, "recreating store");
            match std::fs::remove_file(path) {
                Ok(()) => {},
                Err(io) if io.kind() == std::io::ErrorKind::NotFound => {},
                Err(io) => {
                    return Err(IdmapError::internal(format!(
                        "cannot remove {}: {io}",
                        path.display()
                    )));
                },
            }
            StoreHandle::open(kind, path, policy.clone())?
        },
        Err(e) => return Err(e),
    };

    let created = handle.create_schema()?;
    if created {
        info!(store = %kind, path = %path.display(), "store created");
    }
    Ok(created)
}

/// Creates both store schemas if they are absent.
///
/// The cache store is deleted and recreated once if it cannot be opened; the
/// rules store is never deleted and an open failure is returned.
///
/// # Errors
///
/// Returns [`IdmapError::Internal`] if a store cannot be opened, recreated or
/// have its schema written.
pub fn init_stores(config: &IdmapConfig) -> Result<StoreInitReport, IdmapError> {
    let stores = &config.stores;
    let rules_created = init_store_instance(StoreKind::Rules, &stores.rules_path, &stores.rules_busy)?;
    let cache_created = init_store_instance(StoreKind::Cache, &stores.cache_path, &stores.cache_busy)?;
    Ok(StoreInitReport {
        rules_created,
        cache_created,
    })
}

/// The store connections owned by one worker.
///
/// Connections are opened on first use and closed by [`Self::close`] or on
/// drop.
#[derive(Debug)]
pub struct WorkerStores {
    rules_path: PathBuf,
    cache_path: PathBuf,
    rules_policy: BusyPolicy,
    cache_policy: BusyPolicy,
    rules: Option<StoreHandle>,
    cache: Option<StoreHandle>,
}

impl WorkerStores {
    /// Captures store locations from `config`; opens nothing yet.
    #[must_use]
    pub fn new(config: &IdmapConfig) -> Self {
        Self {
            rules_path: config.stores.rules_path.clone(),
            cache_path: config.stores.cache_path.clone(),
            rules_policy: config.stores.rules_busy.clone(),
            cache_policy: config.stores.cache_busy.clone(),
            rules: None,
            cache: None,
        }
    }

    /// Returns the worker's connection to `kind`, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::Internal`] if the store cannot be opened.
    pub fn acquire(&mut self, kind: StoreKind) -> Result<&mut StoreHandle, IdmapError> {
        let (slot, path, policy) = match kind {
            StoreKind::Rules => (&mut self.rules, &self.rules_path, &self.rules_policy),
            StoreKind::Cache => (&mut self.cache, &self.cache_path, &self.cache_policy),
        };
        if slot.is_none() {
            debug!(store = %kind, path = %path.display(), "opening store for worker");
            *slot = Some(StoreHandle::open(kind, path, policy.clone())?);
        }
        slot.as_mut()
            .ok_or_else(|| IdmapError::internal(format!("{kind} store handle missing")))
    }

    /// Shorthand for `acquire(StoreKind::Rules)`.
    ///
    /// # Errors
    ///
    /// See [`Self::acquire`].
    pub fn rules(&mut self) -> Result<&mut StoreHandle, IdmapError> {
        self.acquire(StoreKind::Rules)
    }

    /// Shorthand for `acquire(StoreKind::Cache)`.
    ///
    /// # Errors
    ///
    /// See [`Self::acquire`].
    pub fn cache(&mut self) -> Result<&mut StoreHandle, IdmapError> {
        self.acquire(StoreKind::Cache)
    }

    /// Both connections at once, rules first.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::Internal`] if either store cannot be opened.
    pub fn pair(&mut self) -> Result<(&mut StoreHandle, &mut StoreHandle), IdmapError> {
        self.acquire(StoreKind::Rules)?;
        self.acquire(StoreKind::Cache)?;
        match (self.rules.as_mut(), self.cache.as_mut()) {
            (Some(rules), Some(cache)) => Ok((rules, cache)),
            _ => Err(IdmapError::internal("store handle missing")),
        }
    }

    /// Whether the connection to `kind` is currently open.
    #[must_use]
    pub const fn is_open(&self, kind: StoreKind) -> bool {
        match kind {
            StoreKind::Rules => self.rules.is_some(),
            StoreKind::Cache => self.cache.is_some(),
        }
    }

    /// Closes both connections.
    pub fn close(mut self) {
        for handle in [self.rules.take(), self.cache.take()].into_iter().flatten() {
            let kind = handle.kind;
            if let Err((_, e)) = handle.conn.close() {
                warn!(store = %kind, error = %e, "error closing store");
            }
        }
    }
}
