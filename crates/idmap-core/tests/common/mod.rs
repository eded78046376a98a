//! In-memory collaborators and a temp-dir harness shared by the integration
//! tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use idmap_core::{
    Clock, DirectoryAnswer, DirectoryQuery, DirectoryReply, DirectoryService, IdAuthority,
    IdBlock, IdmapConfig, IdmapContext, IdmapError, LocalIdAuthority, NameService, PrincipalType,
    Sid, WorkerStores, init_stores,
};
use tempfile::TempDir;

pub const T0: u64 = 1_700_000_000;
pub const DOMAIN_PREFIX: &str = "S-1-5-21-1-2-3";
pub const MACHINE_SID: &str = "S-1-5-21-10-20-30";
/// First id the test authority hands out.
pub const EPHEMERAL_BASE: u32 = (1 << 31) + 100;

// ============================================================================
// Name service
// ============================================================================

/// Fixed passwd and group tables.
#[derive(Debug, Default)]
pub struct StaticNames {
    users: HashMap<String, u32>,
    groups: HashMap<String, u32>,
}

impl StaticNames {
    pub fn with_user(mut self, name: &str, uid: u32) -> Self {
        self.users.insert(name.to_string(), uid);
        self
    }

    pub fn with_group(mut self, name: &str, gid: u32) -> Self {
        self.groups.insert(name.to_string(), gid);
        self
    }

    fn table(&self, is_user: bool) -> &HashMap<String, u32> {
        if is_user { &self.users } else { &self.groups }
    }
}

impl NameService for StaticNames {
    fn lookup_by_name(&self, is_user: bool, name: &str) -> Result<u32, IdmapError> {
        self.table(is_user).get(name).copied().ok_or(IdmapError::NotFound)
    }

    fn lookup_by_id(&self, is_user: bool, id: u32) -> Result<String, IdmapError> {
        self.table(is_user)
            .iter()
            .find(|&(_, &v)| v == id)
            .map(|(k, _)| k.clone())
            .ok_or(IdmapError::NotFound)
    }
}

// ============================================================================
// Directory
// ============================================================================

/// A directory with a fixed set of principals that records every call.
#[derive(Debug, Default)]
pub struct ScriptedDirectory {
    entries: Vec<DirectoryAnswer>,
    transient_failures: AtomicUsize,
    calls: Mutex<Vec<Vec<DirectoryQuery>>>,
}

impl ScriptedDirectory {
    pub fn with_principal(mut self, rid: u32, name: &str, principal: PrincipalType) -> Self {
        self.entries.push(DirectoryAnswer {
            sid: Sid::new(DOMAIN_PREFIX, rid),
            name: name.to_string(),
            domain: "SFBAY".to_string(),
            principal,
        });
        self
    }

    /// Fails the next `n` calls as a whole with a transient error.
    pub fn failing_first(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }

    pub fn calls(&self) -> Vec<Vec<DirectoryQuery>> {
        self.calls.lock().expect("lock").clone()
    }

    fn answer(&self, query: &DirectoryQuery) -> DirectoryReply {
        let found = match query {
            DirectoryQuery::SidToName(sid) => self.entries.iter().find(|e| &e.sid == sid),
            DirectoryQuery::NameToSid { name, domain } => self.entries.iter().find(|e| {
                e.name.eq_ignore_ascii_case(name) && e.domain.eq_ignore_ascii_case(domain)
            }),
        };
        found.cloned().ok_or(IdmapError::NotFound)
    }
}

impl DirectoryService for ScriptedDirectory {
    fn submit_batch(&self, queries: &[DirectoryQuery]) -> Result<Vec<DirectoryReply>, IdmapError> {
        self.calls.lock().expect("lock").push(queries.to_vec());
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(IdmapError::RetriableNetwork);
        }
        Ok(queries.iter().map(|q| self.answer(q)).collect())
    }
}

// ============================================================================
// Identity authority and clock
// ============================================================================

/// Counts block reservations.
#[derive(Debug)]
pub struct CountingAuthority {
    inner: LocalIdAuthority,
    pub blocks: AtomicUsize,
}

impl Default for CountingAuthority {
    fn default() -> Self {
        Self {
            inner: LocalIdAuthority::starting_at(EPHEMERAL_BASE, EPHEMERAL_BASE),
            blocks: AtomicUsize::new(0),
        }
    }
}

impl IdAuthority for CountingAuthority {
    fn allocate_id_block(&self, uid_count: u32, gid_count: u32) -> Result<IdBlock, IdmapError> {
        self.blocks.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate_id_block(uid_count, gid_count)
    }
}

/// A clock tests can move forward.
#[derive(Debug)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Engine wired to fakes, with stores in a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub config: IdmapConfig,
    pub ctx: IdmapContext,
    pub stores: WorkerStores,
    pub directory: Arc<ScriptedDirectory>,
    pub authority: Arc<CountingAuthority>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(names: StaticNames, directory: ScriptedDirectory) -> Self {
        Self::with_config(names, directory, |_| {})
    }

    pub fn with_config(
        names: StaticNames,
        directory: ScriptedDirectory,
        tweak: impl FnOnce(&mut IdmapConfig),
    ) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = IdmapConfig {
            mapping_domain: Some("SFBAY".to_string()),
            machine_sid: Some(MACHINE_SID.to_string()),
            ..IdmapConfig::default()
        };
        config.stores.rules_path = dir.path().join("idmap.db");
        config.stores.cache_path = dir.path().join("idmap_cache.db");
        config.ephemeral.block_size = 16;
        tweak(&mut config);
        init_stores(&config).expect("init stores");

        let directory = Arc::new(directory);
        let authority = Arc::new(CountingAuthority::default());
        let clock = Arc::new(ManualClock::new(T0));
        let ctx = IdmapContext::new(config.clone())
            .with_directory(directory.clone())
            .with_name_service(Arc::new(names))
            .with_id_authority(authority.clone())
            .with_clock(clock.clone());
        let stores = WorkerStores::new(&config);
        Self {
            dir,
            config,
            ctx,
            stores,
            directory,
            authority,
            clock,
        }
    }

    pub fn blocks_reserved(&self) -> usize {
        self.authority.blocks.load(Ordering::SeqCst)
    }
}

pub fn domain_sid(rid: u32) -> Sid {
    Sid::new(DOMAIN_PREFIX, rid)
}
