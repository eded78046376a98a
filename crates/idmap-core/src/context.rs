//! Process-wide engine state shared by all workers.
//!
//! [`IdmapContext`] is created once and passed by reference into every
//! resolution call. It holds the configuration behind a reader/writer lock,
//! the ephemeral counters behind their own mutex, and the collaborators the
//! pipeline talks to.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::config::IdmapConfig;
use crate::directory::{DirectoryService, NoDirectory};
use crate::ephemeral::{EphemeralAllocator, IdAuthority, LocalIdAuthority};
use crate::error::IdmapError;
use crate::nameservice::{NameService, SystemNameService};

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time for cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current Unix timestamp in seconds.
    fn now_secs(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    }
}

/// Clock pinned to one timestamp.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    /// The fixed timestamp to return.
    pub timestamp: u64,
}

impl FixedClock {
    /// Creates a clock that always reads `timestamp`.
    #[must_use]
    pub const fn new(timestamp: u64) -> Self {
        Self { timestamp }
    }
}

impl Clock for FixedClock {
    fn now_secs(&self) -> u64 {
        self.timestamp
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared engine state.
#[derive(Debug)]
pub struct IdmapContext {
    config: RwLock<IdmapConfig>,
    allocator: EphemeralAllocator,
    directory: Arc<dyn DirectoryService>,
    names: Arc<dyn NameService>,
    authority: Arc<dyn IdAuthority>,
    clock: Arc<dyn Clock>,
}

impl IdmapContext {
    /// Creates a context with the local collaborators: no directory, the
    /// system passwd/group database, an in-process id authority and the wall
    /// clock.
    #[must_use]
    pub fn new(config: IdmapConfig) -> Self {
        Self {
            config: RwLock::new(config),
            allocator: EphemeralAllocator::new(),
            directory: Arc::new(NoDirectory),
            names: Arc::new(SystemNameService),
            authority: Arc::new(LocalIdAuthority::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the directory service (builder pattern).
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = directory;
        self
    }

    /// Sets the name service (builder pattern).
    #[must_use]
    pub fn with_name_service(mut self, names: Arc<dyn NameService>) -> Self {
        self.names = names;
        self
    }

    /// Sets the id authority (builder pattern).
    #[must_use]
    pub fn with_id_authority(mut self, authority: Arc<dyn IdAuthority>) -> Self {
        self.authority = authority;
        self
    }

    /// Sets the clock (builder pattern).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A copy of the current configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::Internal`] if the configuration lock is poisoned.
    pub fn config(&self) -> Result<IdmapConfig, IdmapError> {
        self.config
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| IdmapError::internal("configuration lock poisoned"))
    }

    /// Validates and installs a new configuration.
    ///
    /// Store locations only take effect for workers created afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::InvalidArgument`] if `config` does not validate, and
    /// [`IdmapError::Internal`] if the configuration lock is poisoned.
    pub fn replace_config(&self, config: IdmapConfig) -> Result<(), IdmapError> {
        config
            .validate()
            .map_err(|e| IdmapError::InvalidArgument(e.to_string()))?;
        let mut guard = self
            .config
            .write()
            .map_err(|_| IdmapError::internal("configuration lock poisoned"))?;
        *guard = config;
        info!("configuration replaced");
        Ok(())
    }

    /// The ephemeral id allocator.
    #[must_use]
    pub const fn allocator(&self) -> &EphemeralAllocator {
        &self.allocator
    }

    /// The directory service.
    #[must_use]
    pub fn directory(&self) -> &dyn DirectoryService {
        self.directory.as_ref()
    }

    /// The local name service.
    #[must_use]
    pub fn names(&self) -> &dyn NameService {
        self.names.as_ref()
    }

    /// The OS identity authority.
    #[must_use]
    pub fn authority(&self) -> &dyn IdAuthority {
        self.authority.as_ref()
    }

    /// Current time as stored in cache rows.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn now(&self) -> i64 {
        self.clock.now_secs() as i64
    }
}
