//! Ephemeral id allocation.
//!
//! Ephemeral ids come from the top half of the 32-bit id space. The
//! [`EphemeralAllocator`] hands them out one at a time from blocks reserved
//! with the OS [`IdAuthority`]; uids and gids have independent counters.
//!
//! [`SidHistory`] is the per-batch memory of which SID already received an
//! ephemeral id, so a SID seen twice in one batch (as owner and as group
//! member, say) gets the same id both times.

use std::fmt;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::IdmapError;
use crate::sid::{EPHEMERAL_ID_MIN, Sid};

// =============================================================================
// Identity authority
// =============================================================================

/// Bases of a reserved block. A base is present when the matching count was
/// non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdBlock {
    /// First uid of the block.
    pub uid_base: Option<u32>,
    /// First gid of the block.
    pub gid_base: Option<u32>,
}

/// The OS component that owns the ephemeral range.
///
/// Implementations synchronize internally; the allocator calls them from any
/// worker.
pub trait IdAuthority: Send + Sync + fmt::Debug {
    /// Reserves `uid_count` uids and `gid_count` gids. Fails only when the
    /// range is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::Internal`] when the range is exhausted.
    fn allocate_id_block(&self, uid_count: u32, gid_count: u32) -> Result<IdBlock, IdmapError>;
}

/// An in-process authority handing out consecutive blocks from
/// [`EPHEMERAL_ID_MIN`] upwards.
#[derive(Debug)]
pub struct LocalIdAuthority {
    next: Mutex<(u64, u64)>,
}

impl LocalIdAuthority {
    /// Starts both ranges at [`EPHEMERAL_ID_MIN`].
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(EPHEMERAL_ID_MIN, EPHEMERAL_ID_MIN)
    }

    /// Starts the ranges at explicit bases.
    #[must_use]
    pub const fn starting_at(uid_base: u32, gid_base: u32) -> Self {
        Self {
            next: Mutex::new((uid_base as u64, gid_base as u64)),
        }
    }
}

impl Default for LocalIdAuthority {
    fn default() -> Self {
        Self::new()
    }
}

fn reserve(next: &mut u64, count: u32, kind: &str) -> Result<Option<u32>, IdmapError> {
    if count == 0 {
        return Ok(None);
    }
    let base = *next;
    let end = base + u64::from(count);
    if end > u64::from(u32::MAX) + 1 {
        return Err(IdmapError::internal(format!("ephemeral {kind} range exhausted")));
    }
    *next = end;
    u32::try_from(base)
        .map(Some)
        .map_err(|_| IdmapError::internal(format!("ephemeral {kind} range exhausted")))
}

impl IdAuthority for LocalIdAuthority {
    fn allocate_id_block(&self, uid_count: u32, gid_count: u32) -> Result<IdBlock, IdmapError> {
        let mut next = self
            .next
            .lock()
            .map_err(|_| IdmapError::internal("id authority lock poisoned"))?;
        let (next_uid, next_gid) = &mut *next;
        // Check both before committing either.
        let (mut uid_cursor, mut gid_cursor) = (*next_uid, *next_gid);
        let uid_base = reserve(&mut uid_cursor, uid_count, "uid")?;
        let gid_base = reserve(&mut gid_cursor, gid_count, "gid")?;
        *next_uid = uid_cursor;
        *next_gid = gid_cursor;
        Ok(IdBlock { uid_base, gid_base })
    }
}

// =============================================================================
// Allocator
// =============================================================================

#[derive(Debug, Default)]
struct Range {
    next: u64,
    limit: u64,
}

#[derive(Debug, Default)]
struct Counters {
    uid: Range,
    gid: Range,
}

/// Process-wide ephemeral counters.
#[derive(Debug, Default)]
pub struct EphemeralAllocator {
    counters: Mutex<Counters>,
}

impl EphemeralAllocator {
    /// An allocator with no block reserved yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next free uid (`is_user`) or gid, reserving a new block of
    /// `block_size` ids from `authority` when the current one is used up.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::Internal`] if the authority cannot supply a block or
    /// the counter lock is poisoned.
    pub fn next_id(
        &self,
        authority: &dyn IdAuthority,
        is_user: bool,
        block_size: u32,
    ) -> Result<u32, IdmapError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| IdmapError::internal("ephemeral counter lock poisoned"))?;
        let range = if is_user { &mut counters.uid } else { &mut counters.gid };

        if range.next >= range.limit {
            let block = if is_user {
                authority.allocate_id_block(block_size, 0)?.uid_base
            } else {
                authority.allocate_id_block(0, block_size)?.gid_base
            };
            let base = block.ok_or_else(|| {
                IdmapError::internal("identity authority returned an empty block")
            })?;
            info!(base, block_size, is_user, "reserved ephemeral id block");
            range.next = u64::from(base);
            range.limit = u64::from(base) + u64::from(block_size);
        }

        let id = u32::try_from(range.next)
            .map_err(|_| IdmapError::internal("ephemeral id out of range"))?;
        range.next += 1;
        debug!(id, is_user, "allocated ephemeral id");
        Ok(id)
    }
}

// =============================================================================
// Per-batch SID history
// =============================================================================

/// Jenkins one-at-a-time hash of a SID, reduced to `size` buckets.
#[must_use]
pub fn sid_hash(prefix: &str, rid: u32, size: usize) -> usize {
    let mut h: u32 = 0;
    for &b in prefix.as_bytes().iter().chain(rid.to_le_bytes().iter()) {
        h = h.wrapping_add(u32::from(b));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h = h.wrapping_add(h << 15);
    (h as usize) % size.max(1)
}

#[derive(Debug, Clone, Default)]
struct Slot {
    entry: Option<(Sid, u32)>,
    next: Option<usize>,
}

/// Fixed-size open-addressed table of ephemeral ids issued in one batch.
///
/// Insert scans linearly for a free slot and links it into the chain that
/// starts at the SID's home slot; lookup walks that same chain.
#[derive(Debug, Clone)]
pub struct SidHistory {
    slots: Vec<Slot>,
    len: usize,
}

impl SidHistory {
    /// A table with room for `capacity` SIDs.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity.max(1)],
            len: 0,
        }
    }

    /// Number of recorded SIDs.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The id issued to `sid` in this batch, if any.
    #[must_use]
    pub fn get(&self, sid: &Sid) -> Option<u32> {
        let mut cursor = Some(sid_hash(&sid.prefix, sid.rid, self.slots.len()));
        while let Some(idx) = cursor {
            let slot = &self.slots[idx];
            let (stored, pid) = slot.entry.as_ref()?;
            if stored.rid == sid.rid && stored.prefix == sid.prefix {
                return Some(*pid);
            }
            cursor = slot.next;
        }
        None
    }

    /// Records `pid` for `sid`. Returns `false` when the table is full.
    pub fn insert(&mut self, sid: &Sid, pid: u32) -> bool {
        let size = self.slots.len();
        if self.len == size {
            return false;
        }
        let home = sid_hash(&sid.prefix, sid.rid, size);
        let mut idx = home;
        while self.slots[idx].entry.is_some() {
            idx = (idx + 1) % size;
        }
        self.slots[idx].entry = Some((sid.clone(), pid));
        self.len += 1;
        if idx != home {
            self.slots[idx].next = self.slots[home].next;
            self.slots[home].next = Some(idx);
        }
        true
    }
}
