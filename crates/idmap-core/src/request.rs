//! Mapping requests, their per-request pipeline state, and results.

use serde::{Deserialize, Serialize};

use crate::error::{IdmapError, PrincipalType};
use crate::sid::{Direction, IdType, Identity, Sid};

/// The identity a request starts from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// Resolve a windows SID to a POSIX id.
    Sid(Sid),
    /// Resolve a POSIX user id to a SID.
    Uid(u32),
    /// Resolve a POSIX group id to a SID.
    Gid(u32),
}

/// Caller options for a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFlags {
    /// Never allocate a new ephemeral id for this request.
    #[serde(default)]
    pub no_new_id_alloc: bool,
    /// Never consult the name service or directory for this request.
    #[serde(default)]
    pub no_nameservice: bool,
}

impl RequestFlags {
    /// True when the caller only wants what is already known.
    #[must_use]
    pub const fn lookup_only(self) -> bool {
        self.no_new_id_alloc || self.no_nameservice
    }
}

/// An ephemeral id found in the cache past its expiration.
///
/// It is reused if the request ends up allocating an ephemeral id again, and
/// its cache row is invalidated if the request resolves to a durable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredEphemeral {
    /// The stale id.
    pub pid: u32,
    /// Whether it is a uid.
    pub is_user: bool,
}

/// Progress of a request through the resolution pipeline.
///
/// This is an accumulating set of facts, kept separate from the mapping
/// [`Direction`] that ends up in the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineState {
    /// Nothing further to do; the second pass and cache update skip it.
    pub done: bool,
    /// Staged for the batched directory query.
    pub needs_directory: bool,
    /// The source name came from a local source (caller, well-known table or
    /// name cache), so it must not be written back to the name cache.
    pub name_from_cache: bool,
    /// Principal type of the source, once known.
    pub principal: Option<PrincipalType>,
    /// An expired ephemeral id was found for this SID.
    pub expired_ephemeral: Option<ExpiredEphemeral>,
}

/// One resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    /// Identity to resolve.
    pub source: SourceId,
    /// Identity type wanted back.
    pub target: IdType,
    /// Caller options.
    pub flags: RequestFlags,
    /// Name of the source principal, if known.
    pub source_name: Option<String>,
    /// Domain of the source principal, if known.
    pub source_domain: Option<String>,
    /// Name of the target principal, filled in during resolution.
    pub target_name: Option<String>,
    /// Domain of the target principal, filled in during resolution.
    pub target_domain: Option<String>,
    /// Pipeline progress; reset at the start of each resolution.
    pub state: PipelineState,
}

impl MappingRequest {
    /// Creates a request with no names attached.
    #[must_use]
    pub const fn new(source: SourceId, target: IdType) -> Self {
        Self {
            source,
            target,
            flags: RequestFlags {
                no_new_id_alloc: false,
                no_nameservice: false,
            },
            source_name: None,
            source_domain: None,
            target_name: None,
            target_domain: None,
            state: PipelineState {
                done: false,
                needs_directory: false,
                name_from_cache: false,
                principal: None,
                expired_ephemeral: None,
            },
        }
    }

    /// SID to uid.
    #[must_use]
    pub const fn sid_to_uid(sid: Sid) -> Self {
        Self::new(SourceId::Sid(sid), IdType::Uid)
    }

    /// SID to gid.
    #[must_use]
    pub const fn sid_to_gid(sid: Sid) -> Self {
        Self::new(SourceId::Sid(sid), IdType::Gid)
    }

    /// SID to whichever POSIX id kind fits.
    #[must_use]
    pub const fn sid_to_pid(sid: Sid) -> Self {
        Self::new(SourceId::Sid(sid), IdType::PosixId)
    }

    /// Uid to SID.
    #[must_use]
    pub const fn uid_to_sid(uid: u32) -> Self {
        Self::new(SourceId::Uid(uid), IdType::Sid)
    }

    /// Gid to SID.
    #[must_use]
    pub const fn gid_to_sid(gid: u32) -> Self {
        Self::new(SourceId::Gid(gid), IdType::Sid)
    }

    /// Sets caller flags (builder pattern).
    #[must_use]
    pub const fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Attaches an already known source name and domain (builder pattern).
    #[must_use]
    pub fn with_source_name(mut self, name: impl Into<String>, domain: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self.source_domain = Some(domain.into());
        self
    }

    /// The source SID, for windows-to-unix requests.
    #[must_use]
    pub const fn source_sid(&self) -> Option<&Sid> {
        match &self.source {
            SourceId::Sid(sid) => Some(sid),
            SourceId::Uid(_) | SourceId::Gid(_) => None,
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingResult {
    /// The resolved identity.
    ///
    /// A failed unix-to-windows request may still carry a synthesized local
    /// SID here as a fallback; check [`Self::status`] first.
    pub id: Option<Identity>,
    /// Which way the mapping is authoritative.
    pub direction: Direction,
    /// Per-request status.
    pub status: Result<(), IdmapError>,
}

impl MappingResult {
    /// A pending result with no identity yet.
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            id: None,
            direction: Direction::Bidirectional,
            status: Ok(()),
        }
    }

    /// A failed result.
    #[must_use]
    pub const fn failed(err: IdmapError) -> Self {
        Self {
            id: None,
            direction: Direction::Bidirectional,
            status: Err(err),
        }
    }

    /// A successful result.
    #[must_use]
    pub const fn mapped(id: Identity, direction: Direction) -> Self {
        Self {
            id: Some(id),
            direction,
            status: Ok(()),
        }
    }

    /// The identity if and only if the status is a success.
    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        match (&self.status, &self.id) {
            (Ok(()), Some(id)) => Some(id),
            _ => None,
        }
    }

    /// Whether the request resolved successfully.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}
