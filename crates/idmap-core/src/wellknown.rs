//! Fixed, OS-defined principals.
//!
//! The table is consulted before any store or directory access. Entries whose
//! pid is `None` are principals that never map to a POSIX id; a lookup that
//! hits one of them ends with [`IdmapError::NoMapping`].

use crate::error::{IdmapError, PrincipalType};
use crate::sid::{Direction, IdType, Identity, Sid};

/// Uid reserved for the "Creator Owner" principal.
pub const CREATOR_OWNER_UID: u32 = 2_147_483_648;
/// Gid reserved for the "Creator Group" principal.
pub const CREATOR_GROUP_GID: u32 = 2_147_483_649;
/// Gid reserved for the "Local System" principal.
pub const LOCAL_SYSTEM_GID: u32 = 2_147_483_650;
/// The `nobody` group.
pub const GID_NOBODY: u32 = 60_001;

/// One row of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownSid {
    /// SID prefix.
    pub prefix: &'static str,
    /// Relative identifier.
    pub rid: u32,
    /// Fixed windows name.
    pub name: &'static str,
    /// User or group.
    pub is_user: bool,
    /// Fixed POSIX id, or `None` for principals that are never mapped.
    pub pid: Option<u32>,
    /// Which lookups this entry answers.
    pub direction: Direction,
}

impl WellKnownSid {
    const fn unmapped(prefix: &'static str, rid: u32, name: &'static str, is_user: bool) -> Self {
        Self {
            prefix,
            rid,
            name,
            is_user,
            pid: None,
            direction: Direction::Bidirectional,
        }
    }

    const fn mapped(
        prefix: &'static str,
        rid: u32,
        name: &'static str,
        is_user: bool,
        pid: u32,
    ) -> Self {
        Self {
            prefix,
            rid,
            name,
            is_user,
            pid: Some(pid),
            direction: Direction::Bidirectional,
        }
    }

    /// The entry's SID.
    #[must_use]
    pub fn sid(&self) -> Sid {
        Sid::new(self.prefix, self.rid)
    }

    /// The entry's principal type.
    #[must_use]
    pub const fn principal_type(&self) -> PrincipalType {
        PrincipalType::from_is_user(self.is_user)
    }

    fn matches_sid(&self, sid: &Sid) -> bool {
        self.rid == sid.rid && self.prefix.eq_ignore_ascii_case(&sid.prefix)
    }
}

/// The table, in lookup order.
pub static WELL_KNOWN_SIDS: [WellKnownSid; 26] = [
    WellKnownSid::unmapped("S-1-1", 0, "Everyone", false),
    WellKnownSid::mapped("S-1-3", 0, "Creator Owner", true, CREATOR_OWNER_UID),
    WellKnownSid::mapped("S-1-3", 1, "Creator Group", false, CREATOR_GROUP_GID),
    WellKnownSid::unmapped("S-1-3", 2, "Creator Owner Server", true),
    WellKnownSid::unmapped("S-1-3", 3, "Creator Group Server", false),
    WellKnownSid::unmapped("S-1-5", 1, "Dialup", false),
    WellKnownSid::unmapped("S-1-5", 2, "Network", false),
    WellKnownSid::unmapped("S-1-5", 3, "Batch", false),
    WellKnownSid::unmapped("S-1-5", 4, "Interactive", false),
    WellKnownSid::unmapped("S-1-5", 6, "Service", false),
    WellKnownSid::mapped("S-1-5", 7, "Anonymous Logon", false, GID_NOBODY),
    WellKnownSid::unmapped("S-1-5", 8, "Proxy", false),
    WellKnownSid::unmapped("S-1-5", 9, "Enterprise Domain Controllers", false),
    WellKnownSid::unmapped("S-1-5", 10, "Self", false),
    WellKnownSid::unmapped("S-1-5", 11, "Authenticated Users", false),
    WellKnownSid::unmapped("S-1-5", 12, "Restricted Code", false),
    WellKnownSid::unmapped("S-1-5", 13, "Terminal Server User", false),
    WellKnownSid::unmapped("S-1-5", 14, "Remote Interactive Logon", false),
    WellKnownSid::unmapped("S-1-5", 15, "This Organization", false),
    WellKnownSid::mapped("S-1-5", 18, "Local System", false, LOCAL_SYSTEM_GID),
    WellKnownSid::unmapped("S-1-5", 19, "Local Service", false),
    WellKnownSid::unmapped("S-1-5", 20, "Network Service", false),
    WellKnownSid::unmapped("S-1-5", 1000, "Other Organization", false),
    WellKnownSid::unmapped("S-1-5-64", 21, "Digest Authentication", false),
    WellKnownSid::unmapped("S-1-5-64", 10, "NTLM Authentication", false),
    WellKnownSid::unmapped("S-1-5-64", 14, "SChannel Authentication", false),
];

/// Windows to unix lookup.
///
/// Returns [`IdmapError::NotFound`] when no entry answers, including entries
/// of the wrong kind or restricted to the other direction, so the caller can
/// fall through to the cache.
///
/// # Errors
///
/// [`IdmapError::NoMapping`] for principals that are never mapped,
/// [`IdmapError::UnsupportedType`] for a SID target and
/// [`IdmapError::NotFound`] when no entry answers.
pub fn lookup_sid2pid(sid: &Sid, target: IdType) -> Result<(Identity, Direction), IdmapError> {
    sid2pid_in(&WELL_KNOWN_SIDS, sid, target)
}

fn sid2pid_in(
    table: &[WellKnownSid],
    sid: &Sid,
    target: IdType,
) -> Result<(Identity, Direction), IdmapError> {
    for entry in table.iter().filter(|e| e.matches_sid(sid)) {
        let Some(pid) = entry.pid else {
            return Err(IdmapError::NoMapping);
        };
        if !entry.direction.allows_w2u() {
            continue;
        }
        match target {
            IdType::Uid if !entry.is_user => continue,
            IdType::Gid if entry.is_user => continue,
            IdType::Uid | IdType::Gid | IdType::PosixId => {
                return Ok((Identity::posix(pid, entry.is_user), entry.direction));
            },
            IdType::Sid => return Err(IdmapError::UnsupportedType),
        }
    }
    Err(IdmapError::NotFound)
}

/// Unix to windows lookup.
///
/// # Errors
///
/// [`IdmapError::NotFound`] when no entry answers for `pid`.
pub fn lookup_pid2sid(pid: u32, is_user: bool) -> Result<(Sid, Direction), IdmapError> {
    pid2sid_in(&WELL_KNOWN_SIDS, pid, is_user)
}

fn pid2sid_in(
    table: &[WellKnownSid],
    pid: u32,
    is_user: bool,
) -> Result<(Sid, Direction), IdmapError> {
    table
        .iter()
        .find(|e| e.pid == Some(pid) && e.is_user == is_user && e.direction.allows_u2w())
        .map(|e| (e.sid(), e.direction))
        .ok_or(IdmapError::NotFound)
}

/// Fixed name and type of a well-known SID.
#[must_use]
pub fn lookup_sid2name(sid: &Sid) -> Option<(&'static str, PrincipalType)> {
    WELL_KNOWN_SIDS
        .iter()
        .find(|e| e.matches_sid(sid))
        .map(|e| (e.name, e.principal_type()))
}

/// Well-known SID for a windows name, compared case-insensitively.
#[must_use]
pub fn lookup_name2sid(name: &str) -> Option<&'static WellKnownSid> {
    WELL_KNOWN_SIDS.iter().find(|e| e.name.eq_ignore_ascii_case(name))
}
