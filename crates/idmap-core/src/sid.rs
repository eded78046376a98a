//! Identity value types: SIDs, POSIX ids, id types and mapping directions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IdmapError, PrincipalType};

/// Lowest POSIX id that belongs to the ephemeral range.
pub const EPHEMERAL_ID_MIN: u32 = 1 << 31;

/// Returns `true` if `pid` lies in the ephemeral range.
#[must_use]
pub const fn is_ephemeral(pid: u32) -> bool {
    pid >= EPHEMERAL_ID_MIN
}

/// A security identifier split into its domain/authority prefix and the
/// trailing relative identifier.
///
/// `S-1-5-21-1-2-3-1104` is held as prefix `S-1-5-21-1-2-3`, rid `1104`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid {
    /// Everything up to, not including, the last sub-authority.
    pub prefix: String,
    /// Relative identifier.
    pub rid: u32,
}

impl Sid {
    /// Creates a SID from its parts.
    pub fn new(prefix: impl Into<String>, rid: u32) -> Self {
        Self {
            prefix: prefix.into(),
            rid,
        }
    }

    /// Checks that the prefix is usable as a lookup key.
    ///
    /// # Errors
    ///
    /// Returns [`IdmapError::MalformedSid`] for an empty prefix.
    pub fn validate(&self) -> Result<(), IdmapError> {
        if self.prefix.is_empty() {
            return Err(IdmapError::MalformedSid("empty SID prefix".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.rid)
    }
}

impl FromStr for Sid {
    type Err = IdmapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || IdmapError::MalformedSid(s.to_string());

        let rest = s
            .strip_prefix("S-")
            .or_else(|| s.strip_prefix("s-"))
            .ok_or_else(malformed)?;
        // Revision and authority at least, then the rid.
        let parts: Vec<&str> = rest.split('-').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(malformed());
        }
        if parts.iter().any(|p| p.parse::<u64>().is_err()) {
            return Err(malformed());
        }
        let (prefix, rid) = s.rsplit_once('-').ok_or_else(malformed)?;
        let rid = rid.parse::<u32>().map_err(|_| malformed())?;
        Ok(Self::new(prefix, rid))
    }
}

/// The identity type a caller wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    /// A POSIX user id.
    Uid,
    /// A POSIX group id.
    Gid,
    /// Either a uid or a gid, whichever the principal turns out to be.
    PosixId,
    /// A windows SID.
    Sid,
}

impl IdType {
    /// `Some(true)` for uid, `Some(false)` for gid, `None` otherwise.
    #[must_use]
    pub const fn is_user(self) -> Option<bool> {
        match self {
            Self::Uid => Some(true),
            Self::Gid => Some(false),
            Self::PosixId | Self::Sid => None,
        }
    }

    /// Narrows a target type to the concrete kind of a principal.
    ///
    /// `PosixId` becomes uid or gid; a uid/gid request for the wrong kind is
    /// a [`IdmapError::TypeMismatch`].
    ///
    /// # Errors
    ///
    /// [`IdmapError::TypeMismatch`] for the wrong kind,
    /// [`IdmapError::MalformedSid`] for a principal that is neither user nor
    /// group and [`IdmapError::UnsupportedType`] for a SID target.
    pub fn resolve_kind(self, found: PrincipalType) -> Result<Self, IdmapError> {
        match (self, found) {
            (Self::Uid, PrincipalType::User) | (Self::PosixId, PrincipalType::User) => {
                Ok(Self::Uid)
            },
            (Self::Gid, PrincipalType::Group) | (Self::PosixId, PrincipalType::Group) => {
                Ok(Self::Gid)
            },
            (Self::Uid, other) => Err(IdmapError::TypeMismatch {
                expected: PrincipalType::User,
                found: other,
            }),
            (Self::Gid, other) => Err(IdmapError::TypeMismatch {
                expected: PrincipalType::Group,
                found: other,
            }),
            (Self::PosixId, PrincipalType::Other) => Err(IdmapError::MalformedSid(
                "principal is neither a user nor a group".to_string(),
            )),
            (Self::Sid, _) => Err(IdmapError::UnsupportedType),
        }
    }
}

/// A resolved identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    /// POSIX user id.
    Uid(u32),
    /// POSIX group id.
    Gid(u32),
    /// Windows SID.
    Sid(Sid),
}

impl Identity {
    /// A POSIX id of the given kind.
    #[must_use]
    pub const fn posix(pid: u32, is_user: bool) -> Self {
        if is_user { Self::Uid(pid) } else { Self::Gid(pid) }
    }

    /// The numeric id for uid/gid identities.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        match self {
            Self::Uid(pid) | Self::Gid(pid) => Some(*pid),
            Self::Sid(_) => None,
        }
    }

    /// The SID for SID identities.
    #[must_use]
    pub const fn sid(&self) -> Option<&Sid> {
        match self {
            Self::Sid(sid) => Some(sid),
            Self::Uid(_) | Self::Gid(_) => None,
        }
    }

    /// `Some(true)` for uid, `Some(false)` for gid.
    #[must_use]
    pub const fn is_user(&self) -> Option<bool> {
        match self {
            Self::Uid(_) => Some(true),
            Self::Gid(_) => Some(false),
            Self::Sid(_) => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uid(uid) => write!(f, "uid:{uid}"),
            Self::Gid(gid) => write!(f, "gid:{gid}"),
            Self::Sid(sid) => write!(f, "sid:{sid}"),
        }
    }
}

/// Which way a mapping is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Valid both ways.
    Bidirectional,
    /// Valid only for windows to unix lookups.
    WinToUnix,
    /// Valid only for unix to windows lookups.
    UnixToWin,
}

impl Direction {
    /// Direction of a mapping found while resolving windows to unix, given
    /// whether the reverse leg is also valid.
    #[must_use]
    pub const fn from_w2u(reverse_valid: bool) -> Self {
        if reverse_valid { Self::Bidirectional } else { Self::WinToUnix }
    }

    /// Direction of a mapping found while resolving unix to windows, given
    /// whether the reverse leg is also valid.
    #[must_use]
    pub const fn from_u2w(reverse_valid: bool) -> Self {
        if reverse_valid { Self::Bidirectional } else { Self::UnixToWin }
    }

    /// Whether windows-to-unix lookups may use this mapping.
    #[must_use]
    pub const fn allows_w2u(self) -> bool {
        !matches!(self, Self::UnixToWin)
    }

    /// Whether unix-to-windows lookups may use this mapping.
    #[must_use]
    pub const fn allows_u2w(self) -> bool {
        !matches!(self, Self::WinToUnix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain_sid() {
        let sid: Sid = "S-1-5-21-3623811015-3361044348-30300820-1013"
            .parse()
            .expect("valid sid");
        assert_eq!(sid.prefix, "S-1-5-21-3623811015-3361044348-30300820");
        assert_eq!(sid.rid, 1013);
        assert_eq!(sid.to_string(), "S-1-5-21-3623811015-3361044348-30300820-1013");
    }

    #[test]
    fn test_parse_well_known_sid() {
        let sid: Sid = "S-1-1-0".parse().expect("valid sid");
        assert_eq!(sid, Sid::new("S-1-1", 0));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "S-1", "S-1-", "X-1-5-7", "S-1-5-abc", "S-1--5-7", "S-1-5-99999999999"] {
            assert!(
                matches!(bad.parse::<Sid>(), Err(IdmapError::MalformedSid(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_kind() {
        assert_eq!(IdType::PosixId.resolve_kind(PrincipalType::Group), Ok(IdType::Gid));
        assert_eq!(IdType::Uid.resolve_kind(PrincipalType::User), Ok(IdType::Uid));
        assert_eq!(
            IdType::Uid.resolve_kind(PrincipalType::Group),
            Err(IdmapError::TypeMismatch {
                expected: PrincipalType::User,
                found: PrincipalType::Group,
            })
        );
        assert_eq!(IdType::Sid.resolve_kind(PrincipalType::User), Err(IdmapError::UnsupportedType));
    }

    #[test]
    fn test_ephemeral_boundary() {
        assert!(!is_ephemeral(i32::MAX as u32));
        assert!(is_ephemeral(EPHEMERAL_ID_MIN));
        assert!(is_ephemeral(u32::MAX));
    }
}
