//! Error taxonomy for identity resolution.
//!
//! Every request in a batch carries its own [`IdmapError`] status, so the type
//! is `Clone` and comparable. Store failures are folded into it through
//! [`classify_store_message`], which recognises the uniqueness violations of
//! the rules table and turns everything else into [`IdmapError::Internal`].

use std::fmt;

use thiserror::Error;

/// The side of a name rule a failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleDirection {
    /// Windows to unix.
    W2u,
    /// Unix to windows.
    U2w,
}

impl fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::W2u => f.write_str("windows-to-unix"),
            Self::U2w => f.write_str("unix-to-windows"),
        }
    }
}

/// Principal kind as reported by a directory or cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalType {
    /// A user account.
    User,
    /// A group.
    Group,
    /// Anything else (computer, alias, deleted account, ...).
    Other,
}

impl PrincipalType {
    /// Integer code stored in the `name_cache.type` column.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::User => 1,
            Self::Group => 2,
            Self::Other => 0,
        }
    }

    /// Inverse of [`Self::code`]; unknown codes map to `Other`.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            1 => Self::User,
            2 => Self::Group,
            _ => Self::Other,
        }
    }

    /// Principal type of a well-known or cached entry given its `is_user` bit.
    #[must_use]
    pub const fn from_is_user(is_user: bool) -> Self {
        if is_user { Self::User } else { Self::Group }
    }
}

impl fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Group => f.write_str("group"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Errors produced while resolving or administering identity mappings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum IdmapError {
    /// The request itself is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation failure during per-worker setup.
    #[error("out of memory")]
    OutOfMemory,

    /// No matching record; another source may still answer.
    #[error("not found")]
    NotFound,

    /// Explicit, terminal denial of a mapping.
    #[error("no mapping")]
    NoMapping,

    /// The principal exists but is the wrong kind for the request.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Kind the caller asked for.
        expected: PrincipalType,
        /// Kind actually found.
        found: PrincipalType,
    },

    /// The requested target id type is not supported for this source.
    #[error("unsupported id type")]
    UnsupportedType,

    /// The SID could not be parsed or is empty.
    #[error("malformed SID: {0}")]
    MalformedSid(String),

    /// No domain could be determined for a windows name.
    #[error("domain not found")]
    DomainNotFound,

    /// A rule with the same key already exists.
    #[error("{0} name rule conflicts with an existing rule")]
    RuleConflict(RuleDirection),

    /// The rule's name pattern combination is not allowed.
    #[error("invalid {0} name rule")]
    InvalidRule(RuleDirection),

    /// A cached row is missing mandatory columns.
    #[error("cache entry is corrupt: {0}")]
    CacheCorrupt(String),

    /// Store, protocol or allocation failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transient directory failure; the batch may be retried.
    #[error("retriable network error")]
    RetriableNetwork,
}

impl IdmapError {
    /// Shorthand for [`IdmapError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns `true` for [`IdmapError::RetriableNetwork`].
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RetriableNetwork)
    }
}

/// Known store messages and the status they map to.
///
/// Both the current `SQLite` wording and the legacy column-list wording are
/// listed.
const STORE_MESSAGE_TABLE: &[(&str, IdmapError)] = &[
    (
        "UNIQUE constraint failed: namerules.unixname, namerules.is_user, namerules.u2w_order",
        IdmapError::RuleConflict(RuleDirection::U2w),
    ),
    (
        "UNIQUE constraint failed: namerules.winname, namerules.windomain, namerules.is_user, \
         namerules.w2u_order",
        IdmapError::RuleConflict(RuleDirection::W2u),
    ),
    (
        "columns unixname, is_user, u2w_order are not unique",
        IdmapError::RuleConflict(RuleDirection::U2w),
    ),
    (
        "columns winname, windomain, is_user, w2u_order are not unique",
        IdmapError::RuleConflict(RuleDirection::W2u),
    ),
];

/// Maps a store error message to a status.
///
/// Returns `None` when the message is not in the table.
#[must_use]
pub fn classify_store_message(msg: &str) -> Option<IdmapError> {
    STORE_MESSAGE_TABLE
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(msg))
        .map(|(_, status)| status.clone())
}

impl From<rusqlite::Error> for IdmapError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(_, Some(msg)) = &err {
            if let Some(status) = classify_store_message(msg) {
                return status;
            }
        }
        Self::Internal(format!("store error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_messages() {
        assert_eq!(
            classify_store_message(
                "UNIQUE constraint failed: namerules.winname, namerules.windomain, \
                 namerules.is_user, namerules.w2u_order"
            ),
            Some(IdmapError::RuleConflict(RuleDirection::W2u))
        );
        assert_eq!(
            classify_store_message("COLUMNS UNIXNAME, IS_USER, U2W_ORDER ARE NOT UNIQUE"),
            Some(IdmapError::RuleConflict(RuleDirection::U2w))
        );
    }

    #[test]
    fn test_unknown_message_is_unclassified() {
        assert_eq!(classify_store_message("disk I/O error"), None);
        let err: IdmapError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, IdmapError::Internal(_)));
    }

    #[test]
    fn test_principal_type_codes_roundtrip() {
        for ty in [PrincipalType::User, PrincipalType::Group, PrincipalType::Other] {
            assert_eq!(PrincipalType::from_code(ty.code()), ty);
        }
        assert_eq!(PrincipalType::from_code(42), PrincipalType::Other);
    }
}
