//! Local POSIX name service.

use std::fmt;

use nix::unistd::{Gid, Group, Uid, User};
use tracing::{debug, warn};

use crate::error::IdmapError;

/// Lookups against the local passwd and group databases.
///
/// A missing account is [`IdmapError::NotFound`]; a failing database is
/// [`IdmapError::Internal`].
pub trait NameService: Send + Sync + fmt::Debug {
    /// Id of the user (`is_user`) or group named `name`.
    ///
    /// # Errors
    ///
    /// [`IdmapError::NotFound`] for an unknown account, [`IdmapError::Internal`]
    /// when the database fails.
    fn lookup_by_name(&self, is_user: bool, name: &str) -> Result<u32, IdmapError>;

    /// Name of the user (`is_user`) or group with id `id`.
    ///
    /// # Errors
    ///
    /// [`IdmapError::NotFound`] for an unknown account, [`IdmapError::Internal`]
    /// when the database fails.
    fn lookup_by_id(&self, is_user: bool, id: u32) -> Result<String, IdmapError>;
}

/// The system databases via `getpwnam_r` and friends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNameService;

fn db_error(what: &str, key: &dyn fmt::Display, err: nix::Error) -> IdmapError {
    warn!(lookup = what, key = %key, error = %err, "name service lookup failed");
    IdmapError::internal(format!("{what}({key}): {err}"))
}

impl NameService for SystemNameService {
    fn lookup_by_name(&self, is_user: bool, name: &str) -> Result<u32, IdmapError> {
        let found = if is_user {
            User::from_name(name)
                .map_err(|e| db_error("getpwnam", &name, e))?
                .map(|u| u.uid.as_raw())
        } else {
            Group::from_name(name)
                .map_err(|e| db_error("getgrnam", &name, e))?
                .map(|g| g.gid.as_raw())
        };
        found.ok_or_else(|| {
            debug!(name = %name, is_user, "no such account");
            IdmapError::NotFound
        })
    }

    fn lookup_by_id(&self, is_user: bool, id: u32) -> Result<String, IdmapError> {
        let found = if is_user {
            User::from_uid(Uid::from_raw(id))
                .map_err(|e| db_error("getpwuid", &id, e))?
                .map(|u| u.name)
        } else {
            Group::from_gid(Gid::from_raw(id))
                .map_err(|e| db_error("getgrgid", &id, e))?
                .map(|g| g.name)
        };
        found.ok_or_else(|| {
            debug!(id, is_user, "no such account");
            IdmapError::NotFound
        })
    }
}
