//! Directory service collaborator and the batched lookup with retries.
//!
//! All SID-to-name queries of a batch go to the directory in one call. A
//! transient failure of the whole call, or of individual items, is retried up
//! to `max_retries` more times; each retry resubmits only the items that are
//! still transient.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{IdmapError, PrincipalType};
use crate::sid::Sid;

/// One directory query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryQuery {
    /// Resolve a SID to its name, domain and principal type.
    SidToName(Sid),
    /// Resolve `name@domain` to its SID and principal type.
    NameToSid {
        /// Account name.
        name: String,
        /// Domain name.
        domain: String,
    },
}

/// A successful answer to one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryAnswer {
    /// SID of the principal.
    pub sid: Sid,
    /// Account name.
    pub name: String,
    /// Domain name.
    pub domain: String,
    /// User, group or other.
    pub principal: PrincipalType,
}

/// Per-item outcome. [`IdmapError::RetriableNetwork`] marks an item that may
/// succeed if asked again.
pub type DirectoryReply = Result<DirectoryAnswer, IdmapError>;

/// An external directory such as Active Directory.
pub trait DirectoryService: Send + Sync + fmt::Debug {
    /// Answers all `queries` in one round trip.
    ///
    /// Must return exactly one reply per query, in order. An
    /// `Err(RetriableNetwork)` for the whole call means the batch can be
    /// resubmitted.
    ///
    /// # Errors
    ///
    /// Returns an error only when the call as a whole failed.
    fn submit_batch(&self, queries: &[DirectoryQuery]) -> Result<Vec<DirectoryReply>, IdmapError>;
}

/// A directory that knows nobody.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDirectory;

impl DirectoryService for NoDirectory {
    fn submit_batch(&self, queries: &[DirectoryQuery]) -> Result<Vec<DirectoryReply>, IdmapError> {
        Ok(queries.iter().map(|_| Err(IdmapError::NotFound)).collect())
    }
}

/// Submits `queries` with bounded retries and returns one reply per query.
///
/// A non-transient failure of a whole call is reported for every item that
/// was part of it. Items still transient after the last retry keep
/// [`IdmapError::RetriableNetwork`].
pub fn lookup_batch(
    directory: &dyn DirectoryService,
    queries: &[DirectoryQuery],
    max_retries: u32,
) -> Vec<DirectoryReply> {
    let mut replies: Vec<DirectoryReply> = vec![Err(IdmapError::RetriableNetwork); queries.len()];
    let mut pending: Vec<usize> = (0..queries.len()).collect();

    for attempt in 0..=max_retries {
        if pending.is_empty() {
            break;
        }
        if attempt > 0 {
            warn!(attempt, items = pending.len(), "retrying directory lookup");
        }
        let batch: Vec<DirectoryQuery> = pending.iter().map(|&i| queries[i].clone()).collect();

        match directory.submit_batch(&batch) {
            Ok(answers) if answers.len() == batch.len() => {
                for (&i, answer) in pending.iter().zip(answers) {
                    replies[i] = answer;
                }
                pending.retain(|&i| replies[i].as_ref().is_err_and(IdmapError::is_retriable));
            },
            Ok(answers) => {
                let err = IdmapError::internal(format!(
                    "directory returned {} answers for {} queries",
                    answers.len(),
                    batch.len()
                ));
                for &i in &pending {
                    replies[i] = Err(err.clone());
                }
                break;
            },
            Err(IdmapError::RetriableNetwork) => {
                debug!(attempt, "directory batch failed transiently");
            },
            Err(e) => {
                warn!(error = %e, items = pending.len(), "directory lookup failed");
                for &i in &pending {
                    replies[i] = Err(e.clone());
                }
                break;
            },
        }
    }
    replies
}

/// Resolves one `name@domain` through the directory.
pub fn lookup_name(
    directory: &dyn DirectoryService,
    name: &str,
    domain: &str,
    max_retries: u32,
) -> DirectoryReply {
    let query = DirectoryQuery::NameToSid {
        name: name.to_string(),
        domain: domain.to_string(),
    };
    lookup_batch(directory, std::slice::from_ref(&query), max_retries)
        .pop()
        .unwrap_or(Err(IdmapError::NotFound))
}
