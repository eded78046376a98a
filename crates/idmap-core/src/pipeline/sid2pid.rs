//! Windows to unix steps.

use tracing::debug;

use super::{BatchState, Env, LOCAL_GID_RID_OFFSET, LOCAL_UID_RID_OFFSET};
use crate::cache::{self, Sid2PidLookup};
use crate::error::{IdmapError, PrincipalType};
use crate::request::{ExpiredEphemeral, MappingRequest, MappingResult};
use crate::rules;
use crate::sid::{Direction, IdType, Identity, Sid};
use crate::store::WorkerStores;
use crate::wellknown;

enum Local {
    Mapped(Identity, Direction),
    NeedsDirectory,
    NeedsRules,
}

fn source_sid(req: &MappingRequest) -> Result<Sid, IdmapError> {
    req.source_sid()
        .cloned()
        .ok_or_else(|| IdmapError::internal("windows step on a unix request"))
}

pub(super) fn first_pass(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    batch: &mut BatchState,
    req: &mut MappingRequest,
    res: &mut MappingResult,
) {
    match resolve_locally(env, stores, req) {
        Ok(Local::Mapped(id, direction)) => {
            *res = MappingResult::mapped(id, direction);
            req.state.done = true;
        },
        Ok(Local::NeedsDirectory) => {
            req.state.needs_directory = true;
            batch.directory_queries += 1;
            batch.sid2pid_done = false;
        },
        Ok(Local::NeedsRules) => batch.sid2pid_done = false,
        Err(e) => {
            *res = MappingResult::failed(e);
            req.state.done = true;
        },
    }
}

fn resolve_locally(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    req: &mut MappingRequest,
) -> Result<Local, IdmapError> {
    let sid = source_sid(req)?;
    sid.validate()?;
    if !matches!(req.target, IdType::Uid | IdType::Gid | IdType::PosixId) {
        return Err(IdmapError::UnsupportedType);
    }

    match wellknown::lookup_sid2pid(&sid, req.target) {
        Ok((id, direction)) => return Ok(Local::Mapped(id, direction)),
        Err(IdmapError::NotFound) => {},
        Err(e) => return Err(e),
    }

    match cache::lookup_sid2pid(stores.cache()?, &sid, req.target, req.flags, env.now) {
        Ok(Sid2PidLookup::Mapped {
            id,
            direction,
            unixname,
        }) => {
            req.target_name = unixname;
            return Ok(Local::Mapped(id, direction));
        },
        Ok(Sid2PidLookup::Expired(stale)) => {
            debug!(sid = %sid, pid = stale.pid, "cached ephemeral id expired");
            req.state.expired_ephemeral = Some(stale);
        },
        Err(IdmapError::NotFound) => {},
        Err(e) => return Err(e),
    }

    if req.flags.lookup_only() {
        return Err(IdmapError::NotFound);
    }

    // Caller-supplied names are trusted and never written to the name cache.
    if req.source_name.is_some() {
        req.state.name_from_cache = true;
        if let Some(is_user) = req.target.is_user() {
            req.state.principal = Some(PrincipalType::from_is_user(is_user));
            return Ok(Local::NeedsRules);
        }
    }

    let local = if let Some((name, principal)) = wellknown::lookup_sid2name(&sid) {
        Some((name.to_string(), None, principal))
    } else {
        match cache::lookup_sid2name(stores.cache()?, &sid, env.now) {
            Ok(entry) => entry.name.map(|name| (name, entry.domain, entry.principal)),
            Err(IdmapError::NotFound) => None,
            Err(e) => return Err(e),
        }
    };
    let Some((name, domain, principal)) = local else {
        return Ok(Local::NeedsDirectory);
    };

    req.target.resolve_kind(principal)?;
    if req.source_name.is_none() {
        req.source_name = Some(name);
        req.source_domain = domain;
    }
    req.state.principal = Some(principal);
    req.state.name_from_cache = true;
    Ok(Local::NeedsRules)
}

pub(super) fn second_pass(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    batch: &mut BatchState,
    req: &mut MappingRequest,
    res: &mut MappingResult,
) {
    let outcome = match res.status.clone() {
        Ok(()) => map_by_name(env, stores, batch, req),
        Err(IdmapError::NotFound) => match source_sid(req) {
            Ok(sid) if is_local(env, &sid) => {
                req.state.name_from_cache = true;
                local_sid_to_pid(sid.rid, req.target).map(|id| (id, Direction::Bidirectional))
            },
            Ok(_) => Err(IdmapError::NotFound),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    *res = match outcome {
        Ok((id, direction)) => MappingResult::mapped(id, direction),
        Err(e) => {
            debug!(source = ?req.source, error = %e, "windows to unix resolution failed");
            MappingResult::failed(e)
        },
    };
}

fn is_local(env: &Env<'_>, sid: &Sid) -> bool {
    env.machine_sid()
        .is_some_and(|machine| machine.eq_ignore_ascii_case(&sid.prefix))
}

/// Inverse of the local identity synthesized for unix principals.
fn local_sid_to_pid(rid: u32, target: IdType) -> Result<Identity, IdmapError> {
    if rid >= LOCAL_GID_RID_OFFSET {
        if target == IdType::Uid {
            return Err(IdmapError::TypeMismatch {
                expected: PrincipalType::User,
                found: PrincipalType::Group,
            });
        }
        return Ok(Identity::Gid(rid - LOCAL_GID_RID_OFFSET));
    }
    if target == IdType::Gid {
        return Err(IdmapError::TypeMismatch {
            expected: PrincipalType::Group,
            found: PrincipalType::User,
        });
    }
    rid.checked_sub(LOCAL_UID_RID_OFFSET)
        .map(Identity::Uid)
        .ok_or(IdmapError::NotFound)
}

fn map_by_name(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    batch: &mut BatchState,
    req: &mut MappingRequest,
) -> Result<(Identity, Direction), IdmapError> {
    let sid = source_sid(req)?;
    let principal = req
        .state
        .principal
        .ok_or_else(|| IdmapError::internal("principal type unknown after name lookup"))?;
    let is_user = req.target.resolve_kind(principal)? == IdType::Uid;

    let matched = match req.source_name.as_deref() {
        Some(winname) => rules::match_w2u(
            stores.rules()?,
            env.ctx.names(),
            winname,
            req.source_domain.as_deref(),
            env.mapping_domain(),
            is_user,
        ),
        None => Err(IdmapError::NotFound),
    };

    match matched {
        Ok(found) => {
            req.target_name = Some(found.unixname);
            Ok((Identity::posix(found.pid, is_user), found.direction))
        },
        Err(IdmapError::NotFound) if req.flags.no_new_id_alloc => Err(IdmapError::NoMapping),
        Err(IdmapError::NotFound) => {
            let pid = ephemeral_pid(env, batch, &sid, req.state.expired_ephemeral, is_user)?;
            Ok((Identity::posix(pid, is_user), Direction::Bidirectional))
        },
        Err(e) => Err(e),
    }
}

/// Picks the ephemeral id for `sid`: the expired one if it is of the right
/// kind, the one issued earlier in this batch, or a fresh one.
fn ephemeral_pid(
    env: &Env<'_>,
    batch: &mut BatchState,
    sid: &Sid,
    stale: Option<ExpiredEphemeral>,
    is_user: bool,
) -> Result<u32, IdmapError> {
    let pid = match (stale, batch.history.get(sid)) {
        (Some(stale), _) if stale.is_user == is_user => stale.pid,
        (_, Some(pid)) => return Ok(pid),
        _ => env.ctx.allocator().next_id(
            env.ctx.authority(),
            is_user,
            env.config.ephemeral.block_size,
        )?,
    };
    if !batch.history.insert(sid, pid) {
        debug!(sid = %sid, "batch id history is full");
    }
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_sid_reverse_mapping() {
        assert_eq!(local_sid_to_pid(1500, IdType::PosixId), Ok(Identity::Uid(500)));
        assert_eq!(local_sid_to_pid(1000, IdType::Uid), Ok(Identity::Uid(0)));
        assert_eq!(local_sid_to_pid(999, IdType::Uid), Err(IdmapError::NotFound));
        assert_eq!(
            local_sid_to_pid(LOCAL_GID_RID_OFFSET + 10, IdType::PosixId),
            Ok(Identity::Gid(10))
        );
        assert!(matches!(
            local_sid_to_pid(LOCAL_GID_RID_OFFSET + 10, IdType::Uid),
            Err(IdmapError::TypeMismatch { .. })
        ));
        assert!(matches!(
            local_sid_to_pid(1500, IdType::Gid),
            Err(IdmapError::TypeMismatch { .. })
        ));
    }
}
