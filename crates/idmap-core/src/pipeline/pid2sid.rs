//! Unix to windows steps.

use tracing::debug;

use super::{BatchState, Env, LOCAL_GID_RID_OFFSET, LOCAL_UID_RID_OFFSET, name_to_sid};
use crate::cache;
use crate::error::IdmapError;
use crate::request::{MappingRequest, MappingResult, SourceId};
use crate::rules;
use crate::sid::{Direction, IdType, Identity, Sid, is_ephemeral};
use crate::store::WorkerStores;
use crate::wellknown;

fn source_pid(req: &MappingRequest) -> Result<(u32, bool), IdmapError> {
    match req.source {
        SourceId::Uid(uid) => Ok((uid, true)),
        SourceId::Gid(gid) => Ok((gid, false)),
        SourceId::Sid(_) => Err(IdmapError::internal("unix step on a windows request")),
    }
}

pub(super) fn first_pass(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    batch: &mut BatchState,
    req: &mut MappingRequest,
    res: &mut MappingResult,
) {
    match resolve_locally(env, stores, req) {
        Ok(Some((sid, direction))) => {
            *res = MappingResult::mapped(Identity::Sid(sid), direction);
            req.state.done = true;
        },
        Ok(None) => batch.pid2sid_done = false,
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
) -> Result<Option<(Sid, Direction)>, IdmapError> {
    let (pid, is_user) = source_pid(req)?;
    if req.target != IdType::Sid {
        return Err(IdmapError::UnsupportedType);
    }

    match wellknown::lookup_pid2sid(pid, is_user) {
        Ok((sid, direction)) => {
            req.target_name = wellknown::lookup_sid2name(&sid).map(|(name, _)| name.to_string());
            return Ok(Some((sid, direction)));
        },
        Err(IdmapError::NotFound) => {},
        Err(e) => return Err(e),
    }

    match cache::lookup_pid2sid(stores.cache()?, pid, is_user, env.now) {
        Ok(hit) => {
            req.target_name = hit.winname;
            req.target_domain = hit.windomain;
            return Ok(Some((hit.sid, hit.direction)));
        },
        Err(IdmapError::NotFound) => {},
        Err(e) => return Err(e),
    }

    // An ephemeral id with no cache row was never handed out by us.
    if is_ephemeral(pid) || req.flags.lookup_only() {
        return Err(IdmapError::NoMapping);
    }
    Ok(None)
}

/// The SID this machine stands in with for a unix principal that has no
/// windows identity.
fn local_identity(env: &Env<'_>, pid: u32, is_user: bool) -> Result<Sid, IdmapError> {
    let machine = env.machine_sid().ok_or(IdmapError::NoMapping)?;
    let rid = if is_user {
        pid.checked_add(LOCAL_UID_RID_OFFSET)
            .filter(|&rid| rid < LOCAL_GID_RID_OFFSET)
    } else {
        pid.checked_add(LOCAL_GID_RID_OFFSET)
    };
    rid.map(|rid| Sid::new(machine, rid)).ok_or(IdmapError::NoMapping)
}

pub(super) fn second_pass(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    req: &mut MappingRequest,
    res: &mut MappingResult,
) {
    let (pid, is_user) = match source_pid(req) {
        Ok(source) => source,
        Err(e) => {
            *res = MappingResult::failed(e);
            return;
        },
    };

    // A unix id with no account keeps its not-found status.
    let unixname = match source_unixname(env, req, pid, is_user) {
        Ok(name) => name,
        Err(e) => {
            *res = failed_with_fallback(env, req, pid, is_user, e);
            return;
        },
    };

    *res = match map_by_name(env, stores, req, &unixname, is_user) {
        Ok((sid, direction)) => MappingResult::mapped(Identity::Sid(sid), direction),
        // No rule: stand in with the local identity.
        Err(IdmapError::NotFound) => {
            req.state.name_from_cache = true;
            match local_identity(env, pid, is_user) {
                Ok(sid) => MappingResult::mapped(Identity::Sid(sid), Direction::Bidirectional),
                Err(e) => MappingResult::failed(e),
            }
        },
        Err(e) => failed_with_fallback(env, req, pid, is_user, e),
    };
}

/// Keeps the failure but hands the caller a usable fallback.
fn failed_with_fallback(
    env: &Env<'_>,
    req: &MappingRequest,
    pid: u32,
    is_user: bool,
    e: IdmapError,
) -> MappingResult {
    debug!(source = ?req.source, error = %e, "unix to windows resolution failed");
    MappingResult {
        id: local_identity(env, pid, is_user).ok().map(Identity::Sid),
        direction: Direction::Bidirectional,
        status: Err(e),
    }
}

fn source_unixname(
    env: &Env<'_>,
    req: &mut MappingRequest,
    pid: u32,
    is_user: bool,
) -> Result<String, IdmapError> {
    if let Some(name) = &req.source_name {
        return Ok(name.clone());
    }
    let name = env.ctx.names().lookup_by_id(is_user, pid)?;
    req.source_name = Some(name.clone());
    Ok(name)
}

fn map_by_name(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    req: &mut MappingRequest,
    unixname: &str,
    is_user: bool,
) -> Result<(Sid, Direction), IdmapError> {
    let (rules_store, cache_store) = stores.pair()?;
    let flags = req.flags;
    let mut learned = false;
    let found = rules::match_u2w(
        rules_store,
        unixname,
        is_user,
        env.mapping_domain(),
        |winname, windomain| {
            let (sid, principal, from_directory) =
                name_to_sid(env, cache_store, winname, windomain, flags)?;
            learned = from_directory;
            Ok((sid, principal))
        },
    )?;

    req.target_name = Some(found.winname);
    req.target_domain = Some(found.windomain);
    req.state.name_from_cache = !learned;
    Ok((found.sid, found.direction))
}
