//! The two-pass resolution pipeline.
//!
//! A batch is resolved in four steps:
//!
//! 1. First pass: every request is checked against the well-known table and
//!    the cache, and windows requests get their names from local sources.
//!    Nothing here blocks on the network.
//! 2. Directory step: all requests that still lack a name are sent to the
//!    directory in one call (with retries).
//! 3. Second pass: name rules, then ephemeral ids or local identities. It is
//!    skipped per direction when the first pass already finished everything.
//! 4. Cache update: results produced by steps 2 and 3 are written back.
//!
//! Per-request failures are recorded in that request's [`MappingResult`] and
//! never abort the batch.

mod pid2sid;
mod sid2pid;

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::cache::{self, CacheTtl};
use crate::config::IdmapConfig;
use crate::context::IdmapContext;
use crate::directory::{self, DirectoryQuery};
use crate::ephemeral::SidHistory;
use crate::error::{IdmapError, PrincipalType};
use crate::request::{MappingRequest, MappingResult, PipelineState, RequestFlags, SourceId};
use crate::sid::{Direction, IdType, Identity, Sid};
use crate::store::{StoreHandle, WorkerStores};
use crate::wellknown;

/// Added to a uid to form the rid of its local identity.
pub const LOCAL_UID_RID_OFFSET: u32 = 1000;
/// Added to a gid to form the rid of its local identity.
pub const LOCAL_GID_RID_OFFSET: u32 = 1 << 31;

/// State shared by the requests of one batch.
#[derive(Debug)]
pub(crate) struct BatchState {
    /// Requests staged for the directory.
    directory_queries: usize,
    /// No windows-to-unix request needs the second pass.
    sid2pid_done: bool,
    /// No unix-to-windows request needs the second pass.
    pid2sid_done: bool,
    /// Ephemeral ids issued in this batch.
    history: SidHistory,
}

impl BatchState {
    fn new(size: usize) -> Self {
        Self {
            directory_queries: 0,
            sid2pid_done: true,
            pid2sid_done: true,
            history: SidHistory::with_capacity(size),
        }
    }
}

/// Read-only inputs every step needs.
#[derive(Debug)]
pub(crate) struct Env<'a> {
    ctx: &'a IdmapContext,
    config: IdmapConfig,
    now: i64,
}

impl Env<'_> {
    fn ttl(&self) -> CacheTtl {
        CacheTtl {
            mapping: self.config.cache.mapping_ttl,
            name: self.config.cache.name_ttl,
        }
    }

    fn mapping_domain(&self) -> Option<&str> {
        self.config.mapping_domain.as_deref()
    }

    fn machine_sid(&self) -> Option<&str> {
        self.config.machine_sid.as_deref()
    }
}

/// Resolves a batch of requests.
///
/// Returns one result per request, in order. The requests' names and
/// pipeline state are updated in place. The call itself only fails when the
/// shared configuration cannot be read.
///
/// # Errors
///
/// Returns [`IdmapError::Internal`] if the shared configuration cannot be
/// read. Per-request failures are reported in the results.
pub fn resolve_batch(
    ctx: &IdmapContext,
    stores: &mut WorkerStores,
    requests: &mut [MappingRequest],
) -> Result<Vec<MappingResult>, IdmapError> {
    let env = Env {
        ctx,
        config: ctx.config()?,
        now: ctx.now(),
    };
    let mut batch = BatchState::new(requests.len());
    let mut results = vec![MappingResult::pending(); requests.len()];

    for (req, res) in requests.iter_mut().zip(results.iter_mut()) {
        req.state = PipelineState::default();
        match req.source {
            SourceId::Sid(_) => sid2pid::first_pass(&env, stores, &mut batch, req, res),
            SourceId::Uid(_) | SourceId::Gid(_) => {
                pid2sid::first_pass(&env, stores, &mut batch, req, res);
            },
        }
    }

    if batch.directory_queries > 0 {
        directory_step(&env, requests, &mut results);
    }

    if !batch.sid2pid_done || !batch.pid2sid_done {
        for (req, res) in requests.iter_mut().zip(results.iter_mut()) {
            if req.state.done {
                continue;
            }
            match req.source {
                SourceId::Sid(_) if !batch.sid2pid_done => {
                    sid2pid::second_pass(&env, stores, &mut batch, req, res);
                },
                SourceId::Uid(_) | SourceId::Gid(_) if !batch.pid2sid_done => {
                    pid2sid::second_pass(&env, stores, req, res);
                },
                _ => {},
            }
        }
    }

    update_cache(&env, stores, requests, &results);
    Ok(results)
}

/// Sends every staged SID to the directory once and files the answers.
///
/// A failed item leaves its error in the request's result for the second
/// pass to interpret.
fn directory_step(env: &Env<'_>, requests: &mut [MappingRequest], results: &mut [MappingResult]) {
    let mut queries: Vec<DirectoryQuery> = Vec::new();
    let mut slot_of: HashMap<Sid, usize> = HashMap::new();
    let mut slots: Vec<Option<usize>> = vec![None; requests.len()];

    for (i, req) in requests.iter().enumerate() {
        let Some(sid) = req.source_sid().filter(|_| req.state.needs_directory) else {
            continue;
        };
        let slot = *slot_of.entry(sid.clone()).or_insert_with(|| {
            queries.push(DirectoryQuery::SidToName(sid.clone()));
            queries.len() - 1
        });
        slots[i] = Some(slot);
    }

    debug!(queries = queries.len(), "querying directory");
    let replies = directory::lookup_batch(
        env.ctx.directory(),
        &queries,
        env.config.directory.max_retries,
    );

    for ((req, res), slot) in requests.iter_mut().zip(results.iter_mut()).zip(slots) {
        let Some(reply) = slot.and_then(|s| replies.get(s)) else {
            continue;
        };
        req.state.needs_directory = false;
        match reply {
            Ok(answer) => {
                if req.source_name.is_none() {
                    req.source_name = Some(answer.name.clone());
                    req.source_domain = Some(answer.domain.clone());
                }
                req.state.principal = Some(answer.principal);
            },
            Err(e) => res.status = Err(e.clone()),
        }
    }
}

/// Writes back every result produced after the first pass.
///
/// Write failures are logged; the results stand.
fn update_cache(
    env: &Env<'_>,
    stores: &mut WorkerStores,
    requests: &[MappingRequest],
    results: &[MappingResult],
) {
    for (req, res) in requests.iter().zip(results) {
        if req.state.done || res.status.is_err() {
            continue;
        }
        let learned_name = !req.state.name_from_cache;
        let outcome = match (&req.source, &res.id) {
            (SourceId::Sid(sid), Some(id @ (Identity::Uid(pid) | Identity::Gid(pid)))) => {
                let record = cache::MappingRecord {
                    sid,
                    winname: req.source_name.as_deref(),
                    windomain: req.source_domain.as_deref(),
                    pid: *pid,
                    unixname: req.target_name.as_deref(),
                    is_user: matches!(id, Identity::Uid(_)),
                    direction: res.direction,
                };
                stores.cache().and_then(|store| {
                    cache::store_sid2pid(
                        store,
                        &record,
                        req.state.expired_ephemeral,
                        learned_name,
                        env.now,
                        env.ttl(),
                    )
                })
            },
            (SourceId::Uid(pid) | SourceId::Gid(pid), Some(Identity::Sid(sid))) => {
                let record = cache::MappingRecord {
                    sid,
                    winname: req.target_name.as_deref(),
                    windomain: req.target_domain.as_deref(),
                    pid: *pid,
                    unixname: req.source_name.as_deref(),
                    is_user: matches!(req.source, SourceId::Uid(_)),
                    direction: res.direction,
                };
                stores.cache().and_then(|store| {
                    cache::store_pid2sid(store, &record, learned_name, env.now, env.ttl())
                })
            },
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            warn!(source = ?req.source, error = %e, "cache update failed");
        }
    }
}

// =============================================================================
// Single-principal lookups
// =============================================================================

/// A mapping returned by the single-principal lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMapping {
    /// Windows side.
    pub sid: Sid,
    /// POSIX side, a uid or gid.
    pub posix: Identity,
    /// Windows name, when known.
    pub winname: Option<String>,
    /// Windows domain, when known.
    pub windomain: Option<String>,
    /// Unix name, when known.
    pub unixname: Option<String>,
    /// Which way the mapping is authoritative.
    pub direction: Direction,
}

/// Input of [`get_w2u_mapping`]. Give a SID, a windows name, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct W2uLookup {
    /// SID to resolve.
    pub sid: Option<Sid>,
    /// Windows name, optionally as `name@domain`.
    pub winname: Option<String>,
    /// Windows domain; requires `winname`.
    pub windomain: Option<String>,
    /// Uid, gid or either.
    pub target: IdType,
    /// Caller options.
    pub flags: RequestFlags,
}

impl W2uLookup {
    /// Looks up by windows name.
    #[must_use]
    pub fn by_name(winname: impl Into<String>, target: IdType) -> Self {
        Self {
            sid: None,
            winname: Some(winname.into()),
            windomain: None,
            target,
            flags: RequestFlags::default(),
        }
    }

    /// Looks up by SID.
    #[must_use]
    pub fn by_sid(sid: Sid, target: IdType) -> Self {
        Self {
            sid: Some(sid),
            winname: None,
            windomain: None,
            target,
            flags: RequestFlags::default(),
        }
    }
}

/// Input of [`get_u2w_mapping`]. Give an id, a unix name, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct U2wLookup {
    /// Uid or gid.
    pub pid: Option<u32>,
    /// Unix account name.
    pub unixname: Option<String>,
    /// User or group.
    pub is_user: bool,
    /// Caller options.
    pub flags: RequestFlags,
}

/// Resolves `name@domain` to a SID through the well-known table, the name
/// cache and then the directory. The flag is set when the answer came from
/// the directory.
fn name_to_sid(
    env: &Env<'_>,
    cache_store: &mut StoreHandle,
    name: &str,
    domain: &str,
    flags: RequestFlags,
) -> Result<(Sid, PrincipalType, bool), IdmapError> {
    if let Some(entry) = wellknown::lookup_name2sid(name) {
        return Ok((entry.sid(), entry.principal_type(), false));
    }
    match cache::lookup_name2sid(cache_store, name, domain, env.now) {
        Ok((sid, principal)) => return Ok((sid, principal, false)),
        Err(IdmapError::NotFound) if !flags.no_nameservice => {},
        Err(e) => return Err(e),
    }
    let answer = directory::lookup_name(
        env.ctx.directory(),
        name,
        domain,
        env.config.directory.max_retries,
    )?;
    Ok((answer.sid, answer.principal, true))
}

fn run_single(
    ctx: &IdmapContext,
    stores: &mut WorkerStores,
    request: MappingRequest,
) -> Result<(MappingRequest, MappingResult), IdmapError> {
    let mut requests = [request];
    let result = resolve_batch(ctx, stores, &mut requests)?
        .pop()
        .ok_or_else(|| IdmapError::internal("empty batch result"))?;
    result.status.clone()?;
    let [request] = requests;
    Ok((request, result))
}

/// Resolves one windows principal to a uid or gid.
///
/// # Errors
///
/// Returns the request's failure status, such as [`IdmapError::NotFound`]
/// for an unknown name or [`IdmapError::NoMapping`] when no id may be
/// assigned.
pub fn get_w2u_mapping(
    ctx: &IdmapContext,
    stores: &mut WorkerStores,
    lookup: &W2uLookup,
) -> Result<ResolvedMapping, IdmapError> {
    if !matches!(lookup.target, IdType::Uid | IdType::Gid | IdType::PosixId) {
        return Err(IdmapError::UnsupportedType);
    }
    if lookup.winname.is_none() && lookup.windomain.is_some() {
        return Err(IdmapError::InvalidArgument("windomain given without winname".to_string()));
    }
    if lookup.sid.is_none() && lookup.winname.is_none() {
        return Err(IdmapError::InvalidArgument("need a SID or a windows name".to_string()));
    }

    let env = Env {
        ctx,
        config: ctx.config()?,
        now: ctx.now(),
    };
    let names = lookup.winname.as_deref().map(|winname| {
        match (lookup.windomain.as_deref(), winname.rsplit_once('@')) {
            (Some(domain), _) => (winname.to_string(), Some(domain.to_string())),
            (None, Some((name, domain))) => (name.to_string(), Some(domain.to_string())),
            (None, None) => (
                winname.to_string(),
                env.mapping_domain().map(str::to_string),
            ),
        }
    });

    let mut target = lookup.target;
    let sid = match (&lookup.sid, &names) {
        (Some(sid), _) => sid.clone(),
        (None, Some((name, domain))) => {
            let domain = domain.as_deref().ok_or(IdmapError::DomainNotFound)?;
            let (sid, principal, _) =
                name_to_sid(&env, stores.cache()?, name, domain, lookup.flags)?;
            target = target.resolve_kind(principal)?;
            sid
        },
        (None, None) => {
            return Err(IdmapError::InvalidArgument("need a SID or a windows name".to_string()));
        },
    };

    let mut request = MappingRequest::new(SourceId::Sid(sid.clone()), target).with_flags(lookup.flags);
    if let Some((name, domain)) = names {
        request.source_name = Some(name);
        request.source_domain = domain;
    }
    let (request, result) = run_single(ctx, stores, request)?;
    let posix = result
        .id
        .ok_or_else(|| IdmapError::internal("mapped result without identity"))?;
    Ok(ResolvedMapping {
        sid,
        posix,
        winname: request.source_name,
        windomain: request.source_domain,
        unixname: request.target_name,
        direction: result.direction,
    })
}

/// Resolves one unix user or group to a SID.
///
/// # Errors
///
/// Returns the request's failure status, such as [`IdmapError::NotFound`]
/// for an unknown account or [`IdmapError::NoMapping`] when no SID can be
/// formed.
pub fn get_u2w_mapping(
    ctx: &IdmapContext,
    stores: &mut WorkerStores,
    lookup: &U2wLookup,
) -> Result<ResolvedMapping, IdmapError> {
    let pid = match (lookup.pid, lookup.unixname.as_deref()) {
        (Some(pid), _) => pid,
        (None, Some(name)) => ctx.names().lookup_by_name(lookup.is_user, name)?,
        (None, None) => {
            return Err(IdmapError::InvalidArgument("need an id or a unix name".to_string()));
        },
    };
    let source = if lookup.is_user { SourceId::Uid(pid) } else { SourceId::Gid(pid) };
    let mut request = MappingRequest::new(source, IdType::Sid).with_flags(lookup.flags);
    request.source_name.clone_from(&lookup.unixname);

    let (request, result) = run_single(ctx, stores, request)?;
    let sid = match result.id {
        Some(Identity::Sid(sid)) => sid,
        _ => return Err(IdmapError::internal("mapped result without SID")),
    };
    Ok(ResolvedMapping {
        sid,
        posix: Identity::posix(pid, lookup.is_user),
        winname: request.target_name,
        windomain: request.target_domain,
        unixname: request.source_name,
        direction: result.direction,
    })
}
