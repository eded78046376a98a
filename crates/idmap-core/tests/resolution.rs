//! End-to-end resolution tests against on-disk stores and fake collaborators.
//!
//! Covered here:
//!
//! - Wildcard rules with and without a fallback account
//! - Well-known principals that are never mapped
//! - Batch-internal ephemeral consistency and directory de-duplication
//! - Cache round trips that avoid the directory
//! - Expired ephemeral ids: reuse and invalidation
//! - Directory retries
//! - Local identities in both directions

mod common;

use common::{
    EPHEMERAL_BASE, Harness, MACHINE_SID, ScriptedDirectory, StaticNames, domain_sid,
};
use idmap_core::rules::{self, NameRule};
use idmap_core::{
    Direction, IdType, Identity, IdmapError, MappingRequest, PrincipalType, RequestFlags,
    RuleDirection, Sid, U2wLookup, W2uLookup, get_u2w_mapping, get_w2u_mapping, resolve_batch,
};

const BOB_RID: u32 = 1104;
const GUEST_UID: u32 = 60_002;

// ============================================================================
// Helpers
// ============================================================================

fn bob_directory() -> ScriptedDirectory {
    ScriptedDirectory::default()
        .with_principal(BOB_RID, "bob", PrincipalType::User)
        .with_principal(513, "Domain Users", PrincipalType::Group)
}

fn add_rule(h: &mut Harness, rule: &NameRule) {
    let domain = h.config.mapping_domain.clone();
    rules::add_rule(h.stores.rules().expect("rules store"), rule, domain.as_deref())
        .expect("add rule");
}

fn sfbay_wildcard() -> NameRule {
    NameRule::new(true, "*", "*", Direction::Bidirectional).with_windomain("SFBAY")
}

fn resolve_one(h: &mut Harness, request: MappingRequest) -> idmap_core::MappingResult {
    let mut batch = [request];
    resolve_batch(&h.ctx, &mut h.stores, &mut batch)
        .expect("resolve")
        .pop()
        .expect("one result")
}

const LOOKUP_ONLY: RequestFlags = RequestFlags {
    no_new_id_alloc: true,
    no_nameservice: false,
};

// ============================================================================
// Rules
// ============================================================================

#[test]
fn wildcard_rule_without_account_allocates_ephemeral_uid() {
    let mut h = Harness::new(StaticNames::default().with_user("guest", GUEST_UID), bob_directory());
    add_rule(&mut h, &sfbay_wildcard());

    let result = resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(BOB_RID)));
    assert_eq!(result.identity(), Some(&Identity::Uid(EPHEMERAL_BASE)));
    assert_eq!(result.direction, Direction::Bidirectional);
    assert_eq!(h.blocks_reserved(), 1);
}

#[test]
fn fallback_rule_maps_to_guest_instead_of_ephemeral() {
    let mut h = Harness::new(StaticNames::default().with_user("guest", GUEST_UID), bob_directory());
    add_rule(&mut h, &sfbay_wildcard());
    add_rule(
        &mut h,
        &NameRule::new(true, "*", "guest", Direction::WinToUnix).with_windomain("SFBAY"),
    );

    let result = resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(BOB_RID)));
    assert_eq!(result.identity(), Some(&Identity::Uid(GUEST_UID)));
    assert_eq!(result.direction, Direction::WinToUnix);
    assert_eq!(h.blocks_reserved(), 0);
}

#[test]
fn same_named_account_wins_over_fallback() {
    let names = StaticNames::default()
        .with_user("guest", GUEST_UID)
        .with_user("bob", 501);
    let mut h = Harness::new(names, bob_directory());
    add_rule(&mut h, &sfbay_wildcard());
    add_rule(
        &mut h,
        &NameRule::new(true, "*", "guest", Direction::WinToUnix).with_windomain("SFBAY"),
    );

    let result = resolve_one(&mut h, MappingRequest::sid_to_pid(domain_sid(BOB_RID)));
    assert_eq!(result.identity(), Some(&Identity::Uid(501)));
}

#[test]
fn duplicate_rule_reports_conflict() {
    let mut h = Harness::new(StaticNames::default(), ScriptedDirectory::default());
    let fallback = NameRule::new(true, "*", "guest", Direction::WinToUnix).with_windomain("SFBAY");
    add_rule(&mut h, &fallback);
    let err = rules::add_rule(h.stores.rules().expect("rules"), &fallback, Some("SFBAY"))
        .expect_err("duplicate");
    assert_eq!(err, IdmapError::RuleConflict(RuleDirection::W2u));
}

#[test]
fn group_sid_for_uid_is_type_mismatch() {
    let mut h = Harness::new(StaticNames::default(), bob_directory());
    add_rule(&mut h, &sfbay_wildcard());
    let result = resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(513)));
    assert!(matches!(result.status, Err(IdmapError::TypeMismatch { .. })));
    // Failures are not cached.
    let again = resolve_one(
        &mut h,
        MappingRequest::sid_to_gid(domain_sid(513)).with_flags(LOOKUP_ONLY),
    );
    assert_eq!(again.status, Err(IdmapError::NotFound));
}

// ============================================================================
// Well-known principals
// ============================================================================

#[test]
fn everyone_is_never_mapped() {
    let mut h = Harness::new(StaticNames::default(), bob_directory());
    add_rule(
        &mut h,
        &NameRule::new(false, "*", "*", Direction::WinToUnix).with_windomain("*"),
    );
    let everyone = Sid::new("S-1-1", 0);
    let mut batch = [
        MappingRequest::sid_to_uid(everyone.clone()),
        MappingRequest::sid_to_gid(everyone.clone()),
        MappingRequest::sid_to_pid(everyone),
    ];
    let results = resolve_batch(&h.ctx, &mut h.stores, &mut batch).expect("resolve");
    for result in results {
        assert_eq!(result.status, Err(IdmapError::NoMapping));
    }
    assert_eq!(h.blocks_reserved(), 0);
    assert_eq!(h.directory.call_count(), 0);
}

// ============================================================================
// Batches and the cache
// ============================================================================

#[test]
fn same_sid_twice_in_a_batch_gets_one_id() {
    let mut h = Harness::new(StaticNames::default(), bob_directory());
    let mut batch = [
        MappingRequest::sid_to_uid(domain_sid(BOB_RID)),
        MappingRequest::sid_to_gid(domain_sid(513)),
        MappingRequest::sid_to_pid(domain_sid(BOB_RID)),
    ];
    let results = resolve_batch(&h.ctx, &mut h.stores, &mut batch).expect("resolve");

    let owner = results[0].identity().cloned().expect("owner");
    assert!(matches!(owner, Identity::Uid(uid) if uid >= EPHEMERAL_BASE));
    assert_eq!(results[2].identity(), Some(&owner));
    assert!(matches!(results[1].identity(), Some(Identity::Gid(_))));

    // One round trip, each SID asked once.
    let calls = h.directory.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 2);
}

#[test]
fn unix_to_windows_then_back_uses_only_the_cache() {
    let names = StaticNames::default().with_user("bob", 501);
    let mut h = Harness::new(names, bob_directory());
    add_rule(&mut h, &sfbay_wildcard());

    let forward = resolve_one(&mut h, MappingRequest::uid_to_sid(501));
    assert_eq!(forward.identity(), Some(&Identity::Sid(domain_sid(BOB_RID))));
    assert_eq!(forward.direction, Direction::Bidirectional);
    let calls_after_forward = h.directory.call_count();

    let back = resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(BOB_RID)));
    assert_eq!(back.identity(), Some(&Identity::Uid(501)));
    assert_eq!(h.directory.call_count(), calls_after_forward);
}

#[test]
fn expired_durable_mapping_is_resolved_again() {
    let names = StaticNames::default().with_user("bob", 501);
    let mut h = Harness::new(names, bob_directory());
    add_rule(&mut h, &sfbay_wildcard());
    resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(BOB_RID)));

    h.clock.advance(600);
    let stale = resolve_one(
        &mut h,
        MappingRequest::sid_to_uid(domain_sid(BOB_RID)).with_flags(LOOKUP_ONLY),
    );
    assert_eq!(stale.status, Err(IdmapError::NotFound));

    // The name is still cached, so no new directory call.
    let fresh = resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(BOB_RID)));
    assert_eq!(fresh.identity(), Some(&Identity::Uid(501)));
    assert_eq!(h.directory.call_count(), 1);
}

#[test]
fn expired_ephemeral_id_is_reused_then_invalidated() {
    let names = StaticNames::default().with_user("guest", GUEST_UID);
    let mut h = Harness::new(names, bob_directory());
    add_rule(&mut h, &sfbay_wildcard());
    let bob = domain_sid(BOB_RID);

    let first = resolve_one(&mut h, MappingRequest::sid_to_uid(bob.clone()));
    let eph = first.identity().and_then(Identity::pid).expect("ephemeral uid");

    h.clock.advance(601);
    // Plain lookups still see the ephemeral id.
    let plain = resolve_one(&mut h, MappingRequest::sid_to_uid(bob.clone()).with_flags(LOOKUP_ONLY));
    assert_eq!(plain.identity(), Some(&Identity::Uid(eph)));
    // A full resolution keeps the same id rather than allocating.
    let again = resolve_one(&mut h, MappingRequest::sid_to_uid(bob.clone()));
    assert_eq!(again.identity(), Some(&Identity::Uid(eph)));
    assert_eq!(h.blocks_reserved(), 1);

    // A durable mapping appears; the stale ephemeral row loses its w2u leg.
    add_rule(&mut h, &NameRule::new(true, "bob", "guest", Direction::WinToUnix));
    h.clock.advance(601);
    let durable = resolve_one(&mut h, MappingRequest::sid_to_uid(bob.clone()));
    assert_eq!(durable.identity(), Some(&Identity::Uid(GUEST_UID)));
    let plain = resolve_one(&mut h, MappingRequest::sid_to_uid(bob.clone()).with_flags(LOOKUP_ONLY));
    assert_eq!(plain.identity(), Some(&Identity::Uid(GUEST_UID)));

    // Files owned by the old id still resolve back to bob.
    let reverse = resolve_one(&mut h, MappingRequest::uid_to_sid(eph));
    assert_eq!(reverse.identity(), Some(&Identity::Sid(bob)));
}

#[test]
fn lookup_only_requests_never_allocate() {
    let mut h = Harness::new(StaticNames::default(), bob_directory());
    let result = resolve_one(
        &mut h,
        MappingRequest::sid_to_uid(domain_sid(BOB_RID)).with_flags(LOOKUP_ONLY),
    );
    assert_eq!(result.status, Err(IdmapError::NotFound));
    assert_eq!(h.blocks_reserved(), 0);
    assert_eq!(h.directory.call_count(), 0);
}

#[test]
fn bad_request_does_not_abort_batch() {
    let mut h = Harness::new(StaticNames::default(), bob_directory());
    let mut batch = [
        MappingRequest::sid_to_uid(Sid::new("", 5)),
        MappingRequest::new(idmap_core::SourceId::Sid(domain_sid(BOB_RID)), IdType::Sid),
        MappingRequest::sid_to_uid(domain_sid(BOB_RID)),
    ];
    let results = resolve_batch(&h.ctx, &mut h.stores, &mut batch).expect("resolve");
    assert!(matches!(results[0].status, Err(IdmapError::MalformedSid(_))));
    assert_eq!(results[1].status, Err(IdmapError::UnsupportedType));
    assert!(results[2].is_ok());
}

// ============================================================================
// Directory retries
// ============================================================================

#[test]
fn transient_directory_failures_are_retried() {
    let mut h = Harness::new(StaticNames::default(), bob_directory().failing_first(2));
    let result = resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(BOB_RID)));
    assert!(result.is_ok());
    assert_eq!(h.directory.call_count(), 3);
}

#[test]
fn directory_retries_are_bounded() {
    let mut h = Harness::new(StaticNames::default(), bob_directory().failing_first(3));
    let result = resolve_one(&mut h, MappingRequest::sid_to_uid(domain_sid(BOB_RID)));
    assert_eq!(result.status, Err(IdmapError::RetriableNetwork));
    assert_eq!(h.directory.call_count(), 3);
    assert_eq!(h.blocks_reserved(), 0);
}

// ============================================================================
// Local identities
// ============================================================================

#[test]
fn unix_user_without_rule_gets_local_identity() {
    let names = StaticNames::default().with_user("carol", 700);
    let mut h = Harness::new(names, ScriptedDirectory::default());

    let result = resolve_one(&mut h, MappingRequest::uid_to_sid(700));
    let local = Sid::new(MACHINE_SID, 1700);
    assert_eq!(result.identity(), Some(&Identity::Sid(local.clone())));

    let back = resolve_one(&mut h, MappingRequest::sid_to_uid(local));
    assert_eq!(back.identity(), Some(&Identity::Uid(700)));
}

#[test]
fn unknown_local_sid_maps_back_arithmetically() {
    let mut h = Harness::new(StaticNames::default(), ScriptedDirectory::default());
    let uid = resolve_one(&mut h, MappingRequest::sid_to_pid(Sid::new(MACHINE_SID, 1800)));
    assert_eq!(uid.identity(), Some(&Identity::Uid(800)));
    let gid = resolve_one(
        &mut h,
        MappingRequest::sid_to_pid(Sid::new(MACHINE_SID, (1 << 31) + 42)),
    );
    assert_eq!(gid.identity(), Some(&Identity::Gid(42)));
}

#[test]
fn uid_without_account_carries_fallback_identity() {
    let mut h = Harness::new(StaticNames::default(), ScriptedDirectory::default());
    let result = resolve_one(&mut h, MappingRequest::uid_to_sid(4242));
    assert_eq!(result.status, Err(IdmapError::NotFound));
    assert_eq!(result.id, Some(Identity::Sid(Sid::new(MACHINE_SID, 5242))));
    assert_eq!(result.identity(), None);
}

#[test]
fn ephemeral_source_id_is_not_mapped() {
    let mut h = Harness::new(StaticNames::default(), ScriptedDirectory::default());
    let result = resolve_one(&mut h, MappingRequest::uid_to_sid(EPHEMERAL_BASE + 7));
    assert_eq!(result.status, Err(IdmapError::NoMapping));
}

// ============================================================================
// Single-principal lookups
// ============================================================================

#[test]
fn lookup_by_windows_name() {
    let names = StaticNames::default().with_user("bob", 501);
    let mut h = Harness::new(names, bob_directory());
    add_rule(&mut h, &sfbay_wildcard());

    let found = get_w2u_mapping(&h.ctx, &mut h.stores, &W2uLookup::by_name("bob@SFBAY", IdType::PosixId))
        .expect("bob");
    assert_eq!(found.sid, domain_sid(BOB_RID));
    assert_eq!(found.posix, Identity::Uid(501));
    assert_eq!(found.unixname.as_deref(), Some("bob"));
    assert_eq!(found.windomain.as_deref(), Some("SFBAY"));

    // The domain defaults to the mapping domain.
    let found = get_w2u_mapping(&h.ctx, &mut h.stores, &W2uLookup::by_name("bob", IdType::Uid))
        .expect("bob");
    assert_eq!(found.posix, Identity::Uid(501));

    let err = get_w2u_mapping(&h.ctx, &mut h.stores, &W2uLookup::by_name("bob", IdType::Sid))
        .expect_err("sid target");
    assert_eq!(err, IdmapError::UnsupportedType);
}

#[test]
fn lookup_by_unix_name() {
    let names = StaticNames::default().with_user("bob", 501);
    let mut h = Harness::new(names, bob_directory());
    add_rule(&mut h, &sfbay_wildcard());

    let lookup = U2wLookup {
        pid: None,
        unixname: Some("bob".to_string()),
        is_user: true,
        flags: RequestFlags::default(),
    };
    let found = get_u2w_mapping(&h.ctx, &mut h.stores, &lookup).expect("bob");
    assert_eq!(found.sid, domain_sid(BOB_RID));
    assert_eq!(found.posix, Identity::Uid(501));
    assert_eq!(found.winname.as_deref(), Some("bob"));

    let empty = U2wLookup {
        unixname: None,
        ..lookup
    };
    assert!(matches!(
        get_u2w_mapping(&h.ctx, &mut h.stores, &empty),
        Err(IdmapError::InvalidArgument(_))
    ));
}
