//! Reconciler Tests
//!
//! Tests for:
//! - Group and user mirroring, idempotence across cycles
//! - Completeness filter (groups, active keys)
//! - Membership repair and pruning
//! - Native entry conflicts
//! - One-time destructive clear and identifier stability across restarts
//! - Role mirroring (not part of the scheduled cycle)

mod common;

use std::sync::Arc;

use common::*;
use ib_common::{AccessKeyMetadata, Entry, IAM_ACCOUNT_CLASS, IAM_ROLE_CLASS};
use ib_directory::{DirectoryStore, MemoryDirectory};
use ib_sync::{
    IdAllocator, ItemKind, Namespace, ReconcileOptions, SqliteStateStore, SyncError,
    SyncStateStore,
};

fn group_dn(name: &str) -> String {
    format!("cn={},ou=groups,{}", name, ROOT)
}

fn user_dn(name: &str) -> String {
    format!("uid={},ou=users,{}", name, ROOT)
}

fn members(directory: &MemoryDirectory, group: &str) -> Vec<String> {
    directory
        .get(&group_dn(group))
        .map(|e| e.values("memberUid").to_vec())
        .unwrap_or_default()
}

fn no_clear() -> ReconcileOptions {
    ReconcileOptions { clear_on_first_sync: false }
}

#[tokio::test]
async fn test_admins_alice_scenario() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    let h = harness(iam).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.groups_created, 1);
    assert_eq!(report.accounts_created, 1);
    assert_eq!(report.members_added, 1);
    assert!(!report.has_failures());

    let group = h.directory.get(&group_dn("admins")).unwrap();
    let gid = group.first("gidNumber").unwrap().to_string();
    assert!(Namespace::Groups.contains(gid.parse().unwrap()));

    let alice = h.directory.get(&user_dn("alice")).unwrap();
    assert!(alice.has_object_class(IAM_ACCOUNT_CLASS));
    assert_eq!(alice.first("gidNumber"), Some(gid.as_str()));
    assert_eq!(alice.first("accessKey"), Some("AKIA123"));
    assert!(Namespace::Users.contains(alice.first("uidNumber").unwrap().parse().unwrap()));
    assert_eq!(members(&h.directory, "admins"), vec!["alice".to_string()]);

    let entries_before = h.directory.len();
    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.created(), 0);
    assert_eq!(report.accounts_unchanged, 1);
    assert_eq!(report.members_added, 0);
    assert_eq!(h.directory.len(), entries_before);
    assert_eq!(members(&h.directory, "admins"), vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_three_cycles_are_idempotent() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_group("devs");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA1")]);
    iam.add_user("carol", &["devs", "admins"], vec![AccessKeyMetadata::active("AKIA2")]);
    iam.add_user("dave", &["devs"], vec![AccessKeyMetadata::active("AKIA3")]);
    let h = harness(iam).await;

    h.reconciler.run_cycle().await.unwrap();
    let snapshot: Vec<Option<Entry>> = ["alice", "carol", "dave"]
        .iter()
        .map(|u| h.directory.get(&user_dn(u)))
        .collect();
    let entries = h.directory.len();

    for _ in 0..2 {
        let report = h.reconciler.run_cycle().await.unwrap();
        assert_eq!(report.created(), 0);
        assert_eq!(report.accounts_updated, 0);
        assert_eq!(report.members_added, 0);
        assert_eq!(report.members_pruned, 0);
    }

    assert_eq!(h.directory.len(), entries);
    let after: Vec<Option<Entry>> = ["alice", "carol", "dave"]
        .iter()
        .map(|u| h.directory.get(&user_dn(u)))
        .collect();
    assert_eq!(snapshot, after);
    assert_eq!(members(&h.directory, "admins"), vec!["alice".to_string()]);
    assert_eq!(members(&h.directory, "devs"), vec!["carol".to_string(), "dave".to_string()]);
}

#[tokio::test]
async fn test_user_without_groups_is_not_created() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user("bob", &[], vec![AccessKeyMetadata::active("AKIABOB")]);
    let h = harness(iam).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.accounts_created, 0);
    assert!(h.directory.get(&user_dn("bob")).is_none());
    assert!(members(&h.directory, "admins").is_empty());
}

#[tokio::test]
async fn test_user_whose_group_is_not_mirrored_is_skipped() {
    let iam = MockIdentityProvider::new();
    iam.add_user("erin", &["ghost-group"], vec![AccessKeyMetadata::active("AKIAERIN")]);
    let h = harness(iam).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert!(h.directory.get(&user_dn("erin")).is_none());
}

#[tokio::test]
async fn test_inactive_keys_block_creation_until_activated() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user(
        "frank",
        &["admins"],
        vec![AccessKeyMetadata::inactive("AKIAOLD"), AccessKeyMetadata::inactive("AKIAOLDER")],
    );
    let h = harness(iam).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert!(h.directory.get(&user_dn("frank")).is_none());

    h.iam.set_keys(
        "frank",
        vec![AccessKeyMetadata::inactive("AKIAOLD"), AccessKeyMetadata::active("AKIANEW")],
    );
    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.accounts_created, 1);
    assert_eq!(h.directory.get(&user_dn("frank")).unwrap().first("accessKey"), Some("AKIANEW"));
}

#[tokio::test]
async fn test_rotated_key_is_replaced_in_place() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    let h = harness(iam).await;
    h.reconciler.run_cycle().await.unwrap();
    let uid = h.directory.get(&user_dn("alice")).unwrap().first("uidNumber").map(String::from);

    h.iam.set_keys(
        "alice",
        vec![AccessKeyMetadata::inactive("AKIA123"), AccessKeyMetadata::active("AKIA456")],
    );
    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.accounts_updated, 1);

    let alice = h.directory.get(&user_dn("alice")).unwrap();
    assert_eq!(alice.first("accessKey"), Some("AKIA456"));
    assert_eq!(alice.values("accessKey").len(), 1);
    assert_eq!(alice.first("uidNumber").map(String::from), uid);
}

#[tokio::test]
async fn test_user_deactivated_later_is_left_in_place() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    let h = harness(iam).await;
    h.reconciler.run_cycle().await.unwrap();

    h.iam.set_keys("alice", vec![AccessKeyMetadata::inactive("AKIA123")]);
    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.accounts_updated, 0);
    // No incremental deletion
    assert!(h.directory.get(&user_dn("alice")).is_some());
}

#[tokio::test]
async fn test_paginated_listings_are_drained() {
    let iam = MockIdentityProvider::with_page_size(2);
    for g in ["g1", "g2", "g3", "g4", "g5"] {
        iam.add_group(g);
    }
    for (i, u) in ["u1", "u2", "u3", "u4", "u5"].iter().enumerate() {
        let group = format!("g{}", i + 1);
        iam.add_user(u, &[group.as_str()], vec![AccessKeyMetadata::active(format!("AKIA{}", i))]);
    }
    let h = harness(iam).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.groups_created, 5);
    assert_eq!(report.accounts_created, 5);
    assert_eq!(h.iam.group_list_calls(), 3);

    let mut gids: Vec<String> = ["g1", "g2", "g3", "g4", "g5"]
        .iter()
        .map(|g| h.directory.get(&group_dn(g)).unwrap().first("gidNumber").unwrap().to_string())
        .collect();
    gids.sort();
    gids.dedup();
    assert_eq!(gids.len(), 5);
}

#[tokio::test]
async fn test_primary_group_change_moves_membership() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_group("ops");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    iam.add_user("bob", &["admins"], vec![AccessKeyMetadata::active("AKIABOB")]);
    let h = harness(iam).await;
    h.reconciler.run_cycle().await.unwrap();

    h.iam.set_memberships("alice", &["ops", "admins"]);
    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.accounts_updated, 1);
    assert_eq!(report.members_added, 1);
    assert_eq!(report.members_pruned, 1);

    assert_eq!(members(&h.directory, "admins"), vec!["bob".to_string()]);
    assert_eq!(members(&h.directory, "ops"), vec!["alice".to_string()]);
    let ops_gid = h.directory.get(&group_dn("ops")).unwrap().first("gidNumber").map(String::from);
    let alice_gid = h.directory.get(&user_dn("alice")).unwrap().first("gidNumber").map(String::from);
    assert_eq!(alice_gid, ops_gid);
}

#[tokio::test]
async fn test_transient_user_failure_keeps_membership() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_group("ops");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    iam.add_user("bob", &["ops"], vec![AccessKeyMetadata::active("AKIABOB")]);
    let h = harness(iam).await;
    h.reconciler.run_cycle().await.unwrap();

    h.iam.set_memberships("alice", &["ops"]);
    h.iam.fail_user("alice", true);
    let report = h.reconciler.run_cycle().await.unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.failures[0].kind, ItemKind::User);
    assert_eq!(report.failures[0].name, "alice");
    assert!(report.failures[0].transient);
    assert_eq!(report.members_pruned, 0);
    assert_eq!(members(&h.directory, "admins"), vec!["alice".to_string()]);
    assert_eq!(members(&h.directory, "ops"), vec!["bob".to_string()]);
}

#[tokio::test]
async fn test_item_failure_does_not_stop_cycle() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    iam.add_user("carol", &["admins"], vec![AccessKeyMetadata::active("AKIA789")]);
    iam.fail_user("alice", true);
    let h = harness(iam).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.failed(), 1);
    assert_eq!(report.accounts_created, 1);
    assert!(h.directory.get(&user_dn("alice")).is_none());
    assert!(h.directory.get(&user_dn("carol")).is_some());
}

#[tokio::test]
async fn test_listing_failure_aborts_cycle() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    iam.fail_user_listing(true);
    let h = harness(iam).await;

    let err = h.reconciler.run_cycle().await.unwrap_err();
    assert!(matches!(err, SyncError::Listing { entity: "users", .. }));
    // Groups listed before the failure stay mirrored
    assert!(h.directory.get(&group_dn("admins")).is_some());
    assert!(h.directory.get(&user_dn("alice")).is_none());
}

#[tokio::test]
async fn test_native_entry_at_mirrored_path_is_not_touched() {
    let native = Entry::new(user_dn("alice"))
        .with_class("inetOrgPerson")
        .with_attr("uid", "alice")
        .with_attr("userPassword", "{SSHA}abc");
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    let h = harness_with(iam, MemoryDirectory::with_entries([native.clone()]), no_clear()).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.failed(), 1);
    assert!(report.failures[0].message.contains("not a mirrored entry"));
    assert_eq!(h.directory.get(&user_dn("alice")), Some(native));
    assert!(members(&h.directory, "admins").is_empty());
}

#[tokio::test]
async fn test_layout_containers_are_created() {
    let h = harness(MockIdentityProvider::new()).await;
    h.reconciler.run_cycle().await.unwrap();

    for ou in ["users", "groups", "roles"] {
        let dn = format!("ou={},{}", ou, ROOT);
        assert!(h.directory.exists(&dn).await.unwrap(), "missing {}", dn);
    }
}

fn stale_directory() -> MemoryDirectory {
    MemoryDirectory::with_entries([
        Entry::new(format!("cn=admin,{}", ROOT)).with_class("person"),
        Entry::new(format!("ou=users,{}", ROOT)).with_class("organizationalUnit"),
        Entry::new(user_dn("ghost")).with_class(IAM_ACCOUNT_CLASS),
        Entry::new(format!("ou=groups,{}", ROOT)).with_class("organizationalUnit"),
        Entry::new(group_dn("old")).with_class("posixGroup"),
    ])
}

#[tokio::test]
async fn test_first_cycle_clears_mirrored_subtrees_once() {
    let h = harness_with(MockIdentityProvider::new(), stale_directory(), ReconcileOptions::default()).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.cleared, 2);
    assert!(h.directory.get(&user_dn("ghost")).is_none());
    assert!(h.directory.get(&group_dn("old")).is_none());
    // Outside the mirrored subtrees
    assert!(h.directory.get(&format!("cn=admin,{}", ROOT)).is_some());
    assert!(h.state.initial_clear_done().await.unwrap());

    h.directory.create(Entry::new(user_dn("late")).with_class(IAM_ACCOUNT_CLASS)).await.unwrap();
    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.cleared, 0);
    assert!(h.directory.get(&user_dn("late")).is_some());
}

#[tokio::test]
async fn test_clear_can_be_disabled() {
    let h = harness_with(MockIdentityProvider::new(), stale_directory(), no_clear()).await;

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.cleared, 0);
    assert!(h.directory.get(&user_dn("ghost")).is_some());
    assert!(!h.state.initial_clear_done().await.unwrap());
}

#[tokio::test]
async fn test_explicit_clear_marks_flag() {
    let h = harness_with(MockIdentityProvider::new(), stale_directory(), ReconcileOptions::default()).await;

    h.reconciler.ensure_layout().await.unwrap();
    let deleted = h.reconciler.clear_mirrored_subtrees().await.unwrap();
    assert_eq!(deleted, 2);
    assert!(h.state.initial_clear_done().await.unwrap());

    h.directory.create(Entry::new(user_dn("late")).with_class(IAM_ACCOUNT_CLASS)).await.unwrap();
    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.cleared, 0);
    assert!(h.directory.get(&user_dn("late")).is_some());
}

#[tokio::test]
async fn test_restart_keeps_ids_and_clear_flag() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("state.db").display());

    let iam = Arc::new(MockIdentityProvider::new());
    iam.add_group("admins");
    iam.add_user("alice", &["admins"], vec![AccessKeyMetadata::active("AKIA123")]);
    let directory = Arc::new(MemoryDirectory::new());

    let first_store = Arc::new(SqliteStateStore::connect(&url).await.unwrap());
    let first = reconciler(directory.clone(), iam.clone(), first_store.clone(), ReconcileOptions::default());
    first.run_cycle().await.unwrap();
    let uid = directory.get(&user_dn("alice")).unwrap().first("uidNumber").map(String::from);
    first_store.close().await;
    drop(first);

    // Lose the mirrored account, keep a marker entry the clear would remove
    directory.delete(&user_dn("alice")).await.unwrap();
    directory.create(Entry::new(user_dn("late")).with_class(IAM_ACCOUNT_CLASS)).await.unwrap();

    let second_store = Arc::new(SqliteStateStore::connect(&url).await.unwrap());
    let second = reconciler(directory.clone(), iam.clone(), second_store.clone(), ReconcileOptions::default());
    let report = second.run_cycle().await.unwrap();

    assert_eq!(report.cleared, 0);
    assert_eq!(report.accounts_created, 1);
    assert!(directory.get(&user_dn("late")).is_some());
    assert_eq!(directory.get(&user_dn("alice")).unwrap().first("uidNumber").map(String::from), uid);
    assert_eq!(
        second_store
            .allocated(Namespace::Users, &common::iam_user("alice").arn)
            .await
            .unwrap()
            .map(|id| id.to_string()),
        uid
    );
}

#[tokio::test]
async fn test_roles_are_not_part_of_the_cycle() {
    let iam = MockIdentityProvider::new();
    iam.add_role("deployer");
    let h = harness(iam).await;

    h.reconciler.run_cycle().await.unwrap();
    assert_eq!(h.iam.role_list_calls(), 0);
    assert!(h.directory.get(&format!("uid=deployer,ou=roles,{}", ROOT)).is_none());
}

#[tokio::test]
async fn test_sync_roles_mirrors_role_with_own_group() {
    let iam = MockIdentityProvider::new();
    iam.add_role("deployer");
    let h = harness(iam).await;

    let report = h.reconciler.sync_roles().await.unwrap();
    assert_eq!(report.groups_created, 1);
    assert_eq!(report.accounts_created, 1);

    let role = h.directory.get(&format!("uid=deployer,ou=roles,{}", ROOT)).unwrap();
    assert!(role.has_object_class(IAM_ACCOUNT_CLASS));
    assert!(role.has_object_class(IAM_ROLE_CLASS));
    assert_eq!(role.first("accessKey"), Some(iam_role("deployer").role_id.as_str()));

    let group = h.directory.get(&group_dn("deployer")).unwrap();
    assert_eq!(role.first("gidNumber"), group.first("gidNumber"));
    assert_eq!(members(&h.directory, "deployer"), vec!["deployer".to_string()]);

    let report = h.reconciler.sync_roles().await.unwrap();
    assert_eq!(report.created(), 0);
    assert_eq!(report.members_added, 0);
    assert_eq!(members(&h.directory, "deployer"), vec!["deployer".to_string()]);
}

#[tokio::test]
async fn test_user_sharing_role_name_keeps_role_group_membership() {
    let iam = MockIdentityProvider::new();
    iam.add_group("admins");
    iam.add_group("ops");
    iam.add_user("deployer", &["ops"], vec![AccessKeyMetadata::active("AKIADEP")]);
    iam.add_role("deployer");
    let h = harness(iam).await;

    h.reconciler.run_cycle().await.unwrap();
    h.reconciler.sync_roles().await.unwrap();
    assert_eq!(members(&h.directory, "deployer"), vec!["deployer".to_string()]);

    // The user moves; its old group is pruned, the role's own group is not
    h.iam.set_memberships("deployer", &["admins"]);
    let report = h.reconciler.run_cycle().await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(report.members_pruned, 1);
    assert!(members(&h.directory, "ops").is_empty());
    assert_eq!(members(&h.directory, "admins"), vec!["deployer".to_string()]);
    assert_eq!(members(&h.directory, "deployer"), vec!["deployer".to_string()]);

    let report = h.reconciler.run_cycle().await.unwrap();
    assert_eq!(report.members_pruned, 0);
    assert_eq!(members(&h.directory, "deployer"), vec!["deployer".to_string()]);
}
