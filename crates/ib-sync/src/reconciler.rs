//! Reconciler
//!
//! One poll cycle converges the mirrored subtrees of the directory towards the
//! IAM provider's current listing:
//! - groups are get-or-created by name
//! - users with a resolvable primary group and an active access key are
//!   get-or-created, their `accessKey` and `gidNumber` refreshed in place
//! - each user's name is added to its primary group's `memberUid`, and removed
//!   from any other mirrored group once the user listing completed
//!
//! Entries are never deleted incrementally. The only deletion path is the
//! destructive clear of the mirrored subtrees, which runs at most once per
//! state store.

use std::collections::BTreeMap;
use std::sync::Arc;

use ib_common::{IamGroup, IamRole, IamUser, IAM_GROUP_CLASS, IAM_ROLE_CLASS};
use ib_directory::{normalize_dn, DirectoryError, DirectoryStore, Filter, Lookup, Modification};
use ib_iam::{collect_all, IdentityProvider};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::mapper::{AccountKind, AccountSpec, DirectoryLayout, GROUPS_OU, ROLES_OU, USERS_OU};
use crate::report::{ItemKind, SyncReport};
use crate::state::{IdAllocator, Namespace, SyncStateStore};
use crate::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Clear the mirrored subtrees on the first cycle recorded by the state store
    pub clear_on_first_sync: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self { clear_on_first_sync: true }
    }
}

/// Why a user was not mirrored this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoGroups,
    GroupNotMirrored(String),
    NoActiveKey,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoGroups => write!(f, "no group memberships"),
            SkipReason::GroupNotMirrored(group) => write!(f, "primary group {} is not mirrored", group),
            SkipReason::NoActiveKey => write!(f, "no active access key"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Created,
    Updated,
    Unchanged,
}

enum UserOutcome {
    Mirrored { upsert: Upsert, member_added: bool, group_dn: String },
    Skipped(SkipReason),
}

pub struct Reconciler {
    directory: Arc<dyn DirectoryStore>,
    iam: Arc<dyn IdentityProvider>,
    allocator: Arc<dyn IdAllocator>,
    state: Arc<dyn SyncStateStore>,
    layout: DirectoryLayout,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        directory: Arc<dyn DirectoryStore>,
        iam: Arc<dyn IdentityProvider>,
        allocator: Arc<dyn IdAllocator>,
        state: Arc<dyn SyncStateStore>,
        layout: DirectoryLayout,
        options: ReconcileOptions,
    ) -> Self {
        Self { directory, iam, allocator, state, layout, options }
    }

    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    /// Run one poll cycle.
    ///
    /// Per-item failures are recorded in the report and the cycle continues.
    /// A failed listing request, or a directory failure while preparing the
    /// subtrees, aborts the cycle.
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let span = info_span!("sync_cycle", cycle_id = %Uuid::new_v4(), root = %self.layout.root_dn());
        self.cycle().instrument(span).await
    }

    async fn cycle(&self) -> Result<SyncReport> {
        let mut report = SyncReport::new();

        self.ensure_layout().await?;

        if self.options.clear_on_first_sync && !self.state.initial_clear_done().await? {
            report.cleared = self.clear_mirrored_subtrees().await?;
        }

        self.sync_groups(&mut report).await?;
        self.sync_users(&mut report).await?;

        let report = report.complete();
        info!(
            groups_created = report.groups_created,
            accounts_created = report.accounts_created,
            accounts_updated = report.accounts_updated,
            skipped = report.skipped,
            members_added = report.members_added,
            members_pruned = report.members_pruned,
            failed = report.failed(),
            duration_ms = report.duration_ms(),
            "Sync cycle completed"
        );
        metrics::counter!("sync.cycles_total").increment(1);
        Ok(report)
    }

    /// Create the users, groups and roles containers when missing.
    pub async fn ensure_layout(&self) -> Result<()> {
        for ou in [USERS_OU, GROUPS_OU, ROLES_OU] {
            let entry = self.layout.container_entry(ou);
            if self.directory.exists(&entry.dn).await? {
                continue;
            }
            let dn = entry.dn.clone();
            match self.directory.create(entry).await {
                Ok(()) => info!(dn = %dn, "Created mirrored container"),
                Err(DirectoryError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Delete every entry below the users, groups and roles containers and
    /// record that the initial clear happened. Irreversible.
    pub async fn clear_mirrored_subtrees(&self) -> Result<usize> {
        warn!(root = %self.layout.root_dn(), "Clearing mirrored subtrees");

        let mut deleted = 0;
        for base in self.layout.containers() {
            let entries = match self.directory.search(&base, &Filter::any()).await {
                Ok(entries) => entries,
                Err(DirectoryError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let base_key = normalize_dn(&base);
            let mut dns: Vec<String> = entries
                .into_iter()
                .map(|entry| entry.dn)
                .filter(|dn| normalize_dn(dn) != base_key)
                .collect();
            // Deepest first so no entry is deleted before its children
            dns.sort_by_key(|dn| std::cmp::Reverse(dn.matches(',').count()));

            for dn in dns {
                self.directory.delete(&dn).await?;
                deleted += 1;
            }
        }

        self.state.mark_initial_clear_done().await?;
        metrics::counter!("sync.cleared_entries_total").increment(deleted as u64);
        warn!(deleted, "Mirrored subtrees cleared");
        Ok(deleted)
    }

    async fn sync_groups(&self, report: &mut SyncReport) -> Result<()> {
        let iam = self.iam.as_ref();
        let groups: Vec<IamGroup> = collect_all(move |marker| iam.list_groups(marker))
            .await
            .map_err(|source| SyncError::Listing { entity: "groups", source })?;
        debug!(count = groups.len(), "Listed groups");

        for group in groups {
            match self.ensure_group(&group.group_name, &group.arn).await {
                Ok((true, gid)) => {
                    info!(group = %group.group_name, gid, "Mirrored group created");
                    report.groups_created += 1;
                    metrics::counter!("sync.groups_created_total").increment(1);
                }
                Ok((false, _)) => report.groups_existing += 1,
                Err(e) => {
                    warn!(group = %group.group_name, error = %e, transient = e.is_transient(), "Failed to sync group");
                    report.record_failure(ItemKind::Group, &group.group_name, &e);
                    metrics::counter!("sync.items_failed_total", "kind" => "group").increment(1);
                }
            }
        }
        Ok(())
    }

    async fn sync_users(&self, report: &mut SyncReport) -> Result<()> {
        let iam = self.iam.as_ref();
        let users: Vec<IamUser> = collect_all(move |marker| iam.list_users(marker))
            .await
            .map_err(|source| SyncError::Listing { entity: "users", source })?;
        debug!(count = users.len(), "Listed users");

        // user name -> normalized primary group path, for names mirrored this cycle
        let mut resolved: BTreeMap<String, String> = BTreeMap::new();

        for user in users {
            match self.sync_user(&user).await {
                Ok(UserOutcome::Mirrored { upsert, member_added, group_dn }) => {
                    match upsert {
                        Upsert::Created => {
                            info!(user = %user.user_name, "Mirrored user created");
                            report.accounts_created += 1;
                            metrics::counter!("sync.accounts_created_total").increment(1);
                        }
                        Upsert::Updated => {
                            info!(user = %user.user_name, "Mirrored user updated");
                            report.accounts_updated += 1;
                            metrics::counter!("sync.accounts_updated_total").increment(1);
                        }
                        Upsert::Unchanged => report.accounts_unchanged += 1,
                    }
                    if member_added {
                        report.members_added += 1;
                    }
                    resolved.insert(user.user_name.clone(), normalize_dn(&group_dn));
                }
                Ok(UserOutcome::Skipped(reason)) => {
                    warn!(user = %user.user_name, reason = %reason, "Skipping user");
                    report.skipped += 1;
                    metrics::counter!("sync.items_skipped_total", "kind" => "user").increment(1);
                }
                Err(e) => {
                    warn!(user = %user.user_name, error = %e, transient = e.is_transient(), "Failed to sync user");
                    report.record_failure(ItemKind::User, &user.user_name, &e);
                    metrics::counter!("sync.items_failed_total", "kind" => "user").increment(1);
                }
            }
        }

        self.prune_memberships(&resolved, report).await;
        Ok(())
    }

    async fn sync_user(&self, user: &IamUser) -> Result<UserOutcome> {
        let memberships = self.iam.list_groups_for_user(&user.user_name).await?;
        // Provider order decides; there is no tie-break between several groups
        let Some(primary) = memberships.first() else {
            return Ok(UserOutcome::Skipped(SkipReason::NoGroups));
        };

        let group_dn = self.layout.group_dn(&primary.group_name);
        let gid = match self.directory.lookup(&group_dn, &["gidNumber"]).await? {
            Lookup::Found(entry) => mirrored_gid(&entry)?,
            Lookup::NotFound => {
                return Ok(UserOutcome::Skipped(SkipReason::GroupNotMirrored(
                    primary.group_name.clone(),
                )))
            }
        };

        let keys = self.iam.list_access_keys(&user.user_name).await?;
        let Some(key) = keys.iter().find(|k| k.is_active()) else {
            return Ok(UserOutcome::Skipped(SkipReason::NoActiveKey));
        };

        let upsert = self
            .upsert_account(
                AccountKind::User,
                &user.user_name,
                &user.arn,
                gid,
                &key.access_key_id,
            )
            .await?;
        let member_added = self.add_member(&group_dn, &user.user_name).await?;

        Ok(UserOutcome::Mirrored { upsert, member_added, group_dn })
    }

    /// Mirror every role as an account in its own group.
    ///
    /// Not part of the scheduled cycle.
    pub async fn sync_roles(&self) -> Result<SyncReport> {
        let mut report = SyncReport::new();
        self.ensure_layout().await?;

        let iam = self.iam.as_ref();
        let roles: Vec<IamRole> = collect_all(move |marker| iam.list_roles(marker))
            .await
            .map_err(|source| SyncError::Listing { entity: "roles", source })?;
        debug!(count = roles.len(), "Listed roles");

        for role in roles {
            if let Err(e) = self.sync_role(&role, &mut report).await {
                warn!(role = %role.role_name, error = %e, "Failed to sync role");
                report.record_failure(ItemKind::Role, &role.role_name, &e);
                metrics::counter!("sync.items_failed_total", "kind" => "role").increment(1);
            }
        }

        Ok(report.complete())
    }

    async fn sync_role(&self, role: &IamRole, report: &mut SyncReport) -> Result<()> {
        let (group_created, gid) = self.ensure_group(&role.role_name, &role.arn).await?;
        if group_created {
            report.groups_created += 1;
        } else {
            report.groups_existing += 1;
        }

        // A role has no access keys of its own; its id stands in
        let upsert = self
            .upsert_account(AccountKind::Role, &role.role_name, &role.arn, gid, &role.role_id)
            .await?;
        match upsert {
            Upsert::Created => {
                info!(role = %role.role_name, "Mirrored role created");
                report.accounts_created += 1;
            }
            Upsert::Updated => report.accounts_updated += 1,
            Upsert::Unchanged => report.accounts_unchanged += 1,
        }

        let group_dn = self.layout.group_dn(&role.role_name);
        if self.add_member(&group_dn, &role.role_name).await? {
            report.members_added += 1;
        }
        Ok(())
    }

    /// Get-or-create a mirrored group. Returns whether it was created, and its gid.
    async fn ensure_group(&self, name: &str, key: &str) -> Result<(bool, u32)> {
        let dn = self.layout.group_dn(name);
        match self.directory.lookup(&dn, &["gidNumber"]).await? {
            Lookup::Found(entry) => Ok((false, mirrored_gid(&entry)?)),
            Lookup::NotFound => {
                let gid = self.allocator.allocate(Namespace::Groups, key).await?;
                self.directory.create(self.layout.group_entry(name, gid)).await?;
                Ok((true, gid))
            }
        }
    }

    async fn upsert_account(
        &self,
        kind: AccountKind,
        name: &str,
        key: &str,
        gid: u32,
        access_key: &str,
    ) -> Result<Upsert> {
        let dn = self.layout.account_dn(kind, name);
        match self.directory.lookup(&dn, &[]).await? {
            Lookup::Found(entry) => {
                if !entry.is_mirrored_account() {
                    return Err(SyncError::Conflict { dn });
                }
                let gid = gid.to_string();
                if entry.first("accessKey") == Some(access_key)
                    && entry.first("gidNumber") == Some(gid.as_str())
                {
                    return Ok(Upsert::Unchanged);
                }
                self.directory
                    .modify(
                        &dn,
                        vec![
                            Modification::replace("accessKey", access_key),
                            Modification::replace("gidNumber", gid),
                        ],
                    )
                    .await?;
                Ok(Upsert::Updated)
            }
            Lookup::NotFound => {
                let uid = self.allocator.allocate(Namespace::Users, key).await?;
                let entry = self.layout.account_entry(&AccountSpec {
                    kind,
                    name,
                    uid_number: uid,
                    gid_number: gid,
                    access_key,
                });
                self.directory.create(entry).await?;
                Ok(Upsert::Created)
            }
        }
    }

    /// Add `name` to the group's `memberUid` unless already present.
    async fn add_member(&self, group_dn: &str, name: &str) -> Result<bool> {
        let entry = match self.directory.lookup(group_dn, &["memberUid"]).await? {
            Lookup::Found(entry) => entry,
            Lookup::NotFound => return Err(DirectoryError::NotFound(group_dn.to_string()).into()),
        };
        if entry.contains_value("memberUid", name) {
            return Ok(false);
        }
        self.directory
            .modify(group_dn, vec![Modification::add("memberUid", name)])
            .await?;
        debug!(group = %group_dn, member = %name, "Membership added");
        Ok(true)
    }

    /// Remove names resolved this cycle from every mirrored group other than
    /// the one they resolved to. Names not resolved this cycle are left alone.
    async fn prune_memberships(&self, resolved: &BTreeMap<String, String>, report: &mut SyncReport) {
        if resolved.is_empty() {
            return;
        }

        let groups = match self
            .directory
            .search(&self.layout.groups_dn(), &Filter::ObjectClass(IAM_GROUP_CLASS.to_string()))
            .await
        {
            Ok(groups) => groups,
            Err(e) => {
                warn!(error = %e, "Failed to list mirrored groups for membership pruning");
                report.record_failure(ItemKind::Membership, &self.layout.groups_dn(), &e.into());
                return;
            }
        };

        for group in groups {
            let group_key = normalize_dn(&group.dn);
            let group_gid = group.first("gidNumber").map(str::to_string);
            let mut stale: Vec<String> = Vec::new();
            for member in group.values("memberUid") {
                let moved = resolved
                    .get(member.as_str())
                    .is_some_and(|primary| primary != &group_key);
                if moved && !self.held_by_role(member, group_gid.as_deref()).await {
                    stale.push(member.clone());
                }
            }
            if stale.is_empty() {
                continue;
            }

            let modifications = stale
                .iter()
                .map(|member| Modification::delete("memberUid", member.as_str()))
                .collect();
            match self.directory.modify(&group.dn, modifications).await {
                Ok(()) => {
                    info!(group = %group.dn, removed = ?stale, "Stale memberships pruned");
                    report.members_pruned += stale.len();
                }
                Err(e) => {
                    warn!(group = %group.dn, error = %e, "Failed to prune memberships");
                    report.record_failure(ItemKind::Membership, &group.dn, &e.into());
                }
            }
        }
    }

    /// True when `name` is also a mirrored role whose own group has `gid`.
    /// A user and a role may share a name; the role's membership stays.
    async fn held_by_role(&self, name: &str, gid: Option<&str>) -> bool {
        let Some(gid) = gid else {
            return false;
        };
        match self.directory.lookup(&self.layout.role_dn(name), &["gidNumber"]).await {
            Ok(Lookup::Found(entry)) => {
                entry.has_object_class(IAM_ROLE_CLASS) && entry.first("gidNumber") == Some(gid)
            }
            Ok(Lookup::NotFound) => false,
            Err(e) => {
                // Unknown ownership: keep the membership until a later cycle
                warn!(member = %name, error = %e, "Cannot check role account, membership kept");
                true
            }
        }
    }
}

/// gid of an entry found at a mirrored group path; native entries conflict.
fn mirrored_gid(entry: &ib_common::Entry) -> Result<u32> {
    if !entry.has_object_class(IAM_GROUP_CLASS) {
        return Err(SyncError::Conflict { dn: entry.dn.clone() });
    }
    entry
        .first("gidNumber")
        .and_then(|gid| gid.parse().ok())
        .ok_or_else(|| SyncError::MalformedEntry {
            dn: entry.dn.clone(),
            reason: "missing or invalid gidNumber".to_string(),
        })
}
