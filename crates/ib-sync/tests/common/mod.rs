//! Shared mock IAM provider for reconciler and scheduler tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ib_common::{AccessKeyMetadata, IamGroup, IamRole, IamUser, Page};
use ib_directory::MemoryDirectory;
use ib_iam::{IamError, IdentityProvider};
use ib_sync::{DirectoryLayout, ReconcileOptions, Reconciler, SqliteStateStore};
use tokio::sync::Notify;

pub const ROOT: &str = "dc=iam,dc=example";
const ACCOUNT: &str = "123456789012";

pub fn iam_group(name: &str) -> IamGroup {
    IamGroup {
        group_name: name.to_string(),
        group_id: format!("AGPA{}", name.to_uppercase()),
        arn: format!("arn:aws:iam::{}:group/{}", ACCOUNT, name),
        path: "/".to_string(),
    }
}

pub fn iam_user(name: &str) -> IamUser {
    IamUser {
        user_name: name.to_string(),
        user_id: format!("AIDA{}", name.to_uppercase()),
        arn: format!("arn:aws:iam::{}:user/{}", ACCOUNT, name),
        path: "/".to_string(),
    }
}

pub fn iam_role(name: &str) -> IamRole {
    IamRole {
        role_name: name.to_string(),
        role_id: format!("AROA{}", name.to_uppercase()),
        arn: format!("arn:aws:iam::{}:role/{}", ACCOUNT, name),
        path: "/".to_string(),
    }
}

/// In-memory IAM provider with marker pagination and failure switches
pub struct MockIdentityProvider {
    groups: parking_lot::Mutex<Vec<IamGroup>>,
    users: parking_lot::Mutex<Vec<IamUser>>,
    roles: parking_lot::Mutex<Vec<IamRole>>,
    memberships: parking_lot::Mutex<HashMap<String, Vec<String>>>,
    keys: parking_lot::Mutex<HashMap<String, Vec<AccessKeyMetadata>>>,
    failing_users: parking_lot::Mutex<HashSet<String>>,
    page_size: usize,
    fail_user_listing: AtomicBool,
    group_list_calls: AtomicU32,
    role_list_calls: AtomicU32,
    // First group listing waits here when set
    gate: parking_lot::Mutex<Option<Arc<Notify>>>,
    pub entered: Arc<Notify>,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            groups: parking_lot::Mutex::new(Vec::new()),
            users: parking_lot::Mutex::new(Vec::new()),
            roles: parking_lot::Mutex::new(Vec::new()),
            memberships: parking_lot::Mutex::new(HashMap::new()),
            keys: parking_lot::Mutex::new(HashMap::new()),
            failing_users: parking_lot::Mutex::new(HashSet::new()),
            page_size,
            fail_user_listing: AtomicBool::new(false),
            group_list_calls: AtomicU32::new(0),
            role_list_calls: AtomicU32::new(0),
            gate: parking_lot::Mutex::new(None),
            entered: Arc::new(Notify::new()),
        }
    }

    pub fn add_group(&self, name: &str) {
        self.groups.lock().push(iam_group(name));
    }

    /// Add a user in the given groups (provider order) with the given keys
    pub fn add_user(&self, name: &str, groups: &[&str], keys: Vec<AccessKeyMetadata>) {
        self.users.lock().push(iam_user(name));
        self.set_memberships(name, groups);
        self.keys.lock().insert(name.to_string(), keys);
    }

    pub fn add_role(&self, name: &str) {
        self.roles.lock().push(iam_role(name));
    }

    pub fn set_memberships(&self, user: &str, groups: &[&str]) {
        self.memberships
            .lock()
            .insert(user.to_string(), groups.iter().map(|g| g.to_string()).collect());
    }

    pub fn set_keys(&self, user: &str, keys: Vec<AccessKeyMetadata>) {
        self.keys.lock().insert(user.to_string(), keys);
    }

    /// Make per-user lookups for `user` fail as unavailable
    pub fn fail_user(&self, user: &str, fail: bool) {
        let mut failing = self.failing_users.lock();
        if fail {
            failing.insert(user.to_string());
        } else {
            failing.remove(user);
        }
    }

    pub fn fail_user_listing(&self, fail: bool) {
        self.fail_user_listing.store(fail, Ordering::SeqCst);
    }

    pub fn block_next_group_listing(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn group_list_calls(&self) -> u32 {
        self.group_list_calls.load(Ordering::SeqCst)
    }

    pub fn role_list_calls(&self) -> u32 {
        self.role_list_calls.load(Ordering::SeqCst)
    }

    fn page<T: Clone>(&self, all: &[T], marker: Option<String>) -> ib_iam::Result<Page<T>> {
        let start: usize = match marker {
            Some(m) => m
                .parse()
                .map_err(|_| IamError::Service(format!("bad marker {}", m)))?,
            None => 0,
        };
        let end = (start + self.page_size).min(all.len());
        let items = all[start.min(end)..end].to_vec();
        if end < all.len() {
            Ok(Page::continued(items, end.to_string()))
        } else {
            Ok(Page::last(items))
        }
    }

    fn check_user(&self, user: &str) -> ib_iam::Result<()> {
        if self.failing_users.lock().contains(user) {
            return Err(IamError::Unavailable(format!("lookup for {} timed out", user)));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn list_groups(&self, marker: Option<String>) -> ib_iam::Result<Page<IamGroup>> {
        self.group_list_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        let groups = self.groups.lock().clone();
        self.page(&groups, marker)
    }

    async fn list_users(&self, marker: Option<String>) -> ib_iam::Result<Page<IamUser>> {
        if self.fail_user_listing.load(Ordering::SeqCst) {
            return Err(IamError::Unavailable("connection reset".to_string()));
        }
        let users = self.users.lock().clone();
        self.page(&users, marker)
    }

    async fn list_roles(&self, marker: Option<String>) -> ib_iam::Result<Page<IamRole>> {
        self.role_list_calls.fetch_add(1, Ordering::SeqCst);
        let roles = self.roles.lock().clone();
        self.page(&roles, marker)
    }

    async fn list_groups_for_user(&self, user_name: &str) -> ib_iam::Result<Vec<IamGroup>> {
        self.check_user(user_name)?;
        Ok(self
            .memberships
            .lock()
            .get(user_name)
            .map(|names| names.iter().map(|n| iam_group(n)).collect())
            .unwrap_or_default())
    }

    async fn list_access_keys(&self, user_name: &str) -> ib_iam::Result<Vec<AccessKeyMetadata>> {
        self.check_user(user_name)?;
        Ok(self.keys.lock().get(user_name).cloned().unwrap_or_default())
    }
}

pub fn reconciler(
    directory: Arc<MemoryDirectory>,
    iam: Arc<MockIdentityProvider>,
    state: Arc<SqliteStateStore>,
    options: ReconcileOptions,
) -> Reconciler {
    Reconciler::new(
        directory,
        iam,
        state.clone(),
        state,
        DirectoryLayout::new(ROOT),
        options,
    )
}

pub struct Harness {
    pub directory: Arc<MemoryDirectory>,
    pub iam: Arc<MockIdentityProvider>,
    pub state: Arc<SqliteStateStore>,
    pub reconciler: Reconciler,
}

pub async fn harness(iam: MockIdentityProvider) -> Harness {
    harness_with(iam, MemoryDirectory::new(), ReconcileOptions::default()).await
}

pub async fn harness_with(
    iam: MockIdentityProvider,
    directory: MemoryDirectory,
    options: ReconcileOptions,
) -> Harness {
    let directory = Arc::new(directory);
    let iam = Arc::new(iam);
    let state = Arc::new(SqliteStateStore::in_memory().await.unwrap());
    let reconciler = reconciler(directory.clone(), iam.clone(), state.clone(), options);
    Harness { directory, iam, state, reconciler }
}
