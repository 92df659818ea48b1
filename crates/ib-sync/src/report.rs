//! Per-cycle outcome counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Which kind of mirrored entity an item failure or skip concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Group,
    User,
    Role,
    Membership,
}

/// One item that could not be synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub kind: ItemKind,
    pub name: String,
    pub message: String,
    /// The provider or directory was unavailable; a later cycle may succeed
    pub transient: bool,
}

/// Result of one poll cycle (or of an explicit role sync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub groups_created: usize,
    pub groups_existing: usize,
    pub accounts_created: usize,
    pub accounts_updated: usize,
    pub accounts_unchanged: usize,
    pub skipped: usize,
    pub members_added: usize,
    pub members_pruned: usize,
    /// Entries removed by the destructive clear, when it ran this cycle
    pub cleared: usize,
    pub failures: Vec<ItemFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn new() -> Self {
        Self {
            groups_created: 0,
            groups_existing: 0,
            accounts_created: 0,
            accounts_updated: 0,
            accounts_unchanged: 0,
            skipped: 0,
            members_added: 0,
            members_pruned: 0,
            cleared: 0,
            failures: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn record_failure(&mut self, kind: ItemKind, name: &str, error: &SyncError) {
        self.failures.push(ItemFailure {
            kind,
            name: name.to_string(),
            message: error.to_string(),
            transient: error.is_transient(),
        });
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Entries created in this cycle
    pub fn created(&self) -> usize {
        self.groups_created + self.accounts_created
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn complete(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }
}

impl Default for SyncReport {
    fn default() -> Self {
        Self::new()
    }
}
