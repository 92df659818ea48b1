//! IAM Bridge Sync
//!
//! Mirrors IAM users and groups into the directory:
//! - `state`: stable numeric id allocation and durable sync flags (SQLite)
//! - `mapper`: directory paths and attribute sets of mirrored entries
//! - `reconciler`: one poll cycle
//! - `scheduler`: periodic, non-overlapping execution of poll cycles

use ib_directory::DirectoryError;
use ib_iam::IamError;
use thiserror::Error;

pub mod mapper;
pub mod reconciler;
pub mod report;
pub mod scheduler;
pub mod state;

pub use mapper::{AccountKind, DirectoryLayout};
pub use reconciler::{ReconcileOptions, Reconciler, SkipReason};
pub use report::{ItemFailure, ItemKind, SyncReport};
pub use scheduler::{SchedulerConfig, SyncScheduler, TriggerOutcome};
pub use state::{AllocatorError, IdAllocator, Namespace, SqliteStateStore, SyncStateStore};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("IAM error: {0}")]
    Iam(#[from] IamError),

    #[error("Failed to list {entity}: {source}")]
    Listing {
        entity: &'static str,
        #[source]
        source: IamError,
    },

    #[error("State store error: {0}")]
    State(#[from] AllocatorError),

    /// A non-mirrored entry occupies a mirrored path
    #[error("Entry {dn} exists but is not a mirrored entry")]
    Conflict { dn: String },

    #[error("Malformed entry {dn}: {reason}")]
    MalformedEntry { dn: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// The provider or directory was unreachable rather than refusing the item
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Iam(e) | SyncError::Listing { source: e, .. } => e.is_transient(),
            SyncError::Directory(DirectoryError::Unavailable(_)) => true,
            _ => false,
        }
    }
}
