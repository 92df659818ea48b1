//! Directory Store Adapter
//!
//! The bridge never talks to a directory server's internals directly. Every
//! read and write goes through [`DirectoryStore`], which implementations back
//! with an administrative session distinct from the binding client's own.
//!
//! Entries are atomic individually; there are no multi-entry transactions, so
//! callers order their writes (create an account before referencing it from a
//! group).

use async_trait::async_trait;
use ib_common::Entry;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryDirectory;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid operation on {dn}: {reason}")]
    Invalid { dn: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Outcome of a lookup: absence is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Entry),
    NotFound,
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// A single attribute change applied by [`DirectoryStore::modify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Replace all values of the attribute
    Replace { attr: String, values: Vec<String> },
    /// Append one value
    Add { attr: String, value: String },
    /// Remove one value
    Delete { attr: String, value: String },
}

impl Modification {
    pub fn replace(attr: &str, value: impl Into<String>) -> Self {
        Self::Replace { attr: attr.to_string(), values: vec![value.into()] }
    }

    pub fn add(attr: &str, value: impl Into<String>) -> Self {
        Self::Add { attr: attr.to_string(), value: value.into() }
    }

    pub fn delete(attr: &str, value: impl Into<String>) -> Self {
        Self::Delete { attr: attr.to_string(), value: value.into() }
    }
}

/// Search filter. Only what the bridge needs: match-all-with-attribute and
/// object class equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(attr=*)`
    Present(String),
    /// `(objectClass=value)`
    ObjectClass(String),
}

impl Filter {
    /// `(objectClass=*)`, every entry
    pub fn any() -> Self {
        Filter::Present("objectclass".to_string())
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::Present(attr) if attr.eq_ignore_ascii_case("objectclass") => true,
            Filter::Present(attr) => !entry.values(attr).is_empty(),
            Filter::ObjectClass(class) => entry.has_object_class(class),
        }
    }
}

/// Entry CRUD and subtree search against the directory.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn exists(&self, dn: &str) -> Result<bool>;

    /// Fetch an entry. An empty selector list returns every attribute.
    async fn lookup(&self, dn: &str, selectors: &[&str]) -> Result<Lookup>;

    /// Create a new entry; fails with `AlreadyExists` when the path is taken
    async fn create(&self, entry: Entry) -> Result<()>;

    /// Apply modifications to one entry atomically
    async fn modify(&self, dn: &str, modifications: Vec<Modification>) -> Result<()>;

    async fn delete(&self, dn: &str) -> Result<()>;

    /// Subtree search rooted at `base` (the base entry included)
    async fn search(&self, base: &str, filter: &Filter) -> Result<Vec<Entry>>;
}

/// Normalized form of a DN used for comparisons: lower-case, no spaces
/// around separators.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            rdn.split('=')
                .map(|part| part.trim().to_ascii_lowercase())
                .collect::<Vec<_>>()
                .join("=")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// True when `dn` equals `base` or lies beneath it.
pub fn is_within(dn: &str, base: &str) -> bool {
    let dn = normalize_dn(dn);
    let base = normalize_dn(base);
    dn == base || dn.ends_with(&format!(",{}", base))
}
