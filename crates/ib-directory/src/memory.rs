//! In-memory directory store
//!
//! Keeps entries in a map keyed by normalized DN. Used by the development
//! server and by tests in the other crates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ib_common::Entry;
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    is_within, normalize_dn, DirectoryError, DirectoryStore, Filter, Lookup, Modification,
    Result,
};

#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<BTreeMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory pre-populated with the given entries
    pub fn with_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let directory = Self::new();
        {
            let mut map = directory.entries.write();
            for entry in entries {
                map.insert(normalize_dn(&entry.dn), entry);
            }
        }
        directory
    }

    /// Make every operation fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of one entry, for assertions
    pub fn get(&self, dn: &str) -> Option<Entry> {
        self.entries.read().get(&normalize_dn(dn)).cloned()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("directory marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn exists(&self, dn: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.entries.read().contains_key(&normalize_dn(dn)))
    }

    async fn lookup(&self, dn: &str, selectors: &[&str]) -> Result<Lookup> {
        self.check_available()?;
        Ok(match self.entries.read().get(&normalize_dn(dn)) {
            Some(entry) => Lookup::Found(entry.select(selectors)),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, entry: Entry) -> Result<()> {
        self.check_available()?;
        let key = normalize_dn(&entry.dn);
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(DirectoryError::AlreadyExists(entry.dn));
        }
        debug!(dn = %entry.dn, "Entry created");
        entries.insert(key, entry);
        Ok(())
    }

    async fn modify(&self, dn: &str, modifications: Vec<Modification>) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write();
        let current = entries
            .get(&normalize_dn(dn))
            .ok_or_else(|| DirectoryError::NotFound(dn.to_string()))?;

        // Apply to a copy so a failing modification leaves the entry untouched
        let mut updated = current.clone();
        for modification in modifications {
            match modification {
                Modification::Replace { attr, values } => {
                    if values.is_empty() {
                        updated.attributes.remove(&attr.to_ascii_lowercase());
                    } else {
                        updated.put(&attr, values);
                    }
                }
                Modification::Add { attr, value } => {
                    if updated.contains_value(&attr, &value) {
                        return Err(DirectoryError::Invalid {
                            dn: dn.to_string(),
                            reason: format!("attribute {} already has value {}", attr, value),
                        });
                    }
                    updated.add_value(&attr, value);
                }
                Modification::Delete { attr, value } => {
                    if !updated.remove_value(&attr, &value) {
                        return Err(DirectoryError::Invalid {
                            dn: dn.to_string(),
                            reason: format!("attribute {} has no value {}", attr, value),
                        });
                    }
                }
            }
        }
        entries.insert(normalize_dn(dn), updated);
        Ok(())
    }

    async fn delete(&self, dn: &str) -> Result<()> {
        self.check_available()?;
        let key = normalize_dn(dn);
        let mut entries = self.entries.write();
        let has_children = entries
            .keys()
            .any(|other| other != &key && is_within(other, &key));
        if has_children {
            return Err(DirectoryError::Invalid {
                dn: dn.to_string(),
                reason: "entry has children".to_string(),
            });
        }
        entries
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| DirectoryError::NotFound(dn.to_string()))
    }

    async fn search(&self, base: &str, filter: &Filter) -> Result<Vec<Entry>> {
        self.check_available()?;
        let entries = self.entries.read();
        if !entries.contains_key(&normalize_dn(base)) {
            return Err(DirectoryError::NotFound(base.to_string()));
        }
        Ok(entries
            .iter()
            .filter(|(key, entry)| is_within(key, base) && filter.matches(entry))
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}
