use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod logging;

// ============================================================================
// Marker Object Classes
// ============================================================================

/// Object class carried by every mirrored user and role account.
pub const IAM_ACCOUNT_CLASS: &str = "iam-account";

/// Object class carried by every mirrored group.
pub const IAM_GROUP_CLASS: &str = "iam-group";

/// Additional object class carried by mirrored role accounts.
pub const IAM_ROLE_CLASS: &str = "iam-role";

// ============================================================================
// Directory Entry
// ============================================================================

/// A directory entry as seen through the directory store adapter.
///
/// Attribute names are kept lower-cased so lookups are case-insensitive the
/// way LDAP attribute descriptions are. Object classes live in their own set
/// and are compared case-insensitively as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub dn: String,
    pub object_classes: BTreeSet<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            object_classes: BTreeSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.object_classes.insert(class.to_string());
        self
    }

    /// Set a single-valued attribute, replacing any previous values
    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.put(name, vec![value.into()]);
        self
    }

    pub fn put(&mut self, name: &str, values: Vec<String>) {
        self.attributes.insert(name.to_ascii_lowercase(), values);
    }

    pub fn add_value(&mut self, name: &str, value: impl Into<String>) {
        self.attributes
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Remove one value; the attribute disappears once it has no values left.
    /// Returns whether the value was present.
    pub fn remove_value(&mut self, name: &str, value: &str) -> bool {
        let key = name.to_ascii_lowercase();
        let Some(values) = self.attributes.get_mut(&key) else {
            return false;
        };
        let before = values.len();
        values.retain(|v| v != value);
        let removed = values.len() != before;
        if values.is_empty() {
            self.attributes.remove(&key);
        }
        removed
    }

    pub fn has_object_class(&self, class: &str) -> bool {
        self.object_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class))
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(|s| s.as_str())
    }

    pub fn contains_value(&self, name: &str, value: &str) -> bool {
        self.values(name).iter().any(|v| v == value)
    }

    /// True when the entry is a mirrored user or role account.
    pub fn is_mirrored_account(&self) -> bool {
        self.has_object_class(IAM_ACCOUNT_CLASS)
    }

    /// Copy restricted to the selected attributes. An empty selection keeps
    /// every attribute.
    pub fn select(&self, selectors: &[&str]) -> Entry {
        if selectors.is_empty() {
            return self.clone();
        }
        let attributes = self
            .attributes
            .iter()
            .filter(|(name, _)| selectors.iter().any(|s| s.eq_ignore_ascii_case(name)))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();
        Entry {
            dn: self.dn.clone(),
            object_classes: self.object_classes.clone(),
            attributes,
        }
    }
}

// ============================================================================
// External IAM Records
// ============================================================================

/// A group as reported by the IAM provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamGroup {
    pub group_name: String,
    pub group_id: String,
    pub arn: String,
    pub path: String,
}

/// A user as reported by the IAM provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamUser {
    pub user_name: String,
    pub user_id: String,
    pub arn: String,
    pub path: String,
}

/// A role as reported by the IAM provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamRole {
    pub role_name: String,
    pub role_id: String,
    pub arn: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKeyStatus {
    Active,
    Inactive,
}

impl From<&str> for AccessKeyStatus {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyMetadata {
    pub access_key_id: String,
    pub status: AccessKeyStatus,
}

impl AccessKeyMetadata {
    pub fn active(id: impl Into<String>) -> Self {
        Self { access_key_id: id.into(), status: AccessKeyStatus::Active }
    }

    pub fn inactive(id: impl Into<String>) -> Self {
        Self { access_key_id: id.into(), status: AccessKeyStatus::Inactive }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccessKeyStatus::Active
    }
}

/// One page of a marker-paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub truncated: bool,
    /// Continuation marker for the next request; only meaningful when truncated
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    /// A final page with no continuation
    pub fn last(items: Vec<T>) -> Self {
        Self { items, truncated: false, next_marker: None }
    }

    pub fn continued(items: Vec<T>, marker: impl Into<String>) -> Self {
        Self { items, truncated: true, next_marker: Some(marker.into()) }
    }
}
