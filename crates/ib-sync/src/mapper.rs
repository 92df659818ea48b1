//! Entity mapper: directory paths and canonical attribute sets for mirrored
//! groups, users and roles.

use ib_common::{Entry, IAM_ACCOUNT_CLASS, IAM_GROUP_CLASS, IAM_ROLE_CLASS};
use uuid::Uuid;

pub const USERS_OU: &str = "users";
pub const GROUPS_OU: &str = "groups";
pub const ROLES_OU: &str = "roles";

// Account-aging placeholders describing a non-expiring account
const SHADOW_LAST_CHANGE: &str = "10877";
const SHADOW_EXPIRE: &str = "-1";
const SHADOW_INACTIVE: &str = "-1";
const SHADOW_FLAG: &str = "0";
const SHADOW_WARNING: &str = "7";
const SHADOW_MIN: &str = "0";
const SHADOW_MAX: &str = "999999";
const LOGIN_SHELL: &str = "/bin/bash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    User,
    Role,
}

/// Everything needed to render a mirrored account entry.
#[derive(Debug, Clone)]
pub struct AccountSpec<'a> {
    pub kind: AccountKind,
    pub name: &'a str,
    pub uid_number: u32,
    pub gid_number: u32,
    pub access_key: &'a str,
}

/// Paths of the mirrored subtrees below the configured root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLayout {
    root_dn: String,
}

impl DirectoryLayout {
    pub fn new(root_dn: impl Into<String>) -> Self {
        Self { root_dn: root_dn.into() }
    }

    pub fn root_dn(&self) -> &str {
        &self.root_dn
    }

    pub fn users_dn(&self) -> String {
        format!("ou={},{}", USERS_OU, self.root_dn)
    }

    pub fn groups_dn(&self) -> String {
        format!("ou={},{}", GROUPS_OU, self.root_dn)
    }

    pub fn roles_dn(&self) -> String {
        format!("ou={},{}", ROLES_OU, self.root_dn)
    }

    /// The three container paths, in creation order
    pub fn containers(&self) -> [String; 3] {
        [self.users_dn(), self.groups_dn(), self.roles_dn()]
    }

    pub fn group_dn(&self, name: &str) -> String {
        format!("cn={},{}", escape_rdn_value(name), self.groups_dn())
    }

    pub fn user_dn(&self, name: &str) -> String {
        format!("uid={},{}", escape_rdn_value(name), self.users_dn())
    }

    pub fn role_dn(&self, name: &str) -> String {
        format!("uid={},{}", escape_rdn_value(name), self.roles_dn())
    }

    pub fn account_dn(&self, kind: AccountKind, name: &str) -> String {
        match kind {
            AccountKind::User => self.user_dn(name),
            AccountKind::Role => self.role_dn(name),
        }
    }

    /// Organizational unit container entry for `ou`
    pub fn container_entry(&self, ou: &str) -> Entry {
        Entry::new(format!("ou={},{}", ou, self.root_dn))
            .with_class("organizationalUnit")
            .with_attr("ou", ou)
    }

    /// New mirrored group, without members
    pub fn group_entry(&self, name: &str, gid_number: u32) -> Entry {
        Entry::new(self.group_dn(name))
            .with_class("posixGroup")
            .with_class(IAM_GROUP_CLASS)
            .with_attr("cn", name)
            .with_attr("gidNumber", gid_number.to_string())
            .with_attr("entryUUID", Uuid::new_v4().to_string())
    }

    /// New mirrored user or role account
    pub fn account_entry(&self, spec: &AccountSpec<'_>) -> Entry {
        let mut entry = Entry::new(self.account_dn(spec.kind, spec.name))
            .with_class("posixAccount")
            .with_class("shadowAccount")
            .with_class(IAM_ACCOUNT_CLASS)
            .with_attr("uid", spec.name)
            .with_attr("cn", spec.name)
            .with_attr("uidNumber", spec.uid_number.to_string())
            .with_attr("gidNumber", spec.gid_number.to_string())
            .with_attr("accessKey", spec.access_key)
            .with_attr("shadowLastChange", SHADOW_LAST_CHANGE)
            .with_attr("shadowExpire", SHADOW_EXPIRE)
            .with_attr("shadowInactive", SHADOW_INACTIVE)
            .with_attr("shadowFlag", SHADOW_FLAG)
            .with_attr("shadowWarning", SHADOW_WARNING)
            .with_attr("shadowMin", SHADOW_MIN)
            .with_attr("shadowMax", SHADOW_MAX)
            .with_attr("loginShell", LOGIN_SHELL)
            .with_attr("homeDirectory", format!("/home/{}", spec.name))
            .with_attr("entryUUID", Uuid::new_v4().to_string());

        if spec.kind == AccountKind::Role {
            entry = entry.with_class(IAM_ROLE_CLASS);
        }
        entry
    }
}

/// Escape the characters that are special inside an RDN value.
pub fn escape_rdn_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '#' if i == 0 => out.push_str("\\#"),
            _ => out.push(c),
        }
    }
    out
}
