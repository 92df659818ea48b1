//! External Identity Client Adapter
//!
//! Paginated listing of users, groups, roles and access keys from the IAM
//! provider, plus verification of an access-key/secret pair.
//!
//! ## Providers
//!
//! - `aws` feature: [`aws::AwsIdentityProvider`] (IAM) and
//!   [`aws::StsKeyPairVerifier`] (STS `GetCallerIdentity`)
//!
//! Tests use hand-written implementations of the traits.

use async_trait::async_trait;
use ib_common::{AccessKeyMetadata, IamGroup, IamRole, IamUser, Page};
use thiserror::Error;

#[cfg(feature = "aws")]
pub mod aws;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IamError {
    /// The provider could not be reached or did not answer in time
    #[error("IAM provider unavailable: {0}")]
    Unavailable(String),

    #[error("IAM provider rejected the configured credentials: {0}")]
    InvalidCredentials(String),

    #[error("IAM service error: {0}")]
    Service(String),
}

impl IamError {
    /// Transient failures that a later attempt may not see
    pub fn is_transient(&self) -> bool {
        matches!(self, IamError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, IamError>;

/// Static access-key/secret pair the bridge authenticates to the provider with.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    access_key: String,
    secret_key: String,
}

impl StaticCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Listing side of the IAM provider.
///
/// The `list_*` calls follow the provider's marker pagination: pass `None`
/// for the first page, then the previous page's `next_marker` while
/// `truncated` is set.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn list_groups(&self, marker: Option<String>) -> Result<Page<IamGroup>>;

    async fn list_users(&self, marker: Option<String>) -> Result<Page<IamUser>>;

    async fn list_roles(&self, marker: Option<String>) -> Result<Page<IamRole>>;

    /// Groups the user belongs to, in provider order
    async fn list_groups_for_user(&self, user_name: &str) -> Result<Vec<IamGroup>>;

    async fn list_access_keys(&self, user_name: &str) -> Result<Vec<AccessKeyMetadata>>;
}

/// Checks whether an access-key/secret pair is accepted by the provider.
///
/// `Ok(false)` means the provider answered and rejected the pair; an `Err`
/// means no answer could be obtained.
#[async_trait]
pub trait KeyPairVerifier: Send + Sync {
    async fn verify(&self, access_key: &str, secret_key: &str) -> Result<bool>;
}

/// Error codes with which the provider rejects a signed request's key pair
pub const REJECTION_CODES: &[&str] = &[
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "IncompleteSignature",
    "AccessDenied",
    "ExpiredToken",
    "InvalidAccessKeyId",
];

pub fn is_rejection_code(code: &str) -> bool {
    REJECTION_CODES.contains(&code)
}

/// Drain a marker-paginated listing into one vector.
///
/// Stops at the first page error; pages already fetched are discarded with it.
pub async fn collect_all<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut marker = None;
    loop {
        let page = fetch(marker.take()).await?;
        items.extend(page.items);
        match (page.truncated, page.next_marker) {
            (true, Some(next)) => marker = Some(next),
            _ => break,
        }
    }
    Ok(items)
}
