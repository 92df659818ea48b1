//! Credential validation for mirrored accounts

use std::sync::Arc;

use async_trait::async_trait;
use ib_common::Entry;
use ib_iam::{IamError, KeyPairVerifier};
use thiserror::Error;
use tracing::debug;

/// Attribute holding the access key id of a mirrored account
pub const ACCESS_KEY_ATTR: &str = "accessKey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    Valid,
    Rejected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidatorError {
    #[error("Credential check could not complete: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, entry: &Entry, secret: &str) -> Result<CredentialCheck, ValidatorError>;
}

/// Pairs the entry's `accessKey` with the submitted secret and asks the IAM
/// provider whether the pair is genuine.
pub struct IamCredentialValidator {
    verifier: Arc<dyn KeyPairVerifier>,
}

impl IamCredentialValidator {
    pub fn new(verifier: Arc<dyn KeyPairVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl CredentialValidator for IamCredentialValidator {
    async fn validate(&self, entry: &Entry, secret: &str) -> Result<CredentialCheck, ValidatorError> {
        let Some(access_key) = entry.first(ACCESS_KEY_ATTR) else {
            debug!(dn = %entry.dn, "Mirrored entry has no access key");
            return Ok(CredentialCheck::Rejected);
        };
        // An empty secret would be an unauthenticated bind
        if secret.is_empty() {
            return Ok(CredentialCheck::Rejected);
        }

        match self.verifier.verify(access_key, secret).await {
            Ok(true) => Ok(CredentialCheck::Valid),
            Ok(false) | Err(IamError::InvalidCredentials(_)) => Ok(CredentialCheck::Rejected),
            Err(e) => Err(ValidatorError::Unavailable(e.to_string())),
        }
    }
}
