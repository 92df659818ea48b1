//! Mirrored and native bind strategies

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ib_directory::{DirectoryStore, Lookup};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::validator::{CredentialCheck, CredentialValidator};
use crate::{AuthError, AuthMethod, AuthStrategy, BindRequest, NativeAuthenticator, Principal, Result};

pub const DEFAULT_VALIDATOR_TIMEOUT: Duration = Duration::from_millis(5000);

/// Authenticates binds against mirrored accounts by validating the secret
/// with the IAM provider. Never writes to the directory.
pub struct MirroredStrategy {
    directory: Arc<dyn DirectoryStore>,
    validator: Arc<dyn CredentialValidator>,
    validator_timeout: Duration,
}

impl MirroredStrategy {
    pub fn new(directory: Arc<dyn DirectoryStore>, validator: Arc<dyn CredentialValidator>) -> Self {
        Self {
            directory,
            validator,
            validator_timeout: DEFAULT_VALIDATOR_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, validator_timeout: Duration) -> Self {
        self.validator_timeout = validator_timeout;
        self
    }
}

#[async_trait]
impl AuthStrategy for MirroredStrategy {
    fn name(&self) -> &str {
        "mirrored"
    }

    async fn try_authenticate(&self, request: &BindRequest) -> Result<Option<Principal>> {
        let entry = match self.directory.lookup(&request.dn, &[]).await {
            Ok(Lookup::Found(entry)) => entry,
            Ok(Lookup::NotFound) => return Err(AuthError::NoSuchAccount(request.dn.clone())),
            Err(e) => {
                warn!(dn = %request.dn, error = %e, "Cannot classify bind target");
                return Err(AuthError::Directory(e.to_string()));
            }
        };

        if !entry.is_mirrored_account() {
            return Ok(None);
        }

        let check = timeout(
            self.validator_timeout,
            self.validator.validate(&entry, &request.credentials),
        )
        .await;

        match check {
            Ok(Ok(CredentialCheck::Valid)) => {
                debug!(dn = %request.dn, client = ?request.client_addr, "Mirrored bind accepted");
                Ok(Some(Principal::new(request, AuthMethod::Mirrored, entry)))
            }
            Ok(Ok(CredentialCheck::Rejected)) => {
                debug!(dn = %request.dn, client = ?request.client_addr, "Mirrored bind rejected");
                Err(AuthError::InvalidCredentials(request.dn.clone()))
            }
            Ok(Err(e)) => {
                warn!(dn = %request.dn, error = %e, "Credential validation failed");
                Err(AuthError::ProviderUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(
                    dn = %request.dn,
                    timeout_ms = self.validator_timeout.as_millis() as u64,
                    "Credential validation timed out"
                );
                Err(AuthError::ProviderUnavailable(format!(
                    "credential validation timed out after {} ms",
                    self.validator_timeout.as_millis()
                )))
            }
        }
    }
}

/// Delegates to the directory's own authenticator, passing its result through
/// unchanged.
pub struct NativeStrategy {
    authenticator: Arc<dyn NativeAuthenticator>,
}

impl NativeStrategy {
    pub fn new(authenticator: Arc<dyn NativeAuthenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl AuthStrategy for NativeStrategy {
    fn name(&self) -> &str {
        "native"
    }

    async fn try_authenticate(&self, request: &BindRequest) -> Result<Option<Principal>> {
        self.authenticator.authenticate(request).await.map(Some)
    }
}
