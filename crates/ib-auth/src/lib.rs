//! IAM Bridge Bind Authentication
//!
//! Every bind request goes through an [`AuthenticationDecider`], which tries a
//! pipeline of [`AuthStrategy`] implementations in order:
//!
//! 1. [`MirroredStrategy`]: applies to entries carrying the `iam-account`
//!    marker; validates the submitted secret against the IAM provider
//! 2. [`NativeStrategy`]: hands everything else, verbatim, to the directory's
//!    own authenticator
//!
//! A strategy that does not apply returns `Ok(None)`. An unreachable IAM
//! provider surfaces as [`AuthError::ProviderUnavailable`], never as a bad
//! credential.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ib_common::Entry;
use thiserror::Error;

pub mod decider;
pub mod strategy;
pub mod validator;

pub use decider::AuthenticationDecider;
pub use strategy::{MirroredStrategy, NativeStrategy};
pub use validator::{CredentialCheck, CredentialValidator, IamCredentialValidator, ValidatorError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No such account: {0}")]
    NoSuchAccount(String),

    #[error("Invalid credentials for {0}")]
    InvalidCredentials(String),

    /// The credential could not be checked; a later attempt may succeed
    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The target entry could not be read, so the bind cannot be classified
    #[error("Directory error: {0}")]
    Directory(String),

    #[error("No authenticator accepted the bind for {0}")]
    NoAuthenticator(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::ProviderUnavailable(_))
    }

    /// Errors after which the next strategy in the pipeline may still apply
    pub fn allows_fallback(&self) -> bool {
        matches!(self, AuthError::Directory(_))
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// A simple bind: target path, secret and the connection's endpoints.
#[derive(Clone)]
pub struct BindRequest {
    pub dn: String,
    pub credentials: String,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
}

impl BindRequest {
    pub fn new(dn: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            credentials: credentials.into(),
            client_addr: None,
            server_addr: None,
        }
    }

    pub fn with_endpoints(mut self, client: SocketAddr, server: SocketAddr) -> Self {
        self.client_addr = Some(client);
        self.server_addr = Some(server);
        self
    }
}

impl std::fmt::Debug for BindRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindRequest")
            .field("dn", &self.dn)
            .field("credentials", &"<redacted>")
            .field("client_addr", &self.client_addr)
            .field("server_addr", &self.server_addr)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Mirrored,
    Native,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Mirrored => "mirrored",
            AuthMethod::Native => "native",
        }
    }
}

/// An authenticated identity bound to the caller's connection.
#[derive(Debug, Clone)]
pub struct Principal {
    pub dn: String,
    pub method: AuthMethod,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
    /// Snapshot of the entry at bind time
    pub entry: Arc<Entry>,
}

impl Principal {
    pub fn new(request: &BindRequest, method: AuthMethod, entry: Entry) -> Self {
        Self {
            dn: entry.dn.clone(),
            method,
            client_addr: request.client_addr,
            server_addr: request.server_addr,
            entry: Arc::new(entry),
        }
    }
}

/// One step of the bind pipeline.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the strategy does not apply to this bind.
    async fn try_authenticate(&self, request: &BindRequest) -> Result<Option<Principal>>;
}

/// The directory's own authenticator for non-mirrored accounts.
#[async_trait]
pub trait NativeAuthenticator: Send + Sync {
    async fn authenticate(&self, request: &BindRequest) -> Result<Principal>;
}
