//! Authentication decider

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::strategy::{MirroredStrategy, NativeStrategy};
use crate::{AuthError, AuthStrategy, BindRequest, NativeAuthenticator, Principal, Result};

/// Runs a bind through the strategy pipeline.
///
/// The first strategy that applies decides. A strategy that cannot classify
/// the bind (directory error) passes to the next one; when none is left the
/// classification error is returned.
pub struct AuthenticationDecider {
    strategies: Vec<Arc<dyn AuthStrategy>>,
}

impl AuthenticationDecider {
    pub fn new() -> Self {
        Self { strategies: Vec::new() }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Mirrored first (when enabled), then native (when configured).
    pub fn from_parts(
        mirrored: Option<MirroredStrategy>,
        native: Option<Arc<dyn NativeAuthenticator>>,
    ) -> Self {
        let mut decider = Self::new();
        let mirrored_enabled = mirrored.is_some();
        if let Some(strategy) = mirrored {
            decider = decider.with_strategy(Arc::new(strategy));
        }
        match native {
            Some(native) => {
                decider = decider.with_strategy(Arc::new(NativeStrategy::new(native)));
                if !mirrored_enabled {
                    info!("Mirrored authentication disabled; all binds go native");
                }
            }
            None if mirrored_enabled => {
                warn!("No native authenticator configured; binds to non-mirrored entries will be refused");
            }
            None => {
                warn!("No authenticator configured; every bind will be refused");
            }
        }
        decider
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn authenticate(&self, request: &BindRequest) -> Result<Principal> {
        let mut deferred: Option<AuthError> = None;

        for strategy in &self.strategies {
            match strategy.try_authenticate(request).await {
                Ok(Some(principal)) => {
                    debug!(dn = %request.dn, strategy = strategy.name(), "Bind succeeded");
                    metrics::counter!(
                        "auth.binds_total",
                        "method" => principal.method.as_str(),
                        "outcome" => "success"
                    )
                    .increment(1);
                    return Ok(principal);
                }
                Ok(None) => continue,
                Err(e) if e.allows_fallback() => {
                    warn!(dn = %request.dn, strategy = strategy.name(), error = %e, "Strategy could not classify bind, trying next");
                    deferred = Some(e);
                }
                Err(e) => {
                    record_failure(strategy.name(), &e);
                    return Err(e);
                }
            }
        }

        let err = deferred.unwrap_or_else(|| AuthError::NoAuthenticator(request.dn.clone()));
        record_failure("none", &err);
        Err(err)
    }
}

impl Default for AuthenticationDecider {
    fn default() -> Self {
        Self::new()
    }
}

fn record_failure(strategy: &str, err: &AuthError) {
    let outcome = match err {
        AuthError::NoSuchAccount(_) => "no_such_account",
        AuthError::InvalidCredentials(_) => "invalid_credentials",
        AuthError::ProviderUnavailable(_) => "provider_unavailable",
        AuthError::Directory(_) => "directory_error",
        AuthError::NoAuthenticator(_) => "no_authenticator",
    };
    metrics::counter!("auth.binds_total", "method" => strategy.to_string(), "outcome" => outcome)
        .increment(1);
}
