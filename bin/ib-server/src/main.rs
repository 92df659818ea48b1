//! IAM Bridge Server
//!
//! Runs the poll scheduler that mirrors IAM users and groups into the
//! directory, and exposes the bind decision plus health and admin endpoints
//! over HTTP. A missing or incomplete configuration disables the mirrored
//! path; the process still starts.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use ib_auth::{AuthError, AuthenticationDecider, BindRequest, MirroredStrategy};
use ib_config::{AppConfig, ConfigLoader, MirrorSettings};
use ib_directory::MemoryDirectory;
use ib_sync::{SqliteStateStore, SyncScheduler, TriggerOutcome};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// IAM Bridge Server
#[derive(Parser, Debug)]
#[command(name = "ib-server")]
#[command(about = "Mirrors IAM identities into the directory and authenticates binds against IAM")]
struct Args {
    /// Configuration file (defaults to the well-known search paths)
    #[arg(long, env = "IAM_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port, overriding the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Print an example configuration file and exit
    #[arg(long)]
    example_config: bool,
}

#[derive(Clone)]
struct AppState {
    scheduler: Option<Arc<SyncScheduler>>,
    decider: Arc<AuthenticationDecider>,
    server_addr: SocketAddr,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    mirrored_enabled: bool,
    scheduler_running: bool,
    last_sync: Option<ib_sync::SyncReport>,
}

#[derive(Deserialize)]
struct BindBody {
    dn: String,
    password: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.example_config {
        print!("{}", AppConfig::example_toml());
        return Ok(());
    }

    ib_common::logging::init_logging("ib-server");

    info!("Starting IAM Bridge");

    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Configuration unavailable, mirrored authentication disabled");
            AppConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.http.port = port;
    }

    let directory = Arc::new(MemoryDirectory::new());

    let mirrored = match config.mirror_settings() {
        Ok(settings) => match build_mirrored(&settings, &config, directory.clone()).await {
            Ok(parts) => Some(parts),
            Err(e) => {
                error!(error = %e, "Failed to initialize mirrored path, mirrored authentication disabled");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "Mirrored authentication disabled");
            None
        }
    };

    let (scheduler, strategy) = match mirrored {
        Some((scheduler, strategy)) => (Some(scheduler), Some(strategy)),
        None => (None, None),
    };
    if let Some(scheduler) = &scheduler {
        scheduler.start();
    }

    // No native authenticator is wired into this process; from_parts warns once
    let decider = Arc::new(AuthenticationDecider::from_parts(strategy, None));

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let state = AppState { scheduler: scheduler.clone(), decider, server_addr: addr };

    let app = Router::new()
        .route("/q/health", get(health))
        .route("/q/health/live", get(|| async { Json(json!({"status": "UP"})) }))
        .route("/q/health/ready", get(ready))
        .route("/sync", post(trigger_sync))
        .route("/admin/clear", post(clear_subtrees))
        .route("/bind", post(bind))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(?addr, "HTTP server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    info!("IAM Bridge stopped");
    Ok(())
}

#[cfg(feature = "aws")]
async fn build_mirrored(
    settings: &MirrorSettings,
    config: &AppConfig,
    directory: Arc<MemoryDirectory>,
) -> anyhow::Result<(Arc<SyncScheduler>, MirroredStrategy)> {
    use ib_auth::IamCredentialValidator;
    use ib_iam::aws::{AwsIdentityProvider, StsKeyPairVerifier};
    use ib_iam::StaticCredentials;
    use ib_sync::{DirectoryLayout, ReconcileOptions, Reconciler, SchedulerConfig};

    let credentials = StaticCredentials::new(&settings.access_key, &settings.secret_key);
    let iam = Arc::new(AwsIdentityProvider::new(&credentials, settings.region.clone()).await);
    let verifier = Arc::new(StsKeyPairVerifier::new(settings.region.clone()).await);
    let state = open_state_store(&config.state.database_url).await?;

    let reconciler = Reconciler::new(
        directory.clone(),
        iam,
        state.clone(),
        state,
        DirectoryLayout::new(settings.root_dn.clone()),
        ReconcileOptions { clear_on_first_sync: config.sync.clear_on_first_sync },
    );
    let scheduler = Arc::new(SyncScheduler::new(
        SchedulerConfig {
            enabled: config.sync.enabled,
            initial_delay: config.sync.initial_delay(),
            poll_period: config.sync.poll_period(),
        },
        Arc::new(reconciler),
    ));

    let validator = Arc::new(IamCredentialValidator::new(verifier));
    let strategy = MirroredStrategy::new(directory, validator).with_timeout(config.auth.validator_timeout());

    info!(root = %settings.root_dn, region = %settings.region, "Mirrored path initialized");
    Ok((scheduler, strategy))
}

#[cfg(not(feature = "aws"))]
async fn build_mirrored(
    _settings: &MirrorSettings,
    _config: &AppConfig,
    _directory: Arc<MemoryDirectory>,
) -> anyhow::Result<(Arc<SyncScheduler>, MirroredStrategy)> {
    anyhow::bail!("built without the aws feature, no IAM provider available")
}

#[cfg_attr(not(feature = "aws"), allow(dead_code))]
async fn open_state_store(url: &str) -> anyhow::Result<Arc<SqliteStateStore>> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        let path = path.split('?').next().unwrap_or(path);
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(Arc::new(SqliteStateStore::connect(url).await?))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let scheduler_running = state.scheduler.as_ref().is_some_and(|s| s.is_running());
    Json(HealthResponse {
        status: "UP".to_string(),
        mirrored_enabled: state.scheduler.is_some(),
        scheduler_running,
        last_sync: state.scheduler.as_ref().and_then(|s| s.last_report()),
    })
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match &state.scheduler {
        Some(scheduler) if scheduler.is_enabled() && !scheduler.is_running() => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "DOWN", "reason": "sync scheduler not running"})),
        ),
        _ => (StatusCode::OK, Json(json!({"status": "UP"}))),
    }
}

async fn trigger_sync(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let Some(scheduler) = &state.scheduler else {
        return (StatusCode::CONFLICT, Json(json!({"error": "mirrored path disabled"})));
    };
    match scheduler.trigger().await {
        TriggerOutcome::Completed(report) => (StatusCode::OK, Json(json!(report))),
        TriggerOutcome::Skipped => (
            StatusCode::CONFLICT,
            Json(json!({"status": "SKIPPED", "reason": "sync cycle already running"})),
        ),
        TriggerOutcome::Failed(message) => (StatusCode::BAD_GATEWAY, Json(json!({"error": message}))),
    }
}

async fn clear_subtrees(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let Some(scheduler) = &state.scheduler else {
        return (StatusCode::CONFLICT, Json(json!({"error": "mirrored path disabled"})));
    };
    match scheduler.clear().await {
        Some(Ok(deleted)) => (StatusCode::OK, Json(json!({"deleted": deleted}))),
        Some(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))),
        None => (
            StatusCode::CONFLICT,
            Json(json!({"status": "SKIPPED", "reason": "sync cycle already running"})),
        ),
    }
}

async fn bind(
    State(state): State<AppState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(body): Json<BindBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let request = BindRequest::new(body.dn, body.password).with_endpoints(client, state.server_addr);
    match state.decider.authenticate(&request).await {
        Ok(principal) => (
            StatusCode::OK,
            Json(json!({"dn": principal.dn, "method": principal.method.as_str()})),
        ),
        Err(e) => {
            let status = match e {
                AuthError::ProviderUnavailable(_) | AuthError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::UNAUTHORIZED,
            };
            (status, Json(json!({"error": e.to_string(), "retryable": e.is_retryable()})))
        }
    }
}

async fn shutdown_signal(scheduler: Option<Arc<SyncScheduler>>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
}
