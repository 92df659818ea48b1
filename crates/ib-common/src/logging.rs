//! Structured Logging Configuration
//!
//! - JSON output when `LOG_FORMAT=json` (log aggregation)
//! - Human-readable output otherwise
//! - `RUST_LOG` filter, defaulting to `info`
//!
//! ```rust,ignore
//! ib_common::logging::init_logging("ib-server");
//! tracing::info!(user = %name, "Mirrored user created");
//! ```
//!
//! Poll cycles run inside an `info_span!("sync_cycle")` so every record logged
//! during a cycle carries the span fields.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging for the given service.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(service_name: &str) {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let initialized = if json {
        init_json_logging(default_filter())
    } else {
        init_text_logging(default_filter())
    };

    if initialized {
        tracing::debug!(service = %service_name, json, "Logging initialized");
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .try_init()
        .is_ok()
}
