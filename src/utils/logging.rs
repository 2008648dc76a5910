//! Logging initialization for the host and its workers
//!
//! Logs always go to stderr: a worker's stdout carries its bus transport.
//! `RUST_LOG` takes precedence over any filter passed in from config.
//!
//! ```no_run
//! modhost::utils::init_logging(None); // RUST_LOG or "info"
//! modhost::utils::init_module_logging("gallery", None);
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` if set, else the configured filter, else `default`
fn resolve_filter(filter: Option<&str>, default: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or(default))
}

fn install(env_filter: EnvFilter) {
    // try_init: a second initialization in the same process is ignored
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(env_filter)
        .try_init();
}

/// Initialize logging for the coordinator
pub fn init_logging(filter: Option<&str>) {
    install(resolve_filter(filter, "info"));
}

/// Initialize logging inside a worker process
///
/// Defaults to `{module_name}=info,modhost::module=info` so the worker's own
/// messages and its bus plumbing are visible without `RUST_LOG`.
pub fn init_module_logging(module_name: &str, filter: Option<&str>) {
    let default_filter = format!("{}=info,modhost::module=info", module_name.replace('-', "_"));
    install(resolve_filter(filter, &default_filter));
}

/// Initialize logging with JSON output
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(resolve_filter(filter, "info"))
        .try_init();
}

/// Initialize logging from the host's `[logging]` section
pub fn init_logging_from_config(config: Option<&crate::config::LoggingConfig>) {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.map(|c| c.json_format).unwrap_or(false) {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            init_logging(filter);
        }
    } else {
        init_logging(filter);
    }
}
