//! Shared utilities: logging, signals and environment helpers

pub mod env;
pub mod logging;
pub mod signal;

pub use env::{env_int, env_opt};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config, init_module_logging};
pub use signal::wait_for_shutdown_signal;
