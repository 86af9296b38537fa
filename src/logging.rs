use log::{LevelFilter, info};
use std::env;

pub const GNSS_NAMESPACE: &str = "accelmeter::gnss";
pub const ACCEL_NAMESPACE: &str = "accelmeter::accel";
pub const SESSION_NAMESPACE: &str = "accelmeter::session";
pub const CLIENT_NAMESPACE: &str = "accelmeter::client";

/// Per-component levels. Verbose mode adds sentence decoding, state
/// transitions, client traffic and the per-run sample trace.
pub fn component_filters(verbose: bool) -> [(&'static str, LevelFilter); 4] {
    let detail = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    [
        (GNSS_NAMESPACE, detail),
        (ACCEL_NAMESPACE, detail),
        (SESSION_NAMESPACE, detail),
        (CLIENT_NAMESPACE, detail),
    ]
}

pub fn init_logging(verbose: bool) {
    // Set default log level if not specified in environment
    if env::var("RUST_LOG").is_err() {
        unsafe {
            env::set_var("RUST_LOG", "info");
        }
    }

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    builder
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(true);
    for (target, level) in component_filters(verbose) {
        builder.filter(Some(target), level);
    }
    builder.init();

    info!("Logging initialized (verbose: {})", verbose);
}

// Convenience macros for each namespace
#[macro_export]
macro_rules! gnss_log {
    ($($arg:tt)*) => {
        log::log!(target: $crate::logging::GNSS_NAMESPACE, $($arg)*)
    };
}

#[macro_export]
macro_rules! accel_log {
    ($($arg:tt)*) => {
        log::log!(target: $crate::logging::ACCEL_NAMESPACE, $($arg)*)
    };
}

#[macro_export]
macro_rules! session_log {
    ($($arg:tt)*) => {
        log::log!(target: $crate::logging::SESSION_NAMESPACE, $($arg)*)
    };
}

#[macro_export]
macro_rules! client_log {
    ($($arg:tt)*) => {
        log::log!(target: $crate::logging::CLIENT_NAMESPACE, $($arg)*)
    };
}
