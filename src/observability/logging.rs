//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Configure log level from config, overridable through `RUST_LOG`
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Always writes to stderr: a worker's stdout carries its status protocol

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::LogFormat;

/// Initialize the global subscriber. Later calls are no-ops.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

fn default_directives(level: &str) -> String {
    format!("{level},hyper=warn,notify=warn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_quiet_dependencies() {
        assert_eq!(default_directives("debug"), "debug,hyper=warn,notify=warn");
        assert!(EnvFilter::try_new(default_directives("info")).is_ok());
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logging("info", LogFormat::Pretty);
        init_logging("debug", LogFormat::Json);
    }
}
