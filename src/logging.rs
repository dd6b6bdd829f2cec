//! Logging setup.
//!
//! Structured logging via the `tracing` crate. Recording is best-effort, so
//! most of what this crate has to say — hash failures, skipped records,
//! repair decisions, reuse hits — arrives as warnings and debug events on
//! these subscribers rather than as errors.
//!
//! The filter comes from the `PEDIGREE_LOG` environment variable when set
//! (standard `tracing_subscriber::EnvFilter` syntax), else from the given
//! default level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable holding the tracing filter.
pub const LOG_ENV: &str = "PEDIGREE_LOG";

/// Initialize the global tracing subscriber.
///
/// Returns an error if a global subscriber is already installed (e.g. by
/// the embedding application — in that case this crate simply logs through
/// it and no setup is needed here).
pub fn init_logging(default_level: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent_enough() {
        // First call may or may not win the global slot depending on test
        // ordering; a second call must fail cleanly rather than panic.
        let _ = init_logging("info");
        assert!(init_logging("debug").is_err());
    }
}
