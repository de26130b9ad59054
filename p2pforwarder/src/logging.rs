//! Log output for the binary and for tests.
//!
//! The library only emits `tracing` events, so embedders route them by installing their own
//! subscriber. These helpers install the one the binary uses.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Picks the default filter directives from the verbosity flags. `RUST_LOG` overrides them.
pub fn default_directives(verbose: bool, silent: bool) -> &'static str {
    match (verbose, silent) {
        (_, true) => "error",
        (true, false) => "debug",
        (false, false) => "info",
    }
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// [`default_directives`].
pub fn init_logging(verbose: bool, silent: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbose, silent)));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

/// Like [`init_logging`] with default verbosity, but writing through the test harness and
/// tolerating being called more than once.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::default_directives;

    #[test]
    fn silent_wins_over_verbose() {
        assert_eq!(default_directives(true, true), "error");
        assert_eq!(default_directives(false, true), "error");
        assert_eq!(default_directives(true, false), "debug");
        assert_eq!(default_directives(false, false), "info");
    }
}
