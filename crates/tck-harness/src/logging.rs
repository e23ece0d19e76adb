//! Tracing subscriber setup for runners and tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Environment variable holding an `EnvFilter` directive that overrides the
/// filter passed to [`init_tracing`].
pub const LOG_ENV: &str = "TCK_LOG";

/// Default filter for runner binaries.
pub const DEFAULT_FILTER: &str = "info,tck_harness=debug";

/// Install the global tracing subscriber.
///
/// `TCK_LOG` wins over `filter` when set and valid. Calling this twice is
/// harmless; the second install is ignored.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Idempotent subscriber for tests; output goes through the libtest capture.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_test_tracing();
        init_test_tracing();
        init_tracing(DEFAULT_FILTER);
        tracing::debug!(target: "tck_harness", "still alive");
    }
}
