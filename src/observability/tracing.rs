//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directives when `RUST_LOG` is unset.
fn default_filter(level: &str) -> String {
    format!("{level},cachet=debug")
}

/// Initialize tracing for the admin binary.
///
/// Honors `RUST_LOG` when set, otherwise logs at `level` with the
/// crate's own events at debug. With `json`, events are emitted as
/// one JSON object per line.
///
/// # Panics
///
/// Panics if tracing has already been initialized.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    tracing::debug!(level, json, "Tracing initialized");
}

/// Route log output through the test harness.
///
/// `RUST_LOG` overrides the default of warnings from the crate and
/// errors from everything else. Safe to call from every test.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("error,cachet=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let directives = default_filter("warn");
        assert_eq!(directives, "warn,cachet=debug");
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_init_test_tracing_is_repeatable() {
        init_test_tracing();
        init_test_tracing();
        tracing::warn!("visible under the test writer");
    }
}
