//! Shared helpers for integration tests.

use std::sync::Once;

static TRACING: Once = Once::new();

/// Send tracing output to the test harness. Filter with `RUST_LOG`.
#[allow(dead_code)]
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
