//! Shared test infrastructure for transport integration tests.

pub mod node;

pub use node::{MockNode, NodeBehavior};

/// Install a test-friendly tracing subscriber (idempotent).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_direct=debug".into()),
        )
        .with_test_writer()
        .try_init();
}
