// ABOUTME: Test support utilities.
// ABOUTME: Provides the shared SSH container and tracing setup for integration tests.

use std::sync::Once;

#[allow(dead_code)]
pub mod ssh_container;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("machine_ssh=debug".parse().unwrap())
            .add_directive("russh=info".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Path of a file under `tests/fixtures`.
#[allow(dead_code)]
pub fn fixture_path(name: &str) -> String {
    format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

#[allow(dead_code)]
pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("fixture should be readable")
}
