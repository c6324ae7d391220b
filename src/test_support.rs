//! Test-only tracing setup.
//!
//! The crate never installs a global subscriber itself -- the one
//! process-wide exception, per the design note on global state, is this
//! test harness, so `cargo test -- --nocapture` shows the same
//! `tracing::info!`/`debug!` lines a consuming application would see.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
