//! Setup for the application logging.
//!
//! Log lines go to stderr so the console commands can own stdout. The
//! filter comes from `RUST_LOG` when set and defaults to `riptide=info`.
use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("riptide=info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}
