//! Tracing setup for binaries and tests embedding the streaming engine.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"info,warpstream=debug"`).
///
/// Returns `false` if a global subscriber was already installed, which
/// makes it safe to call from every test.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok()
}

/// Like [`init_tracing`] but emits one JSON object per event.
pub fn init_json_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_reported() {
        let _ = init_tracing("warn");
        assert!(!init_tracing("debug"));
    }
}
