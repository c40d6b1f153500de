mod options;

pub use options::*;

#[cfg(test)]
pub mod asm;

use std::sync::Once;

/// Initialize a tracing subscriber honoring `RUST_LOG`. Safe to call from
/// every test; only the first call installs anything.
pub fn setup_logger() {
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
      .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init();
  });
}
