//! Tracing/logging setup shared by every binary.

/// Initialize process-wide logging with defaults (`RUST_LOG`, else `info`; JSON).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging from configuration.
pub fn init_with(config: &LoggingConfig) {
    tracing::init_with(config);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::LoggingConfig;
