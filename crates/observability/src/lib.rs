//! Tracing/logging setup shared by binaries and tests.

/// Initialize process-wide JSON logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::Json);
}

/// Initialize with an explicit output format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
}

pub use self::tracing::LogFormat;

/// Tracing configuration (filters, layers).
pub mod tracing;
