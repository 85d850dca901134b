//! Process-wide tracing setup shared by binaries.

/// Initialize process-wide tracing with the `info` default filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    subscriber::init("info");
}

/// Subscriber configuration (filters, formatting).
pub mod subscriber;
