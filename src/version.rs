//! Library identification constants stamped onto outgoing records.

/// Version reported as `$lib_version` and in the transport User-Agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library tag stamped on every outgoing record as `$lib`.
pub const LIB_NAME: &str = "posthog-rust";
