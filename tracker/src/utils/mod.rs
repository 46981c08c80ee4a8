//! Utility modules for the tracker.
//!
//! # Modules
//!
//! - [`debounce`]: Per-file heartbeat rate limiting

pub mod debounce;

pub use debounce::{HeartbeatDebouncer, DEFAULT_DEBOUNCE_SECS};
