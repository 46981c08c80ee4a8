//! wakatrack - editor heartbeat tracking client.
//!
//! This crate turns editor activity into rate-limited heartbeats and delivers
//! them to a WakaTime-compatible endpoint without blocking the editor.
//!
//! # Overview
//!
//! The editor reports opens, edits, saves and cursor movement to a
//! [`TrackingCoordinator`]. Each event passes through the debouncer; accepted
//! events are enriched with the detected project, filtered for privacy and
//! handed to a background dispatch queue that retries transient failures with
//! exponential backoff.
//!
//! # Privacy
//!
//! Filtering happens once, before a heartbeat is queued. With
//! `hide-file-names` the path, cursor position and line count never leave
//! the process; with `hide-project-names` the project is omitted.
//!
//! # Modules
//!
//! - [`types`]: Heartbeat and editor event types
//! - [`config`]: Configuration from TOML and environment variables
//! - [`error`]: Error types for tracker setup
//! - [`project`]: Project root detection with per-directory caching
//! - [`privacy`]: Privacy filter for outgoing heartbeats
//! - [`sender`]: Bounded dispatch queue with retry and backoff
//! - [`coordinator`]: Session-scoped orchestration
//! - [`utils`]: Shared utilities (debouncing)

pub mod config;
pub mod coordinator;
pub mod error;
pub mod privacy;
pub mod project;
pub mod sender;
pub mod types;
pub mod utils;

pub use config::{ApiKey, ConfigError, TrackerConfig};
pub use coordinator::TrackingCoordinator;
pub use error::{Result, TrackerError};
pub use privacy::{PrivacyConfig, PrivacyFilter};
pub use project::{ProjectInfo, ProjectResolver, PROJECT_INDICATORS};
pub use sender::{DispatchQueue, DispatchStats, RetryPolicy, SenderConfig, SenderError, ShutdownReport};
pub use types::{Category, CursorPosition, EditorEvent, EventKind, Heartbeat, HIDDEN_ENTITY};
pub use utils::{HeartbeatDebouncer, DEFAULT_DEBOUNCE_SECS};
