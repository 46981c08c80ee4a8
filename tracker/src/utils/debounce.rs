//! Heartbeat debouncing.
//!
//! Editors report an event for every keystroke and cursor movement. The
//! [`HeartbeatDebouncer`] decides which of those events deserve a heartbeat:
//!
//! 1. A write is emitted unless the last heartbeat for that file was itself
//!    a write. A burst of keystrokes produces one heartbeat, and the first
//!    edit after a read-only heartbeat is never suppressed.
//! 2. Anything else is emitted when the debounce window has elapsed since the
//!    last heartbeat for the file, or when the file differs from the one that
//!    received the most recent heartbeat.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use std::time::{Duration, Instant};
//! use wakatrack::utils::debounce::HeartbeatDebouncer;
//!
//! let mut debouncer = HeartbeatDebouncer::new(Duration::from_secs(120));
//! let file = Path::new("/repo/src/main.rs");
//! let start = Instant::now();
//!
//! assert!(debouncer.should_emit(file, false, start));
//! assert!(!debouncer.should_emit(file, false, start + Duration::from_secs(5)));
//! assert!(debouncer.should_emit(file, true, start + Duration::from_secs(6)));
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::trace;

/// Default debounce window in seconds.
pub const DEFAULT_DEBOUNCE_SECS: u64 = 120;

/// Last heartbeat emitted for one file.
#[derive(Debug, Clone, Copy)]
struct LastSent {
    at: Instant,
    was_write: bool,
}

/// Per-file rate limiter for heartbeats.
#[derive(Debug)]
pub struct HeartbeatDebouncer {
    window: Duration,
    last_sent: HashMap<PathBuf, LastSent>,
    /// File that received the most recent heartbeat.
    active_file: Option<PathBuf>,
}

impl HeartbeatDebouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: HashMap::new(),
            active_file: None,
        }
    }

    /// Creates a debouncer with the default two-minute window.
    #[must_use]
    pub fn with_default_window() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DEBOUNCE_SECS))
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decides whether an event on `path` at `now` should produce a heartbeat.
    ///
    /// Accepting an event records it as the latest heartbeat for the file.
    pub fn should_emit(&mut self, path: &Path, is_write: bool, now: Instant) -> bool {
        let previous = self.last_sent.get(path).copied();

        let emit = match previous {
            None => true,
            Some(last) if is_write && !last.was_write => true,
            Some(last) => {
                let switched = self.active_file.as_deref() != Some(path);
                switched || now.saturating_duration_since(last.at) >= self.window
            }
        };

        trace!(path = %path.display(), is_write, emit, "Debounce decision");

        if emit {
            self.last_sent.insert(
                path.to_path_buf(),
                LastSent {
                    at: now,
                    was_write: is_write,
                },
            );
            if self.active_file.as_deref() != Some(path) {
                self.active_file = Some(path.to_path_buf());
            }
        }

        emit
    }

    /// File that received the most recent heartbeat.
    #[must_use]
    pub fn active_file(&self) -> Option<&Path> {
        self.active_file.as_deref()
    }

    /// Number of files with recorded heartbeats.
    #[must_use]
    pub fn tracked_files(&self) -> usize {
        self.last_sent.len()
    }

    /// Forgets all recorded heartbeats.
    pub fn reset(&mut self) {
        self.last_sent.clear();
        self.active_file = None;
    }
}

impl Default for HeartbeatDebouncer {
    fn default() -> Self {
        Self::with_default_window()
    }
}
