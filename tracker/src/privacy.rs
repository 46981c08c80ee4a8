//! Privacy filter applied to every heartbeat before it is queued.
//!
//! The filter runs exactly once per heartbeat, after project resolution and
//! before enqueue. The dispatch queue only ever stores filtered heartbeats, so
//! retries resend data that has already been filtered.
//!
//! # Guarantees
//!
//! - **Hidden file names**: the entity becomes [`HIDDEN_ENTITY`] and the cursor
//!   position and line count are dropped, since they describe the hidden file.
//! - **Hidden project names**: the project is removed entirely, so it is
//!   omitted from the request body rather than sent as an empty string.
//!
//! # Example
//!
//! ```
//! use wakatrack::privacy::{PrivacyConfig, PrivacyFilter};
//! use wakatrack::types::{CursorPosition, Heartbeat};
//!
//! let filter = PrivacyFilter::new(PrivacyConfig::new(true, false));
//!
//! let heartbeat = Heartbeat::new("/home/user/secret/plan.md", false)
//!     .with_cursor(Some(CursorPosition::new(3, 1)));
//!
//! let filtered = filter.apply(heartbeat);
//! assert_eq!(filtered.entity(), "HIDDEN");
//! assert_eq!(filtered.cursor(), None);
//! ```

use tracing::trace;

use crate::config::TrackerConfig;
use crate::types::{Heartbeat, HIDDEN_ENTITY};

/// Visibility options for outgoing heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrivacyConfig {
    pub hide_file_names: bool,
    pub hide_project_names: bool,
}

impl PrivacyConfig {
    #[must_use]
    pub fn new(hide_file_names: bool, hide_project_names: bool) -> Self {
        Self {
            hide_file_names,
            hide_project_names,
        }
    }

    /// Extracts the privacy options from the tracker configuration.
    #[must_use]
    pub fn from_tracker_config(config: &TrackerConfig) -> Self {
        Self::new(config.hide_file_names, config.hide_project_names)
    }

    /// Returns `true` when no field would be touched.
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        !self.hide_file_names && !self.hide_project_names
    }
}

/// Stateless heartbeat transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivacyFilter {
    config: PrivacyConfig,
}

impl PrivacyFilter {
    #[must_use]
    pub fn new(config: PrivacyConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> PrivacyConfig {
        self.config
    }

    /// Consumes a heartbeat and returns its filtered replacement.
    ///
    /// Applying the filter to an already-filtered heartbeat returns an equal
    /// heartbeat.
    #[must_use]
    pub fn apply(&self, heartbeat: Heartbeat) -> Heartbeat {
        if self.config.is_passthrough() {
            return heartbeat;
        }

        let mut filtered = heartbeat;

        if self.config.hide_file_names {
            filtered.entity = HIDDEN_ENTITY.to_string();
            filtered.cursor = None;
            filtered.lines = None;
        }

        if self.config.hide_project_names {
            filtered.project = None;
        }

        trace!(
            hide_file_names = self.config.hide_file_names,
            hide_project_names = self.config.hide_project_names,
            "Heartbeat filtered"
        );

        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CursorPosition;

    fn full_heartbeat() -> Heartbeat {
        Heartbeat::new("/home/user/repo/src/auth.rs", true)
            .with_timestamp(1_700_000_000.0)
            .with_project(Some("repo".to_string()))
            .with_language(Some("rust".to_string()))
            .with_cursor(Some(CursorPosition::new(10, 2)))
            .with_lines(Some(200))
    }

    #[test]
    fn test_passthrough_leaves_heartbeat_untouched() {
        let filter = PrivacyFilter::new(PrivacyConfig::default());
        let original = full_heartbeat();

        assert_eq!(filter.apply(original.clone()), original);
    }

    #[test]
    fn test_hide_file_names_replaces_entity_and_drops_position() {
        let filter = PrivacyFilter::new(PrivacyConfig::new(true, false));
        let filtered = filter.apply(full_heartbeat());

        assert_eq!(filtered.entity(), HIDDEN_ENTITY);
        assert_eq!(filtered.cursor(), None);
        assert_eq!(filtered.lines(), None);
        // Everything else survives
        assert_eq!(filtered.project(), Some("repo"));
        assert_eq!(filtered.language(), Some("rust"));
        assert!(filtered.is_write());
    }

    #[test]
    fn test_hide_project_names_omits_project() {
        let filter = PrivacyFilter::new(PrivacyConfig::new(false, true));
        let filtered = filter.apply(full_heartbeat());

        assert_eq!(filtered.project(), None);
        assert_eq!(filtered.entity(), "/home/user/repo/src/auth.rs");

        let json = serde_json::to_value(&filtered).unwrap();
        assert!(json.get("project").is_none(), "project must be omitted, not empty");
    }

    #[test]
    fn test_filter_is_idempotent() {
        for (hide_files, hide_projects) in [(false, false), (true, false), (false, true), (true, true)] {
            let filter = PrivacyFilter::new(PrivacyConfig::new(hide_files, hide_projects));
            let once = filter.apply(full_heartbeat());
            let twice = filter.apply(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_hidden_heartbeat_json_contains_no_path() {
        let filter = PrivacyFilter::new(PrivacyConfig::new(true, true));
        let json = serde_json::to_string(&filter.apply(full_heartbeat())).unwrap();

        assert!(!json.contains("/home/"));
        assert!(!json.contains("auth.rs"));
        assert!(!json.contains("lineno"));
        assert!(!json.contains("cursorpos"));
        assert!(!json.contains("repo"));
    }

    #[test]
    fn test_from_tracker_config_copies_flags() {
        let config = TrackerConfig {
            hide_file_names: true,
            ..TrackerConfig::default()
        };
        let privacy = PrivacyConfig::from_tracker_config(&config);

        assert!(privacy.hide_file_names);
        assert!(!privacy.hide_project_names);
    }
}
