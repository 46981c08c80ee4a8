//! Tracking coordinator: editor events in, filtered heartbeats out.
//!
//! The coordinator owns every piece of per-session state: the debouncer's
//! per-file history, the project cache and the dispatch queue handle. The
//! editor constructs one when tracking is enabled, feeds it events from the
//! editing path and shuts it down on exit or when tracking is switched off.
//!
//! ```text
//! EditorEvent -> HeartbeatDebouncer -> ProjectResolver -> PrivacyFilter -> DispatchQueue
//!                 (drop if debounced)                                       (background task)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use wakatrack::config::TrackerConfig;
//! use wakatrack::coordinator::TrackingCoordinator;
//! use wakatrack::types::{EditorEvent, EventKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TrackerConfig::load(None).unwrap_or_default();
//!
//!     let Some(mut tracker) = TrackingCoordinator::start_if_enabled(config) else {
//!         return;
//!     };
//!
//!     tracker.handle_event(EditorEvent::new(EventKind::Open, "/repo/src/main.rs"));
//!     tracker.shutdown().await;
//! }
//! ```

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::privacy::{PrivacyConfig, PrivacyFilter};
use crate::project::ProjectResolver;
use crate::sender::{DispatchQueue, DispatchStats, SenderConfig, ShutdownReport};
use crate::types::{EditorEvent, Heartbeat};
use crate::utils::debounce::HeartbeatDebouncer;

/// Per-session heartbeat tracking state.
#[derive(Debug)]
pub struct TrackingCoordinator {
    config: TrackerConfig,
    debouncer: HeartbeatDebouncer,
    resolver: ProjectResolver,
    privacy: PrivacyFilter,
    queue: DispatchQueue,
}

impl TrackingCoordinator {
    /// Validates `config` and starts the dispatch queue.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a `TrackerError` if tracking is disabled, the API key is
    /// missing, or the dispatch queue cannot be started.
    pub fn start(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let sender_config = SenderConfig::from_tracker_config(&config)?;
        Self::start_with_sender(config, sender_config)
    }

    /// Like [`start`](Self::start), with explicit dispatch settings.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub fn start_with_sender(config: TrackerConfig, sender_config: SenderConfig) -> Result<Self> {
        config.validate()?;

        let queue = DispatchQueue::spawn(sender_config)?;

        info!(
            api_url = %config.api_url,
            hide_file_names = config.hide_file_names,
            hide_project_names = config.hide_project_names,
            debounce_secs = config.debounce_secs,
            "Heartbeat tracking started"
        );

        Ok(Self {
            debouncer: HeartbeatDebouncer::new(config.debounce_window()),
            resolver: ProjectResolver::new(config.project.clone()),
            privacy: PrivacyFilter::new(PrivacyConfig::from_tracker_config(&config)),
            queue,
            config,
        })
    }

    /// Starts tracking, or reports why not and returns `None`.
    ///
    /// The reason is logged once; the editor keeps running without tracking.
    #[must_use]
    pub fn start_if_enabled(config: TrackerConfig) -> Option<Self> {
        match Self::start(config) {
            Ok(coordinator) => Some(coordinator),
            Err(e) if e.is_disabled() => {
                debug!("Heartbeat tracking disabled by configuration");
                None
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat tracking disabled");
                None
            }
        }
    }

    /// Processes one editor event.
    ///
    /// Returns `true` if a heartbeat was queued.
    pub fn handle_event(&mut self, event: EditorEvent) -> bool {
        self.handle_event_at(event, Instant::now())
    }

    /// Processes one editor event observed at `now`.
    pub fn handle_event_at(&mut self, event: EditorEvent, now: Instant) -> bool {
        let is_write = event.is_write();

        if !self.debouncer.should_emit(&event.path, is_write, now) {
            return false;
        }

        let project = self.resolver.resolve(&event.path);

        let heartbeat = Heartbeat::new(event.path.to_string_lossy(), is_write)
            .with_category(event.category.unwrap_or_default())
            .with_project(project.name)
            .with_language(event.language)
            .with_cursor(event.cursor)
            .with_lines(event.lines);

        let heartbeat = self.privacy.apply(heartbeat);

        debug!(kind = ?event.kind, is_write, "Heartbeat queued");
        self.queue.enqueue(heartbeat);
        true
    }

    /// Forgets debounce history and cached projects.
    pub fn reset(&mut self) {
        self.debouncer.reset();
        self.resolver.clear_cache();
        debug!("Tracking state reset");
    }

    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.queue.stats()
    }

    /// Number of directories in the project cache.
    #[must_use]
    pub fn cached_projects(&self) -> usize {
        self.resolver.cached_dirs()
    }

    /// Flushes pending heartbeats within the configured grace period and
    /// discards all state.
    pub async fn shutdown(self) -> ShutdownReport {
        let grace = self.config.shutdown_grace();
        let report = self.queue.shutdown(grace).await;

        info!(
            delivered = report.stats.delivered,
            failed = report.stats.failed,
            evicted = report.stats.evicted,
            unsent = report.unsent,
            "Heartbeat tracking stopped"
        );

        report
    }
}
