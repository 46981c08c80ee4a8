//! Durable heartbeat dispatch queue.
//!
//! The editing path hands heartbeats to [`DispatchQueue::enqueue`], which
//! pushes onto a bounded in-memory buffer and returns immediately. A
//! background task drains the buffer and POSTs each heartbeat to the
//! configured endpoint:
//!
//! - Bounded buffer (1000 entries by default, oldest evicted first)
//! - One request per heartbeat, `Authorization: Basic base64(api_key)`
//! - Exponential backoff per entry (1s → 300s max, ±25% jitter)
//! - Retry ceiling (5 attempts by default), after which the entry is dropped
//! - Rate limit handling (429 with Retry-After header)
//! - 4xx other than 429 dropped immediately
//!
//! The buffer is the only state shared between the editor and the task.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use wakatrack::config::ApiKey;
//! use wakatrack::sender::{DispatchQueue, SenderConfig};
//! use wakatrack::types::Heartbeat;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SenderConfig::new(
//!         "https://api.wakatime.com/api/v1/users/current/heartbeats".to_string(),
//!         ApiKey::new("waka_xxx"),
//!     );
//!     let queue = DispatchQueue::spawn(config).unwrap();
//!
//!     queue.enqueue(Heartbeat::new("/repo/src/main.rs", true));
//!
//!     let report = queue.shutdown(Duration::from_secs(5)).await;
//!     println!("unsent: {}", report.unsent);
//! }
//! ```

use std::collections::VecDeque;
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ApiKey, ConfigError, TrackerConfig};
use crate::types::Heartbeat;

/// Initial retry delay in seconds.
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Maximum retry delay in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 300;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Default buffer capacity.
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default number of delivery attempts per heartbeat.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Header carrying the reporting machine's hostname.
const MACHINE_NAME_HEADER: &str = "X-Machine-Name";

/// Errors that can occur while starting the dispatch queue.
#[derive(Error, Debug)]
pub enum SenderError {
    /// The HTTP client could not be built.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// No tokio runtime is available to host the background task.
    #[error("no tokio runtime available for the dispatch task")]
    NoRuntime,

    /// API key or machine name contains characters not allowed in a header.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// Backoff and retry ceiling for failed deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Total attempts (first send included) before a heartbeat is dropped.
    pub max_attempts: u32,

    /// Relative jitter applied to each delay (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Millisecond delays without jitter, for integration tests.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay after the `attempt`-th failed attempt: `base * 2^(attempt - 1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the next attempt after the `attempt`-th failure.
    ///
    /// A server-provided `Retry-After` lengthens the delay but never past
    /// `max_delay`.
    fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.jittered_backoff(attempt);
        retry_after.map_or(backoff, |after| after.max(backoff).min(self.max_delay))
    }

    /// [`backoff`](Self::backoff) with jitter applied, still capped at `max_delay`.
    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }

        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.jitter;
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        let secs = (delay.as_secs_f64() + jitter).max(0.01);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

/// Configuration for the dispatch queue.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Heartbeat endpoint URL.
    pub api_url: String,

    pub api_key: ApiKey,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Maximum number of heartbeats to buffer.
    pub buffer_size: usize,

    pub retry: RetryPolicy,

    /// Sent as `X-Machine-Name`.
    pub machine_name: String,
}

impl SenderConfig {
    /// Creates a configuration with default limits.
    #[must_use]
    pub fn new(api_url: String, api_key: ApiKey) -> Self {
        Self {
            api_url,
            api_key,
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            buffer_size: DEFAULT_BUFFER_SIZE,
            retry: RetryPolicy::default(),
            machine_name: get_hostname(),
        }
    }

    /// Builds the sender configuration from the tracker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingApiKey`] if no API key is configured.
    pub fn from_tracker_config(config: &TrackerConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key.clone().ok_or(ConfigError::MissingApiKey)?;
        let retry = RetryPolicy::default().with_max_attempts(config.max_attempts);

        Ok(Self::new(config.api_url.clone(), api_key)
            .with_timeout(config.request_timeout())
            .with_buffer_size(config.buffer_size)
            .with_retry_policy(retry))
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A buffered heartbeat plus its delivery bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    id: Uuid,
    heartbeat: Heartbeat,
    /// Delivery attempts made so far.
    attempts: u32,
    next_attempt_at: Instant,
    enqueued_at: Instant,
}

impl QueueEntry {
    fn new(heartbeat: Heartbeat, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            heartbeat,
            attempts: 0,
            next_attempt_at: now,
            enqueued_at: now,
        }
    }
}

/// Point-in-time queue counters.
///
/// Every enqueued heartbeat ends up delivered, failed, evicted or still
/// pending, so `enqueued - delivered - failed - evicted` is the number not
/// yet resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub delivered: u64,
    /// Dropped after a permanent error or after exhausting retries.
    pub failed: u64,
    /// Dropped from a full buffer.
    pub evicted: u64,
    /// Rescheduled after a transient failure.
    pub retried: u64,
    /// Currently waiting in the buffer.
    pub pending: usize,
}

impl DispatchStats {
    /// Heartbeats neither delivered nor dropped.
    #[must_use]
    pub fn unresolved(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.delivered + self.failed + self.evicted)
    }
}

/// Result of [`DispatchQueue::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stats: DispatchStats,
    /// Heartbeats discarded because the final flush could not send them.
    pub unsent: u64,
    /// Whether the grace period ran out before the flush finished.
    pub timed_out: bool,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
    retried: AtomicU64,
}

/// Bounded buffer shared by the editing path and the drain task.
#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<QueueEntry>>,
    capacity: usize,
    notify: Notify,
    counters: Counters,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            counters: Counters::default(),
        }
    }

    /// Inserts an entry in enqueue order, evicting the oldest entries when full.
    ///
    /// New heartbeats land at the back. Entries coming back for a retry keep
    /// their original position, so eviction always hits the heartbeat that
    /// was enqueued first.
    ///
    /// Returns the number of entries evicted.
    fn push(&self, entry: QueueEntry) -> usize {
        let mut evicted = 0;
        {
            let mut queue = self.queue.lock();
            let position = queue.partition_point(|e| e.enqueued_at <= entry.enqueued_at);
            queue.insert(position, entry);
            while queue.len() > self.capacity {
                queue.pop_front();
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            warn!(evicted_count = evicted, "Buffer overflow, heartbeats evicted");
        }

        self.notify.notify_one();
        evicted
    }

    /// Removes and returns every entry due at or before `now`.
    fn take_ready(&self, now: Instant) -> Vec<QueueEntry> {
        let mut queue = self.queue.lock();
        if !queue.iter().any(|e| e.next_attempt_at <= now) {
            return Vec::new();
        }

        let (ready, waiting): (Vec<_>, Vec<_>) =
            queue.drain(..).partition(|e| e.next_attempt_at <= now);
        *queue = VecDeque::from(waiting);
        ready
    }

    fn take_all(&self) -> Vec<QueueEntry> {
        self.queue.lock().drain(..).collect()
    }

    /// Earliest retry deadline among buffered entries.
    fn next_due(&self) -> Option<Instant> {
        self.queue.lock().iter().map(|e| e.next_attempt_at).min()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn stats(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug)]
enum Delivery {
    Delivered,
    /// Transient failure: timeout, connection error, 5xx or 429.
    Retry {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Permanent failure: retrying cannot succeed.
    Rejected { reason: String },
}

/// Handle to the background dispatch task.
///
/// Dropping the handle stops the task without a final flush; call
/// [`shutdown`](Self::shutdown) to flush first.
#[derive(Debug)]
pub struct DispatchQueue {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatchQueue {
    /// Starts the drain task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SenderError` if called outside a tokio runtime, the HTTP
    /// client cannot be built, or the credentials are not valid header values.
    pub fn spawn(config: SenderConfig) -> Result<Self, SenderError> {
        let runtime = Handle::try_current().map_err(|_| SenderError::NoRuntime)?;

        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(2)
            .build()?;
        let headers = build_headers(&config)?;

        let shared = Arc::new(Shared::new(config.buffer_size.max(1)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            shared: Arc::clone(&shared),
            client,
            headers,
            url: config.api_url,
            retry: config.retry,
            shutdown_rx,
        };
        let task = runtime.spawn(worker.run());

        Ok(Self {
            shared,
            shutdown_tx,
            task,
        })
    }

    /// Queues a heartbeat for delivery without waiting.
    ///
    /// If the buffer is full, the oldest heartbeats are evicted to make room.
    ///
    /// # Returns
    ///
    /// The number of heartbeats evicted (0 if the buffer had space).
    pub fn enqueue(&self, heartbeat: Heartbeat) -> usize {
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.push(QueueEntry::new(heartbeat, Instant::now()))
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.shared.stats()
    }

    /// Stops the drain task after a best-effort final flush.
    ///
    /// Every buffered heartbeat gets one more attempt, ignoring backoff. The
    /// whole flush is bounded by `grace`; when it runs out, the task is
    /// aborted. Heartbeats not sent by then are discarded.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let Self {
            shared,
            shutdown_tx,
            mut task,
        } = self;

        info!(
            buffered_heartbeats = shared.len(),
            "Flushing heartbeat queue before shutdown"
        );

        // Fails only if the task already exited
        let _ = shutdown_tx.send(true);

        let timed_out = match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => false,
            Err(_) => {
                warn!(grace_ms = grace.as_millis(), "Timeout while flushing heartbeats");
                task.abort();
                let _ = task.await;
                true
            }
        };

        let stats = shared.stats();
        let unsent = stats.unresolved();
        if unsent > 0 {
            warn!(unsent, "Heartbeats discarded at shutdown");
        }

        ShutdownReport {
            stats,
            unsent,
            timed_out,
        }
    }
}

/// Background task that drains the buffer.
struct Worker {
    shared: Arc<Shared>,
    client: Client,
    headers: HeaderMap,
    url: String,
    retry: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(url = %self.url, "Heartbeat dispatcher started");

        loop {
            self.drain_ready().await;

            let deadline = self.shared.next_due();

            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    // A closed channel means the handle was dropped: stop without flushing
                    if changed.is_ok() {
                        self.final_flush().await;
                    }
                    break;
                }
                () = self.shared.notify.notified() => {}
                () = sleep_until(deadline) => {}
            }
        }

        debug!("Heartbeat dispatcher stopped");
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Attempts every entry whose retry time has come.
    async fn drain_ready(&mut self) {
        let mut ready = self.shared.take_ready(Instant::now()).into_iter();

        while let Some(entry) = ready.next() {
            self.attempt(entry).await;

            if self.shutdown_requested() {
                for rest in ready.by_ref() {
                    self.shared.push(rest);
                }
                return;
            }
        }
    }

    async fn attempt(&self, mut entry: QueueEntry) {
        entry.attempts += 1;

        match self.deliver(&entry.heartbeat).await {
            Delivery::Delivered => {
                self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = %entry.id,
                    attempt = entry.attempts,
                    "Heartbeat sent successfully"
                );
            }
            Delivery::Rejected { reason } => {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(id = %entry.id, reason = %reason, "Heartbeat rejected, dropping");
            }
            Delivery::Retry {
                reason,
                retry_after,
            } => {
                if entry.attempts >= self.retry.max_attempts {
                    self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        id = %entry.id,
                        attempts = entry.attempts,
                        age_ms = entry.enqueued_at.elapsed().as_millis(),
                        reason = %reason,
                        "Max retries exceeded, dropping heartbeat"
                    );
                    return;
                }

                let delay = self.retry.retry_delay(entry.attempts, retry_after);
                let now = Instant::now();
                entry.next_attempt_at = now.checked_add(delay).unwrap_or(now);

                self.shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = %entry.id,
                    attempt = entry.attempts,
                    delay_ms = delay.as_millis(),
                    reason = %reason,
                    "Heartbeat delivery failed, will retry"
                );
                self.shared.push(entry);
            }
        }
    }

    /// Sends every remaining entry once, ignoring backoff.
    async fn final_flush(&self) {
        let entries = self.shared.take_all();
        if entries.is_empty() {
            return;
        }

        debug!(count = entries.len(), "Final heartbeat flush");

        for entry in entries {
            match self.deliver(&entry.heartbeat).await {
                Delivery::Delivered => {
                    self.shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Rejected { reason } => {
                    self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(id = %entry.id, reason = %reason, "Heartbeat rejected, dropping");
                }
                Delivery::Retry { reason, .. } => {
                    debug!(id = %entry.id, reason = %reason, "Final flush attempt failed");
                }
            }
        }
    }

    async fn deliver(&self, heartbeat: &Heartbeat) -> Delivery {
        let result = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(heartbeat)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Delivery::Rejected {
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                return Delivery::Retry {
                    reason: e.to_string(),
                    retry_after: None,
                };
            }
        };

        let status = response.status();

        if status.is_success() {
            return Delivery::Delivered;
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(&response);
            warn!(retry_after_secs = ?retry_after.map(|d| d.as_secs()), "Rate limited by server");
            return Delivery::Retry {
                reason: status.to_string(),
                retry_after,
            };
        }

        let message = response.text().await.unwrap_or_default();
        let reason = format!("{} - {}", status.as_u16(), message.trim());

        if status.is_client_error() {
            Delivery::Rejected { reason }
        } else {
            Delivery::Retry {
                reason,
                retry_after: None,
            }
        }
    }
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => future::pending().await,
    }
}

/// Parses the Retry-After header (delay in seconds) from a 429 response.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn build_headers(config: &SenderConfig) -> Result<HeaderMap, SenderError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("wakatrack/", env!("CARGO_PKG_VERSION"))),
    );

    let credential = BASE64.encode(config.api_key.expose());
    let mut auth = HeaderValue::from_str(&format!("Basic {credential}"))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    headers.insert(MACHINE_NAME_HEADER, HeaderValue::from_str(&config.machine_name)?);

    Ok(headers)
}

/// Gets the system hostname, falling back to "unknown" if it cannot be determined.
fn get_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string())
}
