//! Integration tests for the heartbeat dispatch queue.
//!
//! These tests run the background drain task against a mock heartbeat
//! endpoint and verify delivery, retry, drop and shutdown behavior.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use wakatrack::config::ApiKey;
use wakatrack::sender::{DispatchQueue, DispatchStats, RetryPolicy, SenderConfig};
use wakatrack::types::Heartbeat;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

const API_KEY: &str = "waka_test_key";

fn heartbeat(entity: &str) -> Heartbeat {
    Heartbeat::new(entity, false)
}

/// Creates a sender config for the mock server with a fast retry policy.
fn test_config(server: &MockServer) -> SenderConfig {
    SenderConfig::new(format!("{}/heartbeats", server.uri()), ApiKey::new(API_KEY))
        .with_timeout(Duration::from_secs(5))
        .with_retry_policy(RetryPolicy::fast_for_tests())
}

/// Polls queue stats until `condition` holds or five seconds pass.
async fn wait_for<F>(queue: &DispatchQueue, condition: F) -> DispatchStats
where
    F: Fn(&DispatchStats) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = queue.stats();
        if condition(&stats) {
            return stats;
        }
        assert!(
            Instant::now() < deadline,
            "condition not reached, last stats: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map_or(0, |requests| requests.len())
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn test_delivers_heartbeat_with_basic_auth() {
    let server = MockServer::start().await;
    let expected_auth = format!("Basic {}", BASE64.encode(API_KEY));

    Mock::given(method("POST"))
        .and(path("/heartbeats"))
        .and(header("authorization", expected_auth.as_str()))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let queue = DispatchQueue::spawn(test_config(&server)).unwrap();
    queue.enqueue(heartbeat("/repo/src/a.rs"));

    let stats = wait_for(&queue, |s| s.delivered == 1).await;
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.pending, 0);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["entity"], "/repo/src/a.rs");
    assert_eq!(body["type"], "file");
    assert!(requests[0].headers.contains_key("x-machine-name"));

    let report = queue.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.unsent, 0);
    assert!(!report.timed_out);
}

#[tokio::test]
async fn test_transient_errors_are_retried_until_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let queue = DispatchQueue::spawn(test_config(&server)).unwrap();
    queue.enqueue(heartbeat("/repo/a.rs"));

    let stats = wait_for(&queue, |s| s.delivered == 1).await;
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(request_count(&server).await, 3);

    queue.shutdown(Duration::from_secs(1)).await;
}

// =============================================================================
// Retry ceiling and permanent errors
// =============================================================================

/// A heartbeat that fails five times is dropped and never tried a sixth time.
#[tokio::test]
async fn test_drops_after_max_attempts() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal server error"))
        .mount(&server)
        .await;

    let queue = DispatchQueue::spawn(test_config(&server)).unwrap();
    queue.enqueue(heartbeat("/repo/a.rs"));

    let stats = wait_for(&queue, |s| s.failed == 1).await;
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.retried, 4);

    // Longer than the capped backoff: a sixth attempt would have happened by now
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(request_count(&server).await, 5);
    assert_eq!(queue.stats().pending, 0);

    let report = queue.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.unsent, 0);
}

#[tokio::test]
async fn test_retry_ceiling_is_configurable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let config = test_config(&server)
        .with_retry_policy(RetryPolicy::fast_for_tests().with_max_attempts(2));
    let queue = DispatchQueue::spawn(config).unwrap();
    queue.enqueue(heartbeat("/repo/a.rs"));

    wait_for(&queue, |s| s.failed == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(request_count(&server).await, 2);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&server)
        .await;

    let queue = DispatchQueue::spawn(test_config(&server)).unwrap();
    queue.enqueue(heartbeat("/repo/a.rs"));

    let stats = wait_for(&queue, |s| s.failed == 1).await;
    assert_eq!(stats.retried, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(request_count(&server).await, 1);

    queue.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_rate_limit_honours_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let queue = DispatchQueue::spawn(test_config(&server)).unwrap();
    let started = Instant::now();
    queue.enqueue(heartbeat("/repo/a.rs"));

    wait_for(&queue, |s| s.retried == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(request_count(&server).await, 1, "retry must wait for Retry-After");

    wait_for(&queue, |s| s.delivered == 1).await;
    assert!(started.elapsed() >= Duration::from_secs(1));

    queue.shutdown(Duration::from_secs(1)).await;
}

/// Oversized Retry-After values are capped at the maximum backoff and never
/// stall the dispatcher.
#[tokio::test]
async fn test_oversized_retry_after_is_capped() {
    for retry_after in ["18446744073709551615", "86400"] {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", retry_after))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let policy = RetryPolicy::fast_for_tests();
        let max_delay = policy.max_delay;
        let queue = DispatchQueue::spawn(test_config(&server)).unwrap();

        let started = Instant::now();
        queue.enqueue(heartbeat("/repo/limited.rs"));
        wait_for(&queue, |s| s.retried == 1).await;

        // The dispatcher is still alive and serving new heartbeats
        queue.enqueue(heartbeat("/repo/next.rs"));
        let stats = wait_for(&queue, |s| s.delivered == 2).await;

        assert_eq!(stats.failed, 0);
        assert!(
            started.elapsed() < max_delay + Duration::from_secs(2),
            "Retry-After {retry_after} was not capped"
        );

        let report = queue.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.unsent, 0);
        assert!(!report.timed_out);
    }
}

// =============================================================================
// Decoupling from the editing path
// =============================================================================

/// Enqueue returns immediately even while the endpoint never answers.
#[tokio::test]
async fn test_enqueue_does_not_block_when_endpoint_hangs() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
        .mount(&server)
        .await;

    let config = test_config(&server).with_timeout(Duration::from_secs(120));
    let queue = DispatchQueue::spawn(config).unwrap();

    // Let the worker get stuck on the first request
    queue.enqueue(heartbeat("/repo/first.rs"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    for i in 0..500 {
        queue.enqueue(heartbeat(&format!("/repo/file{i}.rs")));
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(250),
        "enqueue took {elapsed:?} while the endpoint hung"
    );
    assert_eq!(queue.stats().enqueued, 501);

    let shutdown_started = Instant::now();
    let report = queue.shutdown(Duration::from_millis(200)).await;
    assert!(report.timed_out);
    assert_eq!(report.stats.delivered, 0);
    assert_eq!(report.unsent, 501);
    assert!(shutdown_started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_overflow_evicts_oldest_entries() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(60)))
        .mount(&server)
        .await;

    let config = test_config(&server)
        .with_timeout(Duration::from_secs(120))
        .with_buffer_size(3);
    let queue = DispatchQueue::spawn(config).unwrap();

    let evicted: usize = (0..10)
        .map(|i| queue.enqueue(heartbeat(&format!("/repo/file{i}.rs"))))
        .sum();

    let stats = queue.stats();
    assert!(evicted >= 6, "expected at least 6 evictions, got {evicted}");
    assert_eq!(stats.evicted, evicted as u64);
    assert!(stats.pending <= 3);

    queue.shutdown(Duration::from_millis(100)).await;
}

// =============================================================================
// Shutdown
// =============================================================================

/// Entries waiting on backoff get one final attempt at shutdown.
#[tokio::test]
async fn test_shutdown_flushes_entries_waiting_for_retry() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let slow_retry = RetryPolicy {
        base_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(60),
        max_attempts: 5,
        jitter: 0.0,
    };
    let config = test_config(&server).with_retry_policy(slow_retry);
    let queue = DispatchQueue::spawn(config).unwrap();
    queue.enqueue(heartbeat("/repo/a.rs"));

    let stats = wait_for(&queue, |s| s.retried == 1).await;
    assert_eq!(stats.pending, 1);

    let report = queue.shutdown(Duration::from_secs(2)).await;
    assert!(!report.timed_out);
    assert_eq!(report.stats.delivered, 1);
    assert_eq!(report.unsent, 0);
}

/// A permanent rejection during the final flush counts as failed, not unsent.
#[tokio::test]
async fn test_shutdown_counts_rejected_flush_as_failed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Bad heartbeat"))
        .mount(&server)
        .await;

    let slow_retry = RetryPolicy {
        base_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(60),
        max_attempts: 5,
        jitter: 0.0,
    };
    let queue = DispatchQueue::spawn(test_config(&server).with_retry_policy(slow_retry)).unwrap();
    queue.enqueue(heartbeat("/repo/a.rs"));

    wait_for(&queue, |s| s.retried == 1).await;

    let report = queue.shutdown(Duration::from_secs(2)).await;
    assert!(!report.timed_out);
    assert_eq!(report.stats.delivered, 0);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.unsent, 0);
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_shutdown_of_idle_queue_is_immediate() {
    let server = MockServer::start().await;
    let queue = DispatchQueue::spawn(test_config(&server)).unwrap();

    let started = Instant::now();
    let report = queue.shutdown(Duration::from_secs(5)).await;

    assert!(!report.timed_out);
    assert_eq!(report.unsent, 0);
    assert!(started.elapsed() < Duration::from_secs(1));
}
