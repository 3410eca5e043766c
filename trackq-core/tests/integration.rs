//! Integration tests for the queue and delivery pipeline
//!
//! A wiremock server stands in for the collector.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use trackq_core::config::{DeliveryConfig, StorageConfig, TrackingConfig};
use trackq_core::delivery::{drain, DeliveryStats, HttpDeliveryWorker};
use trackq_core::{Category, DurableQueue, ParameterSet, Preferences, Tracker};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn storage(tmp: &TempDir, cache_capacity: usize) -> StorageConfig {
    StorageConfig {
        data_dir: Some(tmp.path().to_path_buf()),
        cache_capacity,
        ..Default::default()
    }
}

fn open_queue(tmp: &TempDir, cache_capacity: usize) -> DurableQueue {
    let storage = storage(tmp, cache_capacity);
    let prefs = Arc::new(Preferences::open(&storage.preferences_path()).unwrap());
    DurableQueue::open(storage.queue_path(), prefs, &storage).unwrap()
}

fn delivery(timeout_secs: u64) -> DeliveryConfig {
    DeliveryConfig {
        connect_timeout_secs: timeout_secs,
        read_timeout_secs: timeout_secs,
        ..Default::default()
    }
}

// ============================================
// Queue durability
// ============================================

#[test]
fn test_head_survives_restart_beyond_cache_capacity() {
    let tmp = TempDir::new().unwrap();

    let before = {
        let queue = open_queue(&tmp, 3);
        for i in 0..10 {
            queue.enqueue(&format!("https://c.example/1/wt?p=470,0&n={}", i));
        }
        queue.peek()
    };

    let queue = open_queue(&tmp, 3);
    assert_eq!(queue.peek(), before);
    assert_eq!(queue.size(), 10);
}

#[test]
fn test_flushed_queue_replays_in_order_after_restart() {
    let tmp = TempDir::new().unwrap();

    {
        let queue = open_queue(&tmp, 4);
        for i in 0..25 {
            queue.enqueue(&format!("req-{}", i));
        }
        for _ in 0..5 {
            queue.remove_last_url();
        }
        queue.flush();
    }

    let queue = open_queue(&tmp, 4);
    let mut replayed = Vec::new();
    while let Some(payload) = queue.peek() {
        replayed.push(payload);
        queue.remove_last_url();
    }

    let expected: Vec<String> = (5..25).map(|i| format!("req-{}", i)).collect();
    assert_eq!(replayed, expected);
}

// ============================================
// Delivery classification
// ============================================

#[tokio::test]
async fn test_any_http_status_consumes_entry() {
    let server = MockServer::start().await;
    for (route, status) in [("/ok", 200), ("/missing", 404), ("/broken", 500)] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;
    }

    let tmp = TempDir::new().unwrap();
    let queue = open_queue(&tmp, 2);
    for route in ["/ok", "/missing", "/broken"] {
        queue.enqueue(&format!("{}{}", server.uri(), route));
    }

    let worker = HttpDeliveryWorker::new(&delivery(5)).unwrap();
    let stats = DeliveryStats::default();
    let report = drain(&queue, &worker, &stats).await;

    assert_eq!(report.sent, 3);
    assert!(!report.interrupted);
    assert_eq!(queue.size(), 0);
    assert!(!queue.path().exists());
}

#[tokio::test]
async fn test_timeout_keeps_entry_at_head() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let queue = open_queue(&tmp, 2);
    let first = format!("{}/slow/1", server.uri());
    queue.enqueue(&first);
    queue.enqueue(&format!("{}/slow/2", server.uri()));

    let worker = HttpDeliveryWorker::new(&delivery(1)).unwrap();
    let stats = DeliveryStats::default();
    let report = drain(&queue, &worker, &stats).await;

    assert!(report.interrupted);
    assert_eq!(report.sent, 0);
    assert_eq!(queue.size(), 2);
    assert_eq!(queue.peek(), Some(first));
    assert_eq!(stats.snapshot().retries, 1);
}

#[tokio::test]
async fn test_malformed_entry_is_dropped_and_drain_continues() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let queue = open_queue(&tmp, 2);
    queue.enqueue("definitely not a url");
    queue.enqueue(&format!("{}/next", server.uri()));

    let worker = HttpDeliveryWorker::new(&delivery(5)).unwrap();
    let stats = DeliveryStats::default();
    let report = drain(&queue, &worker, &stats).await;

    assert_eq!(report.dropped, 1);
    assert_eq!(report.sent, 1);
    assert!(queue.is_empty());
}

// ============================================
// End to end
// ============================================

#[tokio::test]
async fn test_tracker_delivers_composed_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/111/wt"))
        .and(query_param("cb4", "checkout"))
        .and(query_param("eor", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let tracking = TrackingConfig {
        version: 1,
        track_domain: server.uri(),
        track_id: "111".to_string(),
        send_delay_secs: 0,
        ..Default::default()
    };
    let tracker = Tracker::with_worker(
        tracking,
        &storage(&tmp, 20),
        &delivery(5),
        Arc::new(HttpDeliveryWorker::new(&delivery(5)).unwrap()),
    )
    .unwrap();

    tracker.track_page(
        "Home",
        ParameterSet::new().with_category(Category::Ecommerce, "4", "checkout"),
    );
    assert!(tracker.send_now());

    for _ in 0..500 {
        if tracker.queue().is_empty() && !tracker.is_delivering() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(tracker.queue().is_empty());
    assert_eq!(tracker.delivery_stats().sent, 1);
}
