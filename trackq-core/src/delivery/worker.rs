//! HTTP delivery worker and the drain loop.

use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::queue::DurableQueue;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The collector answered (any status); remove the entry
    Consumed,
    /// Transient network failure; keep the entry and stop this cycle
    Retryable,
    /// The entry can never succeed; remove it
    Dropped,
}

/// Sends one request payload.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, payload: &str) -> Outcome;
}

/// reqwest-backed worker issuing plain GET requests
pub struct HttpDeliveryWorker {
    http_client: reqwest::Client,
}

impl HttpDeliveryWorker {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.connect_timeout() + config.read_timeout())
            .build()
            .map_err(|e| Error::Delivery(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl Deliver for HttpDeliveryWorker {
    async fn deliver(&self, payload: &str) -> Outcome {
        let url = match parse_request_url(payload) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed request");
                return Outcome::Dropped;
            }
        };

        match self.http_client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    tracing::debug!(status = status.as_u16(), "Request delivered");
                } else {
                    tracing::warn!(status = status.as_u16(), "Collector answered with non-success status");
                }
                Outcome::Consumed
            }
            Err(e) => {
                let outcome = classify_error(&e);
                match outcome {
                    Outcome::Retryable => {
                        tracing::info!(error = %e, "Delivery failed, will retry")
                    }
                    _ => tracing::warn!(error = %e, "Delivery failed, dropping request"),
                }
                outcome
            }
        }
    }
}

fn parse_request_url(payload: &str) -> Result<reqwest::Url> {
    let url =
        reqwest::Url::parse(payload).map_err(|e| Error::InvalidUrl(format!("{}: {}", e, payload)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::InvalidUrl(format!("unsupported scheme {}", other))),
    }
}

/// Map a transport error onto an outcome.
pub fn classify_error(err: &reqwest::Error) -> Outcome {
    if err.is_builder() {
        return Outcome::Dropped;
    }
    if err.is_timeout() || err.is_connect() {
        return Outcome::Retryable;
    }
    if has_transient_io_source(err) {
        return Outcome::Retryable;
    }
    // Connections closed mid-exchange surface as request errors without an io source
    if err.is_request() && err.to_string().to_lowercase().contains("connection") {
        return Outcome::Retryable;
    }
    Outcome::Dropped
}

fn has_transient_io_source(err: &(dyn std::error::Error + 'static)) -> bool {
    use std::io::ErrorKind;

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

/// Counters across drain cycles
#[derive(Debug, Default)]
pub struct DeliveryStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
    cycles: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatsSnapshot {
    pub sent: u64,
    pub dropped: u64,
    pub retries: u64,
    pub cycles: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}

/// What one drain cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub dropped: usize,
    /// The cycle stopped on a transient failure
    pub interrupted: bool,
}

/// Deliver queued entries until the queue is empty or an attempt is retryable.
pub async fn drain(queue: &DurableQueue, worker: &dyn Deliver, stats: &DeliveryStats) -> DrainReport {
    let mut report = DrainReport::default();
    stats.cycles.fetch_add(1, Ordering::Relaxed);

    while let Some(entry) = queue.peek_entry() {
        match worker.deliver(&entry.payload).await {
            Outcome::Consumed => {
                queue.remove_entry(entry.id);
                stats.sent.fetch_add(1, Ordering::Relaxed);
                report.sent += 1;
            }
            Outcome::Dropped => {
                queue.remove_entry(entry.id);
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                report.dropped += 1;
            }
            Outcome::Retryable => {
                stats.retries.fetch_add(1, Ordering::Relaxed);
                report.interrupted = true;
                break;
            }
        }
    }

    if queue.is_empty() {
        queue.delete_requests_file();
    }

    tracing::debug!(
        sent = report.sent,
        dropped = report.dropped,
        interrupted = report.interrupted,
        remaining = queue.size(),
        "Drain cycle finished"
    );
    report
}

/// Run one drain on a private current-thread runtime.
pub fn deliver_all_blocking(queue: &DurableQueue, config: &DeliveryConfig) -> Result<DrainReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Scheduler(format!("failed to create runtime: {}", e)))?;
    let worker = HttpDeliveryWorker::new(config)?;
    let stats = DeliveryStats::default();

    Ok(runtime.block_on(drain(queue, &worker, &stats)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> HttpDeliveryWorker {
        HttpDeliveryWorker::new(&DeliveryConfig {
            connect_timeout_secs: 2,
            read_timeout_secs: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_parse_request_url() {
        assert!(parse_request_url("https://q3.example.net/1/wt?p=470,0&eor=1").is_ok());
        assert!(parse_request_url("not a url").is_err());
        assert!(parse_request_url("ftp://example.net/file").is_err());
    }

    #[tokio::test]
    async fn test_malformed_url_is_dropped() {
        assert_eq!(worker().deliver("::garbage::").await, Outcome::Dropped);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        // Bind and immediately release a port so nothing listens on it
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/1/wt?p=470,0&eor=1", port);

        assert_eq!(worker().deliver(&url).await, Outcome::Retryable);
    }

    #[test]
    fn test_stats_snapshot_starts_at_zero() {
        let stats = DeliveryStats::default();
        assert_eq!(stats.snapshot(), DeliveryStatsSnapshot::default());
    }
}
