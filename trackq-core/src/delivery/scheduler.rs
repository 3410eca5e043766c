//! Delivery scheduler - background timers and single-flight delivery
//!
//! Owns a small private runtime running:
//! - the delivery timer: every send delay, start a drain if none is running
//! - the idle-flush timer: flush the queue to disk once the host went quiet
//!
//! Host threads never wait on the network; teardown waits at most
//! `shutdown_timeout` and then abandons whatever is still running.

use super::worker::{drain, Deliver, DeliveryStats, DeliveryStatsSnapshot};
use crate::config::{DeliveryConfig, TrackingConfig};
use crate::error::{Error, Result};
use crate::queue::DurableQueue;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Timer settings for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delivery timer period; `None` disables periodic delivery
    pub send_delay: Option<Duration>,
    pub idle_flush_interval: Duration,
    pub inactivity: Duration,
    pub shutdown_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(tracking: &TrackingConfig, delivery: &DeliveryConfig) -> Self {
        Self {
            send_delay: tracking.send_delay(),
            idle_flush_interval: delivery.idle_flush_interval(),
            inactivity: delivery.inactivity(),
            shutdown_timeout: delivery.shutdown_timeout(),
        }
    }
}

/// Time of the most recently composed event
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// The single-flight worker slot
struct Dispatcher {
    queue: Arc<DurableQueue>,
    worker: Arc<dyn Deliver>,
    stats: Arc<DeliveryStats>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
    handle: tokio::runtime::Handle,
}

impl Dispatcher {
    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_busy(&self) -> bool {
        self.slot().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start a drain unless one is running or there is nothing to send.
    fn try_submit(self: &Arc<Self>) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Delivery already in flight");
            return false;
        }
        if self.queue.is_empty() {
            return false;
        }

        let dispatcher = Arc::clone(self);
        *slot = Some(self.handle.spawn(async move {
            drain(
                &dispatcher.queue,
                dispatcher.worker.as_ref(),
                &dispatcher.stats,
            )
            .await;
        }));
        true
    }

    fn abort(&self) {
        if let Some(handle) = self.slot().take() {
            handle.abort();
        }
    }
}

/// Background delivery for one tracker session
pub struct DeliveryScheduler {
    runtime: Option<tokio::runtime::Runtime>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl DeliveryScheduler {
    /// Create the execution context and start both timers
    pub fn start(
        queue: Arc<DurableQueue>,
        worker: Arc<dyn Deliver>,
        activity: Arc<ActivityClock>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("trackq-delivery")
            .enable_all()
            .build()
            .map_err(|e| Error::Scheduler(format!("failed to create runtime: {}", e)))?;

        let dispatcher = Arc::new(Dispatcher {
            queue: queue.clone(),
            worker,
            stats: Arc::new(DeliveryStats::default()),
            in_flight: Mutex::new(None),
            handle: runtime.handle().clone(),
        });
        let (shutdown_tx, _) = broadcast::channel(1);

        // Delivery timer
        if let Some(period) = config.send_delay {
            let dispatcher = dispatcher.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            runtime.spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if dispatcher.try_submit() {
                                debug!("Delivery cycle started by timer");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("Delivery timer shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Idle-flush timer
        {
            let dispatcher = dispatcher.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.idle_flush_interval;
            let inactivity = config.inactivity;

            runtime.spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if activity.idle_for() > inactivity && !dispatcher.is_busy() {
                                dispatcher.queue.flush();
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("Idle-flush timer shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!(send_delay = ?config.send_delay, "Delivery scheduler started");

        Ok(Self {
            runtime: Some(runtime),
            dispatcher,
            shutdown_tx,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Start a drain right away (still single-flight).
    pub fn send_now(&self) -> bool {
        if self.runtime.is_none() {
            return false;
        }
        self.dispatcher.try_submit()
    }

    pub fn is_delivering(&self) -> bool {
        self.dispatcher.is_busy()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.dispatcher.stats.snapshot()
    }

    /// Stop timers, cancel in-flight delivery and release the runtime.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        self.dispatcher.abort();

        if tokio::runtime::Handle::try_current().is_ok() {
            // Blocking is not allowed inside another runtime
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.shutdown_timeout);
        }
        info!("Delivery scheduler stopped");
    }
}

impl Drop for DeliveryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::delivery::Outcome;
    use crate::prefs::Preferences;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Replays scripted outcomes, then consumes everything.
    struct ScriptedWorker {
        script: Mutex<Vec<Outcome>>,
        seen: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedWorker {
        fn new(script: Vec<Outcome>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl Deliver for ScriptedWorker {
        async fn deliver(&self, payload: &str) -> Outcome {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push(payload.to_string());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Outcome::Consumed
            } else {
                script.remove(0)
            }
        }
    }

    fn queue(tmp: &TempDir, entries: &[&str]) -> Arc<DurableQueue> {
        crate::logging::init_test();
        let prefs = Arc::new(Preferences::open(&tmp.path().join("prefs.db")).unwrap());
        let storage = StorageConfig {
            cache_capacity: 2,
            ..Default::default()
        };
        let queue = DurableQueue::open(tmp.path().join("requests"), prefs, &storage).unwrap();
        for entry in entries {
            queue.enqueue(entry);
        }
        Arc::new(queue)
    }

    fn config(send_delay: Option<Duration>) -> SchedulerConfig {
        SchedulerConfig {
            send_delay,
            idle_flush_interval: Duration::from_secs(3600),
            inactivity: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(4),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_send_now_drains_queue() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &["https://c.example/1", "https://c.example/2", "https://c.example/3"]);
        let worker = ScriptedWorker::new(vec![], Duration::ZERO);
        let scheduler =
            DeliveryScheduler::start(queue.clone(), worker.clone(), Arc::new(ActivityClock::new()), config(None))
                .unwrap();

        assert!(scheduler.send_now());
        assert!(wait_until(|| queue.is_empty() && !scheduler.is_delivering()));

        assert_eq!(worker.seen.lock().unwrap().len(), 3);
        let stats = scheduler.stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.cycles, 1);
        assert!(!queue.path().exists());
    }

    #[test]
    fn test_retryable_stops_cycle_and_keeps_entry() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &["https://c.example/1", "https://c.example/2"]);
        let worker = ScriptedWorker::new(vec![Outcome::Retryable], Duration::ZERO);
        let scheduler =
            DeliveryScheduler::start(queue.clone(), worker.clone(), Arc::new(ActivityClock::new()), config(None))
                .unwrap();

        assert!(scheduler.send_now());
        assert!(wait_until(|| scheduler.stats().retries == 1 && !scheduler.is_delivering()));

        assert_eq!(queue.size(), 2);
        assert_eq!(queue.peek().as_deref(), Some("https://c.example/1"));
        assert_eq!(worker.seen.lock().unwrap().len(), 1);

        // Next cycle delivers the same entry first
        assert!(scheduler.send_now());
        assert!(wait_until(|| queue.is_empty()));
        assert_eq!(worker.seen.lock().unwrap()[1], "https://c.example/1");
    }

    #[test]
    fn test_dropped_entries_are_removed() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &["bad", "https://c.example/2"]);
        let worker = ScriptedWorker::new(vec![Outcome::Dropped], Duration::ZERO);
        let scheduler =
            DeliveryScheduler::start(queue.clone(), worker, Arc::new(ActivityClock::new()), config(None))
                .unwrap();

        scheduler.send_now();
        assert!(wait_until(|| queue.is_empty() && !scheduler.is_delivering()));
        assert_eq!(scheduler.stats().dropped, 1);
        assert_eq!(scheduler.stats().sent, 1);
    }

    #[test]
    fn test_single_flight() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &["https://c.example/1"]);
        let worker = ScriptedWorker::new(vec![], Duration::from_millis(300));
        let scheduler =
            DeliveryScheduler::start(queue.clone(), worker, Arc::new(ActivityClock::new()), config(None))
                .unwrap();

        assert!(scheduler.send_now());
        assert!(!scheduler.send_now());
        assert!(wait_until(|| queue.is_empty() && !scheduler.is_delivering()));
        assert_eq!(scheduler.stats().cycles, 1);
    }

    #[test]
    fn test_empty_queue_is_not_submitted() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &[]);
        let worker = ScriptedWorker::new(vec![], Duration::ZERO);
        let scheduler =
            DeliveryScheduler::start(queue, worker, Arc::new(ActivityClock::new()), config(None)).unwrap();

        assert!(!scheduler.send_now());
        assert_eq!(scheduler.stats().cycles, 0);
    }

    #[test]
    fn test_delivery_timer_drains() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &["https://c.example/1"]);
        let worker = ScriptedWorker::new(vec![], Duration::ZERO);
        let _scheduler = DeliveryScheduler::start(
            queue.clone(),
            worker,
            Arc::new(ActivityClock::new()),
            config(Some(Duration::from_millis(50))),
        )
        .unwrap();

        assert!(wait_until(|| queue.is_empty()));
    }

    #[test]
    fn test_idle_flush_writes_cached_entries() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &["https://c.example/1"]);
        assert!(!queue.path().exists());

        let worker = ScriptedWorker::new(vec![], Duration::ZERO);
        let _scheduler = DeliveryScheduler::start(
            queue.clone(),
            worker,
            Arc::new(ActivityClock::new()),
            SchedulerConfig {
                send_delay: None,
                idle_flush_interval: Duration::from_millis(20),
                inactivity: Duration::ZERO,
                shutdown_timeout: Duration::from_secs(4),
            },
        )
        .unwrap();

        assert!(wait_until(|| queue.path().exists()));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_shutdown_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let queue = queue(&tmp, &["https://c.example/1"]);
        let worker = ScriptedWorker::new(vec![], Duration::from_secs(30));
        let mut scheduler =
            DeliveryScheduler::start(queue.clone(), worker, Arc::new(ActivityClock::new()), config(None))
                .unwrap();

        assert!(scheduler.send_now());
        let started = Instant::now();
        scheduler.shutdown();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!scheduler.send_now());
        // Interrupted delivery leaves the entry queued
        assert_eq!(queue.size(), 1);
    }
}
