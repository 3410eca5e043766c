//! Tracker session handle.
//!
//! One `Tracker` is constructed by the host and shared by reference. It owns
//! the durable queue, the staging store and the delivery scheduler, and
//! turns tracking calls into queued request strings:
//!
//! ```text
//! track_* -> Composer -> TrackingRequest -+-> StagingStore (attribution pending)
//!                                         +-> opt-out/sampling gate -> DurableQueue
//! ```

use crate::config::{Config, DeliveryConfig, StorageConfig, TrackingConfig};
use crate::delivery::{
    ActivityClock, Deliver, DeliveryScheduler, DeliveryStatsSnapshot, HttpDeliveryWorker,
    SchedulerConfig,
};
use crate::error::Result;
use crate::identity;
use crate::prefs::Preferences;
use crate::queue::DurableQueue;
use crate::request::{
    Category, Composer, EventKind, Facts, Param, ParameterSet, RequestKind, TrackingRequest,
    REQUEST_STORE_SIZE_FACT,
};
use crate::staging::{StagedRequest, StagingStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Action name carried by exception reports
const EXCEPTION_ACTION_NAME: &str = "app_exception";
const EXCEPTION_NAME_INDEX: &str = "910";
const EXCEPTION_MESSAGE_INDEX: &str = "911";
const EXCEPTION_MESSAGE_MAX_CHARS: usize = 255;

/// E-commerce index flagging the install conversion
const INSTALL_GOAL_INDEX: &str = "900";

#[derive(Debug, Default)]
struct AttributionState {
    pending: bool,
    install_goal: bool,
    media_code: Option<String>,
}

impl AttributionState {
    /// Attach one-shot attribution results to the first request after resolution.
    fn apply(&mut self, parameters: &mut ParameterSet) {
        if self.install_goal {
            parameters.set_category(Category::Ecommerce, INSTALL_GOAL_INDEX, "1");
            self.install_goal = false;
        }
        if let Some(code) = self.media_code.take() {
            parameters.set(Param::Advertisement, code);
            parameters.set(Param::AdvertisementAction, "c");
        }
    }
}

pub struct Tracker {
    config: RwLock<Arc<TrackingConfig>>,
    delivery: DeliveryConfig,
    prefs: Arc<Preferences>,
    queue: Arc<DurableQueue>,
    staging: StagingStore,
    composer: Mutex<Composer>,
    facts: RwLock<Facts>,
    ever_id: String,
    opted_out: AtomicBool,
    sampled_out: AtomicBool,
    attribution: Mutex<AttributionState>,
    activity: Arc<ActivityClock>,
    worker: Arc<dyn Deliver>,
    scheduler: Mutex<Option<DeliveryScheduler>>,
}

impl Tracker {
    /// Open a session delivering over HTTP.
    pub fn open(config: &Config) -> Result<Self> {
        let worker = Arc::new(HttpDeliveryWorker::new(&config.delivery)?);
        Self::with_worker(
            config.tracking.clone(),
            &config.storage,
            &config.delivery,
            worker,
        )
    }

    /// Open a session with a custom delivery worker.
    pub fn with_worker(
        tracking: TrackingConfig,
        storage: &StorageConfig,
        delivery: &DeliveryConfig,
        worker: Arc<dyn Deliver>,
    ) -> Result<Self> {
        tracking.validate()?;

        let prefs = Arc::new(Preferences::open(&storage.preferences_path())?);
        let queue = Arc::new(DurableQueue::open(
            storage.queue_path(),
            prefs.clone(),
            storage,
        )?);

        let ever_id = identity::load_or_create_ever_id(&prefs)?;
        let sampled_out = identity::resolve_sampling(&prefs, &ever_id, tracking.sampling)?;
        let opted_out = prefs.is_opted_out()?;
        let first_launch = prefs.take_first_start()?;

        let activity = Arc::new(ActivityClock::new());
        let scheduler = DeliveryScheduler::start(
            queue.clone(),
            worker.clone(),
            activity.clone(),
            SchedulerConfig::new(&tracking, delivery),
        )?;

        tracing::info!(
            track_id = %tracking.track_id,
            config_version = tracking.version,
            queued = queue.size(),
            opted_out,
            sampled_out,
            "Tracker session started"
        );

        Ok(Self {
            config: RwLock::new(Arc::new(tracking)),
            delivery: delivery.clone(),
            prefs,
            queue,
            staging: StagingStore::new(storage.staging_path()),
            composer: Mutex::new(Composer::new(first_launch)),
            facts: RwLock::new(Facts::default()),
            ever_id,
            opted_out: AtomicBool::new(opted_out),
            sampled_out: AtomicBool::new(sampled_out),
            attribution: Mutex::new(AttributionState::default()),
            activity,
            worker,
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    // ============================================
    // Configuration and facts
    // ============================================

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<TrackingConfig> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Adopt a newer snapshot; older or equal versions are ignored.
    pub fn update_configuration(&self, tracking: TrackingConfig) -> Result<bool> {
        let current = self.config();
        if tracking.version <= current.version {
            tracing::debug!(
                current = current.version,
                offered = tracking.version,
                "Ignoring configuration that is not newer"
            );
            return Ok(false);
        }
        tracking.validate()?;

        let sampled_out = identity::resolve_sampling(&self.prefs, &self.ever_id, tracking.sampling)?;
        self.sampled_out.store(sampled_out, Ordering::SeqCst);

        let restart_scheduler = tracking.send_delay() != current.send_delay();
        let tracking = Arc::new(tracking);
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = tracking.clone();

        if restart_scheduler {
            let mut slot = lock(&self.scheduler);
            if let Some(mut old) = slot.take() {
                old.shutdown();
                *slot = Some(DeliveryScheduler::start(
                    self.queue.clone(),
                    self.worker.clone(),
                    self.activity.clone(),
                    SchedulerConfig::new(&tracking, &self.delivery),
                )?);
            }
        }

        tracing::info!(version = tracking.version, "Adopted new configuration");
        Ok(true)
    }

    /// Replace the device/session facts supplied by the host's collectors.
    pub fn set_facts(&self, facts: Facts) {
        *self.facts.write().unwrap_or_else(|e| e.into_inner()) = facts;
    }

    pub fn set_constant_global_parameters(&self, parameters: ParameterSet) {
        lock(&self.composer).set_constant_global_parameters(parameters);
    }

    pub fn set_global_parameters(&self, parameters: ParameterSet) {
        lock(&self.composer).set_global_parameters(parameters);
    }

    pub fn set_custom_parameter(&self, key: &str, value: &str) {
        lock(&self.composer).set_custom_parameter(key, value);
    }

    pub fn set_custom_page_name(&self, name: Option<String>) {
        lock(&self.composer).set_custom_page_name(name);
    }

    pub fn force_new_session(&self) {
        lock(&self.composer).force_new_session();
    }

    pub fn ever_id(&self) -> &str {
        &self.ever_id
    }

    // ============================================
    // Tracking calls
    // ============================================

    /// Track a screen view.
    pub fn track_page(&self, screen: &str, parameters: ParameterSet) {
        let parameters = self.compose(Some(screen), EventKind::Page, &parameters);
        self.submit(TrackingRequest::new(RequestKind::General, parameters));
    }

    /// Track a screen view carrying identity-resolution fields.
    pub fn track_page_with_identity(&self, screen: &str, parameters: ParameterSet, identity: ParameterSet) {
        let parameters = self.compose(Some(screen), EventKind::Page, &parameters);
        self.submit(TrackingRequest::new(RequestKind::General, parameters).with_identity(identity));
    }

    /// Track an action on the current screen with the reduced payload.
    pub fn track_action(&self, parameters: ParameterSet) {
        let parameters = self.compose(None, EventKind::Action, &parameters);
        self.submit(TrackingRequest::new(RequestKind::General, parameters));
    }

    /// Send a standalone identity-resolution request.
    pub fn track_identity(&self, identity: ParameterSet) {
        let mut parameters = identity;
        parameters.set(Param::EverId, self.ever_id.as_str());
        self.submit(TrackingRequest::new(RequestKind::Identity, parameters));
    }

    /// Report an exception by name and message.
    pub fn track_exception(&self, name: &str, message: &str) {
        let message: String = message.chars().take(EXCEPTION_MESSAGE_MAX_CHARS).collect();
        let parameters = ParameterSet::new()
            .with(Param::Timestamp, Utc::now().timestamp_millis().to_string())
            .with(Param::ActionName, EXCEPTION_ACTION_NAME)
            .with_category(Category::Action, EXCEPTION_NAME_INDEX, name)
            .with_category(Category::Action, EXCEPTION_MESSAGE_INDEX, message);
        self.submit(TrackingRequest::new(RequestKind::Exception, parameters));
    }

    /// Send the install-attribution request.
    pub fn track_install(&self, click_id: Option<&str>, ad_id: Option<&str>) {
        let config = self.config();
        let mut parameters = ParameterSet::new().with(Param::InstallTrackId, config.track_id.as_str());
        if let Some(click_id) = click_id {
            parameters.set(Param::InstallClickId, click_id);
        }
        if let Some(ad_id) = ad_id {
            parameters.set(Param::InstallAdId, ad_id);
        }
        let facts = self.facts.read().unwrap_or_else(|e| e.into_inner());
        if let Some(user_agent) = facts.defaults.get(Param::UserAgent) {
            parameters.set(Param::UserAgent, user_agent);
        }
        drop(facts);

        self.submit(TrackingRequest::new(RequestKind::Install, parameters));
    }

    fn compose(&self, screen: Option<&str>, kind: EventKind, explicit: &ParameterSet) -> ParameterSet {
        let config = self.config();
        let facts = self.effective_facts(&config);

        let mut composer = lock(&self.composer);
        if let Some(screen) = screen {
            composer.set_current_screen(screen);
        }
        let parameters = composer.compose(kind, explicit, &config, &facts, Utc::now());
        composer.finish_event();
        parameters
    }

    /// Host facts plus the identity facts owned by the session.
    fn effective_facts(&self, config: &TrackingConfig) -> Facts {
        let mut facts = self
            .facts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        facts.defaults.set(Param::EverId, self.ever_id.as_str());
        if config.sampling > 0 {
            facts.defaults.set(Param::Sampling, config.sampling.to_string());
        }
        if config.auto_tracked.request_store_size {
            facts
                .custom
                .insert(REQUEST_STORE_SIZE_FACT.to_string(), self.queue.size().to_string());
        }
        facts
    }

    fn submit(&self, mut request: TrackingRequest) {
        self.activity.touch();
        let config = self.config();
        let mut attribution = lock(&self.attribution);

        if attribution.pending {
            self.staging
                .save(&StagedRequest::new(request, config.version));
            return;
        }

        if self.drain_staging(&mut attribution, &config) == 0 {
            attribution.apply(&mut request.parameters);
        }
        drop(attribution);

        self.enqueue_gated(&request.to_url(&config));
    }

    /// Move staged requests into the queue, rebuilt against `config`.
    fn drain_staging(&self, attribution: &mut AttributionState, config: &TrackingConfig) -> usize {
        let mut first = true;
        self.staging.drain(|mut staged| {
            if first {
                attribution.apply(&mut staged.request.parameters);
                first = false;
            }
            if staged.config_version != config.version {
                tracing::debug!(
                    staged_version = staged.config_version,
                    current_version = config.version,
                    "Rebuilding staged request against current configuration"
                );
            }
            self.enqueue_gated(&staged.request.to_url(config));
        })
    }

    fn enqueue_gated(&self, url: &str) {
        if self.opted_out.load(Ordering::SeqCst) {
            tracing::debug!("Opted out, request discarded");
            return;
        }
        if self.sampled_out.load(Ordering::SeqCst) {
            tracing::debug!("Device sampled out, request discarded");
            return;
        }
        self.queue.enqueue(url);
    }

    // ============================================
    // Attribution
    // ============================================

    /// While pending, composed requests are staged instead of queued.
    pub fn set_attribution_pending(&self, pending: bool) {
        let config = self.config();
        let mut attribution = lock(&self.attribution);
        attribution.pending = pending;
        if !pending {
            self.drain_staging(&mut attribution, &config);
        }
    }

    /// Clear the pending state, remembering an attribution media code if any.
    pub fn resolve_attribution(&self, media_code: Option<String>) {
        {
            let mut attribution = lock(&self.attribution);
            if media_code.is_some() {
                attribution.media_code = media_code;
            }
        }
        self.set_attribution_pending(false);
    }

    /// Flag the next request leaving attribution as the install conversion.
    pub fn mark_install_goal(&self) {
        lock(&self.attribution).install_goal = true;
    }

    pub fn is_attribution_pending(&self) -> bool {
        lock(&self.attribution).pending
    }

    // ============================================
    // Privacy gates
    // ============================================

    /// Persist the opt-out flag; opting out without `send_pending` wipes the queue.
    pub fn set_opt_out(&self, opt_out: bool, send_pending: bool) {
        if self.opted_out.swap(opt_out, Ordering::SeqCst) == opt_out {
            return;
        }
        if let Err(e) = self.prefs.set_opted_out(opt_out) {
            tracing::warn!(error = %e, "Failed to persist opt-out flag");
        }
        tracing::info!(opt_out, "Opt-out changed");

        if opt_out {
            if send_pending {
                self.send_now();
            } else {
                self.clear_all_tracking_data();
            }
        }
    }

    pub fn is_opted_out(&self) -> bool {
        self.opted_out.load(Ordering::SeqCst)
    }

    pub fn is_sampled_out(&self) -> bool {
        self.sampled_out.load(Ordering::SeqCst)
    }

    /// Drop every queued and staged request.
    pub fn clear_all_tracking_data(&self) {
        self.queue.clear_all_tracking_data();
        self.staging.delete();
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Persist in-memory queue entries now.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Start a delivery cycle immediately if none is running.
    pub fn send_now(&self) -> bool {
        lock(&self.scheduler)
            .as_ref()
            .map(|s| s.send_now())
            .unwrap_or(false)
    }

    pub fn is_delivering(&self) -> bool {
        lock(&self.scheduler)
            .as_ref()
            .is_some_and(|s| s.is_delivering())
    }

    pub fn delivery_stats(&self) -> DeliveryStatsSnapshot {
        lock(&self.scheduler)
            .as_ref()
            .map(|s| s.stats())
            .unwrap_or_default()
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }

    /// Stop background delivery and persist the queue.
    pub fn teardown(&self) {
        if let Some(mut scheduler) = lock(&self.scheduler).take() {
            scheduler.shutdown();
        }
        self.queue.flush();
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
