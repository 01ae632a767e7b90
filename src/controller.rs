use crate::config::{ControllerConfig, Defaults, TargetConfig};
use crate::detector::{BlockDetector, Classification};
use crate::fetch::{FetchResult, Fetcher, Sink};
use crate::identity::{Identity, IdentityPool};
use crate::metrics::Metrics;
use crate::pacing::DelayModel;
use crate::recovery::{RecoveryController, Transition};
use crate::scheduler::AdaptiveScheduler;
use crate::session::SessionStore;
use crate::store::{BlockEventRecord, ControllerStore, PoolStatsRecord, SessionRecord};
use crate::util::now_epoch_secs;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

/// Default sink: flags new content when the body hash changes between
/// successful fetches of the same target. Real deployments hang their
/// extraction pipeline behind the `Sink` trait instead.
pub struct ChangeDetectSink {
    last_hashes: dashmap::DashMap<String, u64>,
}

impl ChangeDetectSink {
    pub fn new() -> Self {
        Self {
            last_hashes: dashmap::DashMap::new(),
        }
    }
}

impl Default for ChangeDetectSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for ChangeDetectSink {
    async fn submit(&self, target: &str, result: &FetchResult) -> bool {
        let mut hasher = DefaultHasher::new();
        result.body.hash(&mut hasher);
        let digest = hasher.finish();

        // First sighting is a baseline, not a hit.
        self.last_hashes
            .insert(target.to_string(), digest)
            .map(|previous| previous != digest)
            .unwrap_or(false)
    }
}

/// The adaptive stealth-crawling control loop.
///
/// Owns the full cycle per due target: acquire identity -> load or create
/// session -> behavioral delay -> fetch -> classify -> recovery transition ->
/// scheduler update -> persist. Workers are bounded by a semaphore; a target
/// is removed from the due set the instant it is dispatched, so no two
/// workers ever overlap on one target. No lock is held across the delay or
/// fetch awaits.
pub struct Controller {
    targets: HashMap<String, TargetConfig>,
    pool: IdentityPool,
    delays: DelayModel,
    sessions: SessionStore,
    detector: BlockDetector,
    recovery: RecoveryController,
    scheduler: AdaptiveScheduler,
    store: Arc<ControllerStore>,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn Sink>,
    metrics: Metrics,
    permits: Arc<Semaphore>,
    worker_count: u32,
    block_log_cap: usize,
}

impl Controller {
    /// Build the controller and restore all persisted per-target state.
    pub fn new<P: AsRef<Path>>(
        config: ControllerConfig,
        data_dir: P,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn Sink>,
    ) -> Result<Self, crate::store::StoreError> {
        let store = Arc::new(ControllerStore::new(data_dir)?);

        let pool = IdentityPool::new(config.identities.clone(), &config.pool);
        if let Some(stats) = store.load_pool_stats()? {
            pool.seed_stats(&stats.counters);
        }

        let recovery = RecoveryController::new(config.recovery.clone());
        let scheduler = AdaptiveScheduler::new(config.window_learning_rate);

        let mut targets = HashMap::new();
        for target in &config.targets {
            scheduler.register(target);
            if let Some(record) = store.load_recovery(&target.key)? {
                recovery.seed(&target.key, record);
            }
            if let Some(record) = store.load_schedule(&target.key)? {
                scheduler.seed(&target.key, record);
            }
            targets.insert(target.key.clone(), target.clone());
        }

        let sessions = SessionStore::new(Arc::clone(&store), config.session_freshness_secs);
        let worker_count = config.workers.max(1) as u32;
        let permits = Arc::new(Semaphore::new(worker_count as usize));
        let block_log_cap = config.recovery.block_log_cap;

        Ok(Self {
            targets,
            pool,
            delays: DelayModel::new(config.pacing.clone()),
            sessions,
            detector: BlockDetector::new(),
            recovery,
            scheduler,
            store,
            fetcher,
            sink,
            metrics: Metrics::new(),
            permits,
            worker_count,
            block_log_cap,
        })
    }

    /// Main loop: tick, collect due targets, dispatch each to a bounded
    /// worker. Returns once the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_millis(Defaults::TICK_INTERVAL_MS));

        tracing::info!(
            targets = self.targets.len(),
            identities = self.pool.len(),
            "Controller loop started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let now = now_epoch_secs();
            for key in self.scheduler.due_targets(now, &self.recovery) {
                if !self.scheduler.mark_dispatched(&key) {
                    continue; // Another worker grabbed it this tick.
                }

                let permit = match Arc::clone(&self.permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return, // Semaphore closed: shutting down.
                };

                let controller = Arc::clone(&self);
                tokio::spawn(async move {
                    controller.run_cycle(&key).await;
                    drop(permit);
                });
            }
        }

        // Drain: wait for in-flight cycles before the final persist.
        let _ = self.permits.acquire_many(self.worker_count).await;
        if let Err(e) = self.persist_all() {
            tracing::error!(error = %e, "Failed to persist controller state on shutdown");
        }
        tracing::info!(summary = %self.metrics.summary(), "Controller loop stopped");
    }

    /// One full fetch cycle for a target previously claimed through
    /// `scheduler().mark_dispatched`. `run` drives this automatically; it is
    /// public so embedders can step targets manually.
    pub async fn run_cycle(&self, key: &str) {
        let Some(target) = self.targets.get(key) else {
            self.scheduler.complete_cycle(key, now_epoch_secs());
            return;
        };

        self.metrics.cycles_total.inc();
        let now = now_epoch_secs();

        let (identity, mut session) = match self.checkout_session(key, now) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(target_key = %key, error = %e, "Session checkout failed");
                self.scheduler.complete_cycle(key, now);
                return;
            }
        };

        // Behavioral pacing gates every request; nothing is locked here.
        tokio::time::sleep(self.delays.next_delay()).await;

        let outcome = self
            .fetcher
            .fetch(&target.url, &identity, &mut session)
            .await;

        let now = now_epoch_secs();
        let (classification, evidence) = self.detector.classify(
            key,
            &outcome,
            session.had_success,
            target.expected_anchor.as_deref(),
        );

        match classification {
            Classification::Success => {
                // Classify only sees Ok results as Success.
                if let Ok(result) = &outcome {
                    self.handle_success(key, &mut session, result, now).await;
                }
            }
            Classification::Empty => {
                self.metrics.empty_results.inc();
                self.handle_failure(key, classification, evidence, now);
            }
            Classification::Blocked => {
                self.metrics.blocks_detected.inc();
                self.handle_failure(key, classification, evidence, now);
            }
        }

        self.pool
            .release(key, identity.id, classification == Classification::Blocked);
        if let Err(e) = self.persist_target(key) {
            tracing::error!(target_key = %key, error = %e, "Failed to persist cycle state");
        }
        self.scheduler.complete_cycle(key, now);
    }

    /// Supply the identity/context pair for a cycle. A fresh session is
    /// bound to a newly acquired identity; a restored session stays sticky
    /// to the identity it was built with so cookies and fingerprint keep
    /// matching. Escalation invalidates the session, which is what forces
    /// rotation on the next acquire.
    fn checkout_session(
        &self,
        key: &str,
        now: u64,
    ) -> Result<(Arc<Identity>, SessionRecord), crate::store::StoreError> {
        if let Some(session) = self.sessions.load(key, now)? {
            if let Some(identity) = self.pool.identity(session.identity_id as usize) {
                return Ok((identity, session));
            }
        }

        let identity = self.pool.acquire(key, now);
        self.metrics.identity_rotations.inc();
        let session = SessionStore::fresh(identity.id, now);
        Ok((identity, session))
    }

    async fn handle_success(
        &self,
        key: &str,
        session: &mut SessionRecord,
        result: &FetchResult,
        now: u64,
    ) {
        self.metrics.fetches_ok.inc();
        self.detector.observe_success(key, result.body.len());
        tracing::debug!(
            target_key = %key,
            status = result.status,
            latency_ms = result.latency_ms,
            body_len = result.body.len(),
            "Fetch succeeded"
        );

        // The known-good flag persists with the session, so a transport
        // failure on a restored session still reads as a block signal.
        session.had_success = true;
        session.last_used_at_secs = now;
        if let Err(e) = self.sessions.save(key, session) {
            tracing::error!(target_key = %key, error = %e, "Failed to persist session");
        }

        let had_new_content = self.sink.submit(key, result).await;
        if had_new_content {
            self.metrics.new_content_hits.inc();
            tracing::info!(target_key = %key, "New content observed");
        }
        self.scheduler.record_outcome(key, now, had_new_content);

        if self.recovery.record(key, Classification::Success, now) == Transition::Recovered {
            tracing::info!(target_key = %key, "Target recovered to healthy");
        }
    }

    fn handle_failure(&self, key: &str, classification: Classification, evidence: String, now: u64) {
        let label = match classification {
            Classification::Empty => "empty",
            _ => "blocked",
        };
        tracing::warn!(target_key = %key, classification = label, %evidence, "Fetch attempt flagged");

        if let Err(e) = self.store.append_block_event(
            key,
            BlockEventRecord {
                at_secs: now,
                classification: label.to_string(),
                evidence,
            },
            self.block_log_cap,
        ) {
            tracing::error!(target_key = %key, error = %e, "Failed to append block event");
        }

        match self.recovery.record(key, classification, now) {
            Transition::EnteredBackoff { attempt, until_secs } => {
                self.discard_session(key);
                tracing::warn!(
                    target_key = %key,
                    attempt,
                    until_secs,
                    "Target entered backoff"
                );
            }
            Transition::Suspended { reason } => {
                self.discard_session(key);
                self.metrics.suspensions.inc();
                tracing::warn!(target_key = %key, %reason, "Target suspended, operator reset required");
            }
            Transition::None | Transition::Recovered => {}
        }
    }

    /// Cookie-free restart: clear the persisted session so the next cycle
    /// acquires a rotated identity.
    fn discard_session(&self, key: &str) {
        self.metrics.sessions_invalidated.inc();
        if let Err(e) = self.sessions.invalidate(key) {
            tracing::error!(target_key = %key, error = %e, "Failed to invalidate session");
        }
    }

    fn persist_target(&self, key: &str) -> Result<(), crate::store::StoreError> {
        self.store.save_recovery(key, &self.recovery.snapshot(key))?;
        if let Some(schedule) = self.scheduler.export(key) {
            self.store.save_schedule(key, &schedule)?;
        }
        self.store.save_pool_stats(&PoolStatsRecord {
            counters: self.pool.export_stats(),
        })
    }

    /// Persist every target's state plus pool counters.
    pub fn persist_all(&self) -> Result<(), crate::store::StoreError> {
        for key in self.scheduler.target_keys() {
            self.persist_target(&key)?;
        }
        Ok(())
    }

    // ========================================================================
    // OPERATOR BOUNDARY
    // ========================================================================

    /// Clear a suspension; the target re-enters scheduling healthy with a
    /// zeroed failure counter.
    pub fn reset_suspended(&self, key: &str) -> Result<bool, crate::store::StoreError> {
        let reset = self.recovery.reset_suspended(key);
        if reset {
            self.store.save_recovery(key, &self.recovery.snapshot(key))?;
            tracing::info!(target_key = %key, "Suspension cleared by operator");
        }
        Ok(reset)
    }

    /// Make a target due on the next tick regardless of windows or interval.
    pub fn force_schedule(&self, key: &str) {
        self.scheduler.force_schedule(key);
        tracing::info!(target_key = %key, "Force-scheduled by operator");
    }

    /// Externally mark a target suspended. In-flight cycles finish; the
    /// scheduler will not re-admit the target afterward.
    pub fn suspend(&self, key: &str, reason: &str) -> Result<(), crate::store::StoreError> {
        self.recovery.suspend(key, reason);
        self.store.save_recovery(key, &self.recovery.snapshot(key))
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &ControllerStore {
        &self.store
    }

    /// Operator status dump: one line per target plus pool and counters.
    pub fn status_report(&self) -> Result<String, crate::store::StoreError> {
        let mut out = String::new();
        let mut keys: Vec<&String> = self.targets.keys().collect();
        keys.sort();

        for key in keys {
            let recovery = self.recovery.snapshot(key);
            let schedule = self.scheduler.export(key);
            let events = self.store.load_block_events(key)?;

            out.push_str(&format!(
                "{}: state={:?} failures={} hits={} block_events={}\n",
                key,
                recovery.state,
                recovery.consecutive_failures,
                schedule.as_ref().map(|s| s.hits.len()).unwrap_or(0),
                events.len(),
            ));
            if let Some(schedule) = schedule {
                for w in &schedule.windows {
                    out.push_str(&format!(
                        "  window +{:>5}s for {:>5}s weight {:.3}\n",
                        w.start_offset_secs, w.duration_secs, w.weight
                    ));
                }
            }
        }

        for (id, (uses, blocks)) in self.pool.export_stats().iter().enumerate() {
            out.push_str(&format!(
                "identity {}: uses={} blocks={}\n",
                id, uses, blocks
            ));
        }
        out.push_str(&self.metrics.summary());
        out.push('\n');
        Ok(out)
    }
}

/// First ctrl-c persists state and stops the loop; a second one force-quits.
pub fn setup_shutdown_handler() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received ctrl-c, finishing in-flight cycles...");
            let _ = shutdown_tx.send(true);

            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Force quit requested, exiting immediately");
                std::process::exit(1);
            }
        }
    });

    shutdown_rx
}
