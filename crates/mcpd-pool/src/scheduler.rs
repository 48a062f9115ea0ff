use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mcpd_core::{Catalog, BootstrapMode, HostError, LogLevel, SpecFingerprint, Strategy};
use mcpd_lifecycle::{Instance, InstanceState, start_instance, stop_instance, ping};
use mcpd_transport::TransportContext;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::lease::Lease;
use crate::pool::{Pool, StickyOutcome};
use crate::status::{InitStatus, PoolStatus};
use crate::SchedulerConfig;

const LOG_SOURCE: &str = "core/scheduler";

/// Owns every pool. Cheap to share; all request-path state lives behind
/// per-pool locks.
pub struct Scheduler {
    pools: RwLock<HashMap<SpecFingerprint, Arc<Pool>>>,
    config: RwLock<SchedulerConfig>,
    transport: TransportContext,
    shutting_down: AtomicBool,
}

enum AcquirePlan {
    Acquired(Arc<Instance>),
    /// A start task was launched; wait for capacity.
    Spawned,
    /// Someone else's start is in flight; wait for capacity.
    WaitStarting,
    /// Queued on a saturated singleton; wait for a release.
    WaitQueued,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, transport: TransportContext) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            transport,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.read().expect("scheduler config poisoned").clone()
    }

    fn pools_snapshot(&self) -> Vec<Arc<Pool>> {
        let mut pools: Vec<Arc<Pool>> = self
            .pools
            .read()
            .expect("scheduler pools poisoned")
            .values()
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        pools
    }

    pub fn pool(&self, fingerprint: &SpecFingerprint) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .expect("scheduler pools poisoned")
            .get(fingerprint)
            .cloned()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().expect("scheduler pools poisoned").len()
    }

    // ---- planning -------------------------------------------------------

    /// Applies a catalog: create pools new to the plan, drain pools that
    /// left it, leave fingerprint-identical pools untouched. Reloading an
    /// unchanged catalog is therefore a no-op.
    pub async fn reconcile(self: &Arc<Self>, catalog: &Catalog) {
        {
            let mut config = self.config.write().expect("scheduler config poisoned");
            *config = SchedulerConfig::from_runtime(&catalog.runtime);
        }

        let eager = catalog.runtime.bootstrap == BootstrapMode::Eager;
        let mut planned: HashMap<SpecFingerprint, &mcpd_core::ServerSpec> = HashMap::new();
        for (spec, fingerprint) in catalog.fingerprinted() {
            // Identically-behaving specs share one pool; first name wins
            // for the pool's spec snapshot.
            planned.entry(fingerprint).or_insert(spec);
        }

        let (created, dropped) = {
            let mut pools = self.pools.write().expect("scheduler pools poisoned");
            let mut dropped = Vec::new();
            pools.retain(|fingerprint, pool| {
                if planned.contains_key(fingerprint) {
                    true
                } else {
                    dropped.push(Arc::clone(pool));
                    false
                }
            });

            let mut created = Vec::new();
            for (fingerprint, spec) in planned {
                if !pools.contains_key(&fingerprint) {
                    let pool = Arc::new(Pool::new(fingerprint.clone(), spec.clone(), eager));
                    pools.insert(fingerprint, Arc::clone(&pool));
                    created.push(pool);
                }
            }
            (created, dropped)
        };

        for pool in &dropped {
            tracing::info!(fingerprint = %pool.fingerprint, server = %pool.spec.name, "draining pool removed from plan");
            self.transport.logs.publish(
                LOG_SOURCE,
                LogLevel::Info,
                format!("draining pool {} ({})", pool.fingerprint.short(), pool.spec.name),
            );
            let scheduler = Arc::clone(self);
            let pool = Arc::clone(pool);
            tokio::spawn(async move {
                scheduler.drain_pool(&pool).await;
            });
        }

        for pool in &created {
            tracing::info!(
                fingerprint = %pool.fingerprint,
                server = %pool.spec.name,
                strategy = %pool.spec.strategy,
                "pool created"
            );
            self.ensure_min_ready(pool).await;
        }
    }

    // ---- acquire / release ---------------------------------------------

    /// Hands out an instance for the fingerprint, honoring the pool's
    /// strategy, bounded by `deadline`.
    pub async fn acquire(
        self: &Arc<Self>,
        fingerprint: &SpecFingerprint,
        routing_key: Option<&str>,
        deadline: Instant,
    ) -> Result<Lease, HostError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(HostError::RouteFailed("host is shutting down".to_string()));
        }
        let pool = self.pool(fingerprint).ok_or_else(|| {
            HostError::RouteFailed(format!("no pool for fingerprint {}", fingerprint.short()))
        })?;

        loop {
            let plan = self.plan_acquire(&pool, routing_key).await?;
            match plan {
                AcquirePlan::Acquired(instance) => {
                    return Ok(Lease::new(Arc::clone(self), pool, instance));
                }
                AcquirePlan::Spawned | AcquirePlan::WaitStarting => {
                    if wait_for_capacity(&pool, deadline).await.is_err() {
                        return Err(HostError::Starting(format!(
                            "pool {} ({}) is still starting an instance",
                            pool.fingerprint.short(),
                            pool.spec.name
                        )));
                    }
                }
                AcquirePlan::WaitQueued => {
                    let waited = wait_for_capacity(&pool, deadline).await;
                    {
                        let mut state = pool.state.lock().await;
                        state.waiters = state.waiters.saturating_sub(1);
                    }
                    if waited.is_err() {
                        return Err(HostError::Busy(format!(
                            "singleton '{}' stayed saturated for the whole deadline",
                            pool.spec.name
                        )));
                    }
                }
            }
        }
    }

    /// One locked pass over the pool deciding what to do. Never awaits
    /// anything slow while holding the lock.
    async fn plan_acquire(
        self: &Arc<Self>,
        pool: &Arc<Pool>,
        routing_key: Option<&str>,
    ) -> Result<AcquirePlan, HostError> {
        let mut state = pool.state.lock().await;
        let now = Instant::now();

        if state.draining {
            return Err(HostError::RouteFailed(format!(
                "pool {} ({}) is draining",
                pool.fingerprint.short(),
                pool.spec.name
            )));
        }
        if state.retry.suspended {
            return Err(HostError::Suspended {
                attempts: state.retry.attempts,
                reason: state
                    .retry
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "init kept failing".to_string()),
            });
        }
        state.activated = true;
        state.expire_sticky(now);

        let ttl = Duration::from_secs(pool.spec.session_ttl_seconds);
        match (pool.spec.strategy, routing_key) {
            (Strategy::Stateful, Some(key)) => match state.select_sticky(key, ttl, now) {
                StickyOutcome::Bound(instance) => {
                    instance.acquire_slot();
                    Ok(AcquirePlan::Acquired(instance))
                }
                StickyOutcome::Saturated(instance) => Err(HostError::Busy(format!(
                    "sticky instance {} for key '{key}' is saturated",
                    instance.id
                ))),
                StickyOutcome::Miss => {
                    if let Some(instance) = state.select_for_new_binding(now) {
                        state.install_binding(key, &instance.id, ttl, now);
                        instance.acquire_slot();
                        Ok(AcquirePlan::Acquired(instance))
                    } else if let Some(remaining) = state.retry.backoff_remaining(now) {
                        Err(HostError::Starting(format!(
                            "pool {} retries init in {}s",
                            pool.fingerprint.short(),
                            remaining.as_secs().max(1)
                        )))
                    } else if state.starting > 0 {
                        Ok(AcquirePlan::WaitStarting)
                    } else {
                        state.starting += 1;
                        drop(state);
                        self.spawn_instance_task(pool);
                        Ok(AcquirePlan::Spawned)
                    }
                }
            },
            (Strategy::Singleton, _) => {
                if let Some(instance) = state.instances.first().cloned() {
                    if instance.acquire_slot() {
                        Ok(AcquirePlan::Acquired(instance))
                    } else if state.waiters < pool.spec.max_concurrent {
                        state.waiters += 1;
                        Ok(AcquirePlan::WaitQueued)
                    } else {
                        Err(HostError::Busy(format!(
                            "singleton '{}' is saturated and its queue is full",
                            pool.spec.name
                        )))
                    }
                } else if state.starting > 0 {
                    Ok(AcquirePlan::WaitStarting)
                } else if let Some(remaining) = state.retry.backoff_remaining(now) {
                    Err(HostError::Starting(format!(
                        "pool {} retries init in {}s",
                        pool.fingerprint.short(),
                        remaining.as_secs().max(1)
                    )))
                } else {
                    state.starting += 1;
                    drop(state);
                    self.spawn_instance_task(pool);
                    Ok(AcquirePlan::Spawned)
                }
            }
            // Stateless, persistent, and sticky calls without a routing key
            // all take the deterministic least-loaded pick.
            _ => {
                if let Some(instance) = state.select_available() {
                    instance.acquire_slot();
                    Ok(AcquirePlan::Acquired(instance))
                } else if (state.instances.len() + state.starting as usize)
                    < pool.spawn_ceiling()
                {
                    if let Some(remaining) = state.retry.backoff_remaining(now) {
                        return Err(HostError::Starting(format!(
                            "pool {} retries init in {}s",
                            pool.fingerprint.short(),
                            remaining.as_secs().max(1)
                        )));
                    }
                    state.starting += 1;
                    drop(state);
                    self.spawn_instance_task(pool);
                    Ok(AcquirePlan::Spawned)
                } else if state.starting > 0 {
                    Ok(AcquirePlan::WaitStarting)
                } else {
                    Err(HostError::Busy(format!(
                        "pool {} ({}) is at capacity",
                        pool.fingerprint.short(),
                        pool.spec.name
                    )))
                }
            }
        }
    }

    pub(crate) async fn release_instance(
        self: &Arc<Self>,
        pool: &Arc<Pool>,
        instance: &Arc<Instance>,
        failed_during_call: bool,
    ) {
        let to_stop = {
            let mut state = pool.state.lock().await;
            if failed_during_call {
                instance.mark_failed();
            }
            instance.release_slot();
            if instance.state() == InstanceState::Failed {
                state.remove_instance(&instance.id);
                Some(Arc::clone(instance))
            } else {
                None
            }
        };
        pool.capacity_freed.notify_waiters();

        if let Some(broken) = to_stop {
            let lifecycle = self.config().lifecycle;
            stop_instance(&broken, "failed during call", &lifecycle).await;
            self.ensure_min_ready(pool).await;
        }
    }

    // ---- instance startup ----------------------------------------------

    /// Launches one start task for the pool. The caller already bumped
    /// `starting` under the lock.
    fn spawn_instance_task(self: &Arc<Self>, pool: &Arc<Pool>) {
        let scheduler = Arc::clone(self);
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            let config = scheduler.config();
            let result = start_instance(
                &pool.spec,
                &pool.fingerprint,
                &scheduler.transport,
                &config.lifecycle,
            )
            .await;

            let started = {
                let mut state = pool.state.lock().await;
                state.starting = state.starting.saturating_sub(1);
                match result {
                    Ok(instance) => {
                        if state.draining
                            || scheduler.shutting_down.load(Ordering::Acquire)
                        {
                            Some(instance)
                        } else {
                            state.retry.reset();
                            state.instances.push(instance);
                            None
                        }
                    }
                    Err(error) => {
                        let delay = config.retry_delay(state.retry.attempts);
                        state.retry.record_failure(&error, delay, config.max_retries);
                        let suspended = state.retry.suspended;
                        tracing::warn!(
                            server = %pool.spec.name,
                            fingerprint = %pool.fingerprint,
                            attempts = state.retry.attempts,
                            suspended,
                            error = %error,
                            "instance start failed"
                        );
                        scheduler.transport.logs.publish(
                            LOG_SOURCE,
                            LogLevel::Warn,
                            format!(
                                "start of '{}' failed (attempt {}): {error}",
                                pool.spec.name, state.retry.attempts
                            ),
                        );
                        None
                    }
                }
            };

            // An instance that finished starting after its pool began
            // draining is stopped without ever serving.
            if let Some(orphan) = started {
                stop_instance(&orphan, "pool drained during start", &scheduler.config().lifecycle)
                    .await;
            }
            pool.capacity_freed.notify_waiters();
        });
    }

    /// Tops a pool up to its warm minimum, respecting retry backoff and
    /// lazy bootstrap.
    pub(crate) async fn ensure_min_ready(self: &Arc<Self>, pool: &Arc<Pool>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let target = match pool.spec.strategy {
            Strategy::Singleton => pool.spec.min_ready.min(1),
            _ => pool.spec.min_ready,
        } as usize;
        if target == 0 {
            return;
        }

        let to_spawn = {
            let mut state = pool.state.lock().await;
            if state.draining || state.retry.suspended || !state.activated {
                0
            } else if state.retry.backoff_remaining(Instant::now()).is_some() {
                0
            } else {
                let have = state.healthy_count() + state.starting as usize;
                let missing = target.saturating_sub(have);
                state.starting += missing as u32;
                missing
            }
        };
        for _ in 0..to_spawn {
            self.spawn_instance_task(pool);
        }
    }

    // ---- sweeps ---------------------------------------------------------

    /// Runs the periodic maintenance loop: sticky TTL expiry, idle reaping,
    /// warm-pool top-up (including post-backoff init retries), and the
    /// health ping sweep.
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_ping = Instant::now();
            loop {
                let tick = scheduler.config().idle_sweep_interval;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
                scheduler.idle_sweep().await;
                for pool in scheduler.pools_snapshot() {
                    scheduler.ensure_min_ready(&pool).await;
                }
                if let Some(interval) = scheduler.config().ping_interval {
                    if last_ping.elapsed() >= interval {
                        last_ping = Instant::now();
                        scheduler.health_sweep().await;
                    }
                }
            }
        })
    }

    /// Stops Ready instances idle past their spec's `idle_seconds`,
    /// keeping at least `min_ready` Ready instances. Persistent and
    /// singleton pools are exempt.
    pub async fn idle_sweep(&self) {
        let lifecycle = self.config().lifecycle;
        for pool in self.pools_snapshot() {
            if pool.spec.strategy.idle_exempt() {
                continue;
            }
            let idle_limit = Duration::from_secs(pool.spec.idle_seconds);
            let min_ready = pool.spec.min_ready as usize;

            let reaped = {
                let mut state = pool.state.lock().await;
                let now = Instant::now();
                state.expire_sticky(now);

                let mut ready = state.ready_instances();
                // Oldest-idle first, id as the deterministic tie-break.
                ready.sort_by(|a, b| {
                    b.idle_for()
                        .cmp(&a.idle_for())
                        .then_with(|| a.id.cmp(&b.id))
                });
                let ready_total = ready.len();
                let mut reaped = Vec::new();
                for instance in ready {
                    if ready_total - reaped.len() <= min_ready {
                        break;
                    }
                    if instance.idle_for() <= idle_limit {
                        break;
                    }
                    if state.has_live_binding(&instance.id, now) {
                        continue;
                    }
                    state.remove_instance(&instance.id);
                    reaped.push(instance);
                }
                reaped
            };

            for instance in reaped {
                tracing::debug!(
                    instance = %instance.id,
                    server = %pool.spec.name,
                    "reaping idle instance"
                );
                stop_instance(&instance, "idle", &lifecycle).await;
            }
        }
    }

    /// Pings every Ready instance; failures become Failed, are stopped,
    /// and replaced where a warm minimum demands it.
    pub async fn health_sweep(self: &Arc<Self>) {
        let config = self.config();
        for pool in self.pools_snapshot() {
            let targets = {
                let state = pool.state.lock().await;
                state.ready_instances()
            };
            for instance in targets {
                if ping(&instance, config.lifecycle.ping_timeout).await.is_ok() {
                    continue;
                }
                tracing::warn!(
                    instance = %instance.id,
                    server = %pool.spec.name,
                    "health ping failed"
                );
                self.transport.logs.publish(
                    LOG_SOURCE,
                    LogLevel::Warn,
                    format!("instance {} of '{}' failed health ping", instance.id, pool.spec.name),
                );
                {
                    let mut state = pool.state.lock().await;
                    instance.mark_failed();
                    state.remove_instance(&instance.id);
                }
                stop_instance(&instance, "health ping failed", &config.lifecycle).await;
                self.ensure_min_ready(&pool).await;
            }
        }
    }

    // ---- drain / shutdown ----------------------------------------------

    async fn drain_pool(&self, pool: &Arc<Pool>) {
        let instances = {
            let mut state = pool.state.lock().await;
            state.draining = true;
            state.sticky.clear();
            std::mem::take(&mut state.instances)
        };
        pool.capacity_freed.notify_waiters();

        let lifecycle = self.config().lifecycle;
        let mut handles = Vec::with_capacity(instances.len());
        for instance in instances {
            let lifecycle = lifecycle.clone();
            handles.push(tokio::spawn(async move {
                stop_instance(&instance, "pool drained", &lifecycle).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Refuses new acquires, drains every pool in parallel, and hard-kills
    /// whatever is left when the global deadline elapses.
    pub async fn stop_all(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Release);
        let deadline = self.config().stop_all_deadline;
        let pools = self.pools_snapshot();

        let mut handles = Vec::with_capacity(pools.len());
        for pool in &pools {
            let scheduler = Arc::clone(self);
            let pool = Arc::clone(pool);
            handles.push(tokio::spawn(async move {
                scheduler.drain_pool(&pool).await;
            }));
        }

        let all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, all).await.is_err() {
            tracing::warn!("drain deadline elapsed, force-closing remaining instances");
            for pool in &pools {
                let leftovers = {
                    let mut state = pool.state.lock().await;
                    std::mem::take(&mut state.instances)
                };
                for instance in leftovers {
                    instance.force_close().await;
                }
            }
        }

        self.transport
            .logs
            .publish(LOG_SOURCE, LogLevel::Info, "all pools stopped");
    }

    // ---- status ---------------------------------------------------------

    pub async fn pool_statuses(&self) -> Vec<PoolStatus> {
        let mut out = Vec::new();
        for pool in self.pools_snapshot() {
            let state = pool.state.lock().await;
            out.push(PoolStatus {
                fingerprint: pool.fingerprint.as_str().to_string(),
                server: pool.spec.name.clone(),
                strategy: pool.spec.strategy,
                min_ready: pool.spec.min_ready,
                max_concurrent: pool.spec.max_concurrent,
                draining: state.draining,
                suspended: state.retry.suspended,
                starting: state.starting,
                sticky_keys: state.sticky.len(),
                instances: state.instances.iter().map(|i| i.status()).collect(),
            });
        }
        out
    }

    pub async fn init_statuses(&self) -> Vec<InitStatus> {
        let now = Instant::now();
        let mut out = Vec::new();
        for pool in self.pools_snapshot() {
            let state = pool.state.lock().await;
            out.push(InitStatus {
                fingerprint: pool.fingerprint.as_str().to_string(),
                server: pool.spec.name.clone(),
                attempts: state.retry.attempts,
                suspended: state.retry.suspended,
                last_error_kind: state.retry.last_error_kind,
                last_error: state.retry.last_error.clone(),
                next_retry_in_seconds: state
                    .retry
                    .backoff_remaining(now)
                    .map(|d| d.as_secs()),
            });
        }
        out
    }

    /// Clears a fingerprint's retry record (full or abbreviated form
    /// accepted) and immediately tops its pool back up.
    pub async fn retry_server_init(
        self: &Arc<Self>,
        needle: &str,
    ) -> Result<SpecFingerprint, HostError> {
        let pool = self
            .pools_snapshot()
            .into_iter()
            .find(|pool| pool.fingerprint.matches(needle))
            .ok_or_else(|| {
                HostError::InvalidParams(format!("no pool matches fingerprint '{needle}'"))
            })?;

        {
            let mut state = pool.state.lock().await;
            state.retry.reset();
            state.activated = true;
        }
        tracing::info!(fingerprint = %pool.fingerprint, server = %pool.spec.name, "init retry requested");
        self.ensure_min_ready(&pool).await;
        Ok(pool.fingerprint.clone())
    }

    /// Instance totals by state, for metrics.
    pub async fn instance_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for pool in self.pools_snapshot() {
            let state = pool.state.lock().await;
            for instance in &state.instances {
                *counts.entry(instance.state().label()).or_default() += 1;
            }
        }
        counts
    }
}

/// Blocks until capacity may have appeared or the deadline passes. The
/// notify is an accelerator, not the correctness mechanism: a short
/// re-check interval closes the window where a release fires between the
/// caller's locked pass and its wait registration.
async fn wait_for_capacity(pool: &Arc<Pool>, deadline: Instant) -> Result<(), ()> {
    const RECHECK: Duration = Duration::from_millis(25);
    if Instant::now() >= deadline {
        return Err(());
    }
    let wake = async {
        tokio::select! {
            _ = pool.capacity_freed.notified() => {}
            _ = tokio::time::sleep(RECHECK) => {}
        }
    };
    tokio::time::timeout_at(deadline, wake).await.map_err(|_| ())
}
