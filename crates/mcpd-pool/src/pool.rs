use std::collections::HashMap;
use std::sync::Arc;

use mcpd_core::{HostError, ServerSpec, SpecFingerprint, Strategy};
use mcpd_lifecycle::{Instance, InstanceState};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// All live state for one spec fingerprint.
pub struct Pool {
    pub fingerprint: SpecFingerprint,
    pub spec: ServerSpec,
    pub(crate) state: Mutex<PoolState>,
    /// Signalled whenever capacity may have appeared: a release, a finished
    /// start (success or failure), or a drain.
    pub(crate) capacity_freed: Notify,
}

impl Pool {
    pub(crate) fn new(fingerprint: SpecFingerprint, spec: ServerSpec, activated: bool) -> Self {
        Self {
            fingerprint,
            spec,
            state: Mutex::new(PoolState {
                instances: Vec::new(),
                sticky: HashMap::new(),
                retry: RetryState::default(),
                draining: false,
                starting: 0,
                waiters: 0,
                activated,
            }),
            capacity_freed: Notify::new(),
        }
    }

    /// Instances a stateless pool may grow to. Also the spawn ceiling for
    /// persistent pools, which must accommodate their warm minimum.
    pub(crate) fn spawn_ceiling(&self) -> usize {
        match self.spec.strategy {
            Strategy::Singleton => 1,
            Strategy::Persistent => self.spec.max_concurrent.max(self.spec.min_ready) as usize,
            Strategy::Stateless | Strategy::Stateful => self.spec.max_concurrent as usize,
        }
    }
}

pub(crate) struct PoolState {
    pub instances: Vec<Arc<Instance>>,
    pub sticky: HashMap<String, StickyBinding>,
    pub retry: RetryState,
    pub draining: bool,
    /// In-flight `start_instance` tasks.
    pub starting: u32,
    /// Callers queued on a saturated singleton.
    pub waiters: u32,
    /// Lazily bootstrapped pools only warm up after first use.
    pub activated: bool,
}

pub(crate) struct StickyBinding {
    pub instance_id: String,
    pub expires_at: Instant,
}

pub(crate) enum StickyOutcome {
    Bound(Arc<Instance>),
    Saturated(Arc<Instance>),
    Miss,
}

impl PoolState {
    pub fn instance_by_id(&self, id: &str) -> Option<Arc<Instance>> {
        self.instances
            .iter()
            .find(|inst| inst.id == id)
            .cloned()
    }

    /// Removes an instance and sweeps sticky bindings that pointed at it.
    pub fn remove_instance(&mut self, id: &str) {
        self.instances.retain(|inst| inst.id != id);
        self.sticky.retain(|_, binding| binding.instance_id != id);
    }

    /// Drops expired bindings and bindings to instances no longer pooled.
    pub fn expire_sticky(&mut self, now: Instant) {
        let live: Vec<&str> = self.instances.iter().map(|i| i.id.as_str()).collect();
        self.sticky.retain(|_, binding| {
            binding.expires_at > now && live.contains(&binding.instance_id.as_str())
        });
    }

    pub fn has_live_binding(&self, instance_id: &str, now: Instant) -> bool {
        self.sticky
            .values()
            .any(|b| b.instance_id == instance_id && b.expires_at > now)
    }

    /// Deterministic stateless pick: lowest busy-count first, then oldest
    /// last-active (largest idle time), then instance id.
    pub fn select_available(&self) -> Option<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|inst| inst.has_capacity())
            .min_by(|a, b| {
                a.busy_count()
                    .cmp(&b.busy_count())
                    .then_with(|| b.idle_for().cmp(&a.idle_for()))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Sticky lookup. A hit with capacity binds (sliding TTL refresh); a
    /// saturated hit is a hard `Busy`, never a fallback to another
    /// instance.
    pub fn select_sticky(&mut self, key: &str, ttl: std::time::Duration, now: Instant) -> StickyOutcome {
        if let Some(binding) = self.sticky.get(key) {
            if let Some(instance) = self.instance_by_id(&binding.instance_id) {
                if instance.has_capacity() {
                    self.sticky.insert(
                        key.to_string(),
                        StickyBinding {
                            instance_id: instance.id.clone(),
                            expires_at: now + ttl,
                        },
                    );
                    return StickyOutcome::Bound(instance);
                }
                return StickyOutcome::Saturated(instance);
            }
        }
        StickyOutcome::Miss
    }

    /// Pick for a sticky miss: unbound instances first so keys spread over
    /// the pool, then the stateless ordering.
    pub fn select_for_new_binding(&self, now: Instant) -> Option<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|inst| inst.has_capacity())
            .min_by(|a, b| {
                self.has_live_binding(&a.id, now)
                    .cmp(&self.has_live_binding(&b.id, now))
                    .then_with(|| a.busy_count().cmp(&b.busy_count()))
                    .then_with(|| b.idle_for().cmp(&a.idle_for()))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    pub fn install_binding(&mut self, key: &str, instance_id: &str, ttl: std::time::Duration, now: Instant) {
        self.sticky.insert(
            key.to_string(),
            StickyBinding {
                instance_id: instance_id.to_string(),
                expires_at: now + ttl,
            },
        );
    }

    /// Instances that count against `min_ready` maintenance.
    pub fn healthy_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|inst| {
                matches!(
                    inst.state(),
                    InstanceState::Ready | InstanceState::Busy | InstanceState::Starting
                )
            })
            .count()
    }

    pub fn ready_instances(&self) -> Vec<Arc<Instance>> {
        self.instances
            .iter()
            .filter(|inst| inst.state() == InstanceState::Ready)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct RetryState {
    pub attempts: u32,
    pub next_retry_at: Option<Instant>,
    pub suspended: bool,
    pub last_error_kind: Option<&'static str>,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn record_failure(&mut self, error: &HostError, delay: std::time::Duration, max_retries: u32) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error_kind = Some(error.kind());
        self.last_error = Some(error.to_string());
        self.next_retry_at = Some(Instant::now() + delay);
        if self.attempts >= max_retries {
            self.suspended = true;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Remaining backoff window, if any.
    pub fn backoff_remaining(&self, now: Instant) -> Option<std::time::Duration> {
        self.next_retry_at.and_then(|at| {
            (at > now).then(|| at.duration_since(now))
        })
    }
}
