//! Scheduler and pools: turns a catalog into live instances, keyed by spec
//! fingerprint, and hands them out under per-spec concurrency limits.
//!
//! Locking discipline, which the whole design hangs on: one async mutex per
//! pool guards that pool's mutable state; no global lock is taken on the
//! request path, and slow operations (start, stop, ping) always run outside
//! the pool lock, which is re-entered only to publish state transitions.

mod lease;
mod pool;
mod scheduler;
mod status;

use std::time::Duration;

use mcpd_core::RuntimeConfig;
use mcpd_lifecycle::LifecycleConfig;

pub use lease::Lease;
pub use pool::Pool;
pub use scheduler::Scheduler;
pub use status::{InitStatus, PoolStatus};

/// Interval at which the maintenance loop runs idle reaping, sticky TTL
/// expiry, and warm-pool top-up. Not a catalog knob.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub lifecycle: LifecycleConfig,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub max_retries: u32,
    pub idle_sweep_interval: Duration,
    pub ping_interval: Option<Duration>,
    pub stop_all_deadline: Duration,
}

impl SchedulerConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            lifecycle: LifecycleConfig::default(),
            retry_base: runtime.retry_base(),
            retry_max: runtime.retry_max(),
            max_retries: runtime.server_init_max_retries,
            idle_sweep_interval: IDLE_SWEEP_INTERVAL,
            ping_interval: runtime.ping_interval(),
            stop_all_deadline: Duration::from_secs(20),
        }
    }

    pub(crate) fn retry_delay(&self, attempts: u32) -> Duration {
        let doubled = self
            .retry_base
            .saturating_mul(2u32.saturating_pow(attempts.min(16)));
        doubled.min(self.retry_max)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}
