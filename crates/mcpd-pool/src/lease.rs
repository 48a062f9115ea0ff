use std::sync::Arc;

use mcpd_lifecycle::Instance;
use rmcp::{Peer, RoleClient};

use crate::pool::Pool;
use crate::scheduler::Scheduler;

/// An acquired instance slot.
///
/// Release pairs with acquire on every exit path: the happy path calls
/// [`Lease::release`], and `Drop` spawns the release if the holder unwound
/// without it, so a panicking caller can never leak busy-count.
pub struct Lease {
    scheduler: Arc<Scheduler>,
    pool: Arc<Pool>,
    instance: Arc<Instance>,
    failed: bool,
    released: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("instance_id", &self.instance.id)
            .field("failed", &self.failed)
            .field("released", &self.released)
            .finish()
    }
}

impl Lease {
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        pool: Arc<Pool>,
        instance: Arc<Instance>,
    ) -> Self {
        Self {
            scheduler,
            pool,
            instance,
            failed: false,
            released: false,
        }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn peer(&self) -> &Peer<RoleClient> {
        self.instance.peer()
    }

    /// Flags the instance as broken by the call in flight; release will
    /// remove and stop it instead of returning it to the pool.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub async fn release(mut self) {
        self.released = true;
        let scheduler = Arc::clone(&self.scheduler);
        let pool = Arc::clone(&self.pool);
        let instance = Arc::clone(&self.instance);
        let failed = self.failed;
        scheduler.release_instance(&pool, &instance, failed).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let scheduler = Arc::clone(&self.scheduler);
        let pool = Arc::clone(&self.pool);
        let instance = Arc::clone(&self.instance);
        let failed = self.failed;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                scheduler.release_instance(&pool, &instance, failed).await;
            });
        }
    }
}
