use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One external caller of the control plane, keyed by caller id. Created
/// on first call, refreshed on every call, pruned after inactivity.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCaller {
    pub id: String,
    pub pid: u32,
    pub tags: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

/// Single-mutex table, touched only at call boundaries.
#[derive(Default)]
pub struct CallerTable {
    inner: Mutex<HashMap<String, ActiveCaller>>,
}

impl CallerTable {
    pub fn touch(&self, id: &str, pid: u32, tags: &[String]) {
        let mut table = self.inner.lock().expect("caller table poisoned");
        table.insert(
            id.to_string(),
            ActiveCaller {
                id: id.to_string(),
                pid,
                tags: tags.to_vec(),
                last_seen: Utc::now(),
            },
        );
    }

    pub fn list(&self) -> Vec<ActiveCaller> {
        let table = self.inner.lock().expect("caller table poisoned");
        let mut callers: Vec<ActiveCaller> = table.values().cloned().collect();
        callers.sort_by(|a, b| a.id.cmp(&b.id));
        callers
    }

    /// Removes callers whose last heartbeat is older than the window.
    pub fn prune(&self, inactive_after: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(inactive_after).unwrap_or(chrono::Duration::zero());
        let mut table = self.inner.lock().expect("caller table poisoned");
        let before = table.len();
        table.retain(|_, caller| caller.last_seen >= cutoff);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("caller table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
