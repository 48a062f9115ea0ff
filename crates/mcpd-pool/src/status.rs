use mcpd_core::Strategy;
use mcpd_lifecycle::InstanceStatus;
use serde::Serialize;

/// Control-plane view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub fingerprint: String,
    pub server: String,
    pub strategy: Strategy,
    pub min_ready: u32,
    pub max_concurrent: u32,
    pub draining: bool,
    pub suspended: bool,
    pub starting: u32,
    pub sticky_keys: usize,
    pub instances: Vec<InstanceStatus>,
}

/// Control-plane view of one fingerprint's init-retry record.
#[derive(Debug, Clone, Serialize)]
pub struct InitStatus {
    pub fingerprint: String,
    pub server: String,
    pub attempts: u32,
    pub suspended: bool,
    pub last_error_kind: Option<&'static str>,
    pub last_error: Option<String>,
    pub next_retry_in_seconds: Option<u64>,
}
