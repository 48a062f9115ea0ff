use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rmcp::{Peer, RoleClient};
use serde::Serialize;

use mcpd_core::{CapabilityFlags, ServerSpec, SpecFingerprint};
use mcpd_transport::{HandshakeInfo, SessionHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Ready,
    Busy,
    Draining,
    Failed,
    Stopped,
}

impl InstanceState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// One live MCP session realized from a server spec.
///
/// State transitions are published while the owning pool's lock is held;
/// reads (status payloads, sweeps) are lock-free on the instance itself.
pub struct Instance {
    pub id: String,
    pub fingerprint: SpecFingerprint,
    pub server_name: String,
    pub protocol_version: String,
    pub capabilities: CapabilityFlags,
    pub transport_label: &'static str,
    pub max_concurrent: u32,
    peer: Peer<RoleClient>,
    session: Mutex<Option<SessionHandle>>,
    state: Mutex<InstanceState>,
    busy: AtomicU32,
    last_active: Mutex<Instant>,
    started_at: Instant,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("server_name", &self.server_name)
            .field("state", &self.state.lock().map(|s| *s).ok())
            .finish()
    }
}

impl Instance {
    pub(crate) fn from_session(
        spec: &ServerSpec,
        fingerprint: SpecFingerprint,
        session: SessionHandle,
        handshake: &HandshakeInfo,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            fingerprint,
            server_name: spec.name.clone(),
            protocol_version: handshake.protocol_version.clone(),
            capabilities: handshake.capabilities,
            transport_label: session.transport_label(),
            max_concurrent: spec.max_concurrent,
            peer: session.peer(),
            session: Mutex::new(Some(session)),
            state: Mutex::new(InstanceState::Ready),
            busy: AtomicU32::new(0),
            last_active: Mutex::new(now),
            started_at: now,
        }
    }

    pub fn peer(&self) -> &Peer<RoleClient> {
        &self.peer
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock().expect("instance state poisoned")
    }

    pub fn set_state(&self, next: InstanceState) {
        *self.state.lock().expect("instance state poisoned") = next;
    }

    /// Marks the instance Failed unless it already reached Stopped.
    pub fn mark_failed(&self) {
        let mut state = self.state.lock().expect("instance state poisoned");
        if *state != InstanceState::Stopped {
            *state = InstanceState::Failed;
        }
    }

    pub fn busy_count(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    /// True when an acquire may hand this instance out.
    pub fn has_capacity(&self) -> bool {
        matches!(self.state(), InstanceState::Ready | InstanceState::Busy)
            && self.busy_count() < self.max_concurrent
    }

    /// Bumps the busy count; the caller holds the pool lock.
    pub fn acquire_slot(&self) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.busy.fetch_add(1, Ordering::AcqRel);
        self.set_state(InstanceState::Busy);
        true
    }

    /// Drops one busy slot and refreshes last-active. Returns the number of
    /// calls still in flight.
    pub fn release_slot(&self) -> u32 {
        let before = self.busy.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "release without acquire");
        let remaining = before.saturating_sub(1);
        self.touch();
        if remaining == 0 {
            let mut state = self.state.lock().expect("instance state poisoned");
            if *state == InstanceState::Busy {
                *state = InstanceState::Ready;
            }
        }
        remaining
    }

    pub fn touch(&self) {
        *self.last_active.lock().expect("instance clock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .expect("instance clock poisoned")
            .elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn take_session(&self) -> Option<SessionHandle> {
        self.session.lock().expect("instance session poisoned").take()
    }

    /// Immediate teardown with no drain and no termination grace. Only the
    /// global shutdown deadline path uses this.
    pub async fn force_close(&self) {
        if let Some(session) = self.take_session() {
            session.close(std::time::Duration::ZERO).await;
        }
        self.set_state(InstanceState::Stopped);
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id.clone(),
            server: self.server_name.clone(),
            state: self.state(),
            busy: self.busy_count(),
            max_concurrent: self.max_concurrent,
            transport: self.transport_label,
            protocol_version: self.protocol_version.clone(),
            idle_seconds: self.idle_for().as_secs(),
            uptime_seconds: self.uptime().as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub server: String,
    pub state: InstanceState,
    pub busy: u32,
    pub max_concurrent: u32,
    pub transport: &'static str,
    pub protocol_version: String,
    pub idle_seconds: u64,
    pub uptime_seconds: u64,
}
