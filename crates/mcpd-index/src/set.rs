use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mcpd_core::{Catalog, HostError, NamespaceStrategy, ServerSpec, SpecFingerprint};
use mcpd_pool::Scheduler;
use mcpd_transport::{ListChangedEvent, ListChangedKind};

use crate::index::AggregateIndex;
use crate::kind::{IndexKind, PromptsKind, ResourcesKind, ToolsKind};

const REFRESH_QUEUE_CAPACITY: usize = 256;
/// Poll cadence while the refresh timer is configured off.
const TIMER_OFF_RECHECK: Duration = Duration::from_secs(60);

/// A unit of refresh work: one server, one list kind (or all three).
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub fingerprint: SpecFingerprint,
    pub kind: Option<ListChangedKind>,
}

struct SetState {
    order: Vec<(String, SpecFingerprint)>,
    specs: HashMap<SpecFingerprint, ServerSpec>,
    strategy: NamespaceStrategy,
    expose_tools: bool,
    route_timeout: Duration,
    refresh_interval: Option<Duration>,
}

/// The three aggregation indices plus the refresh machinery driving them.
pub struct IndexSet {
    pub tools: AggregateIndex<ToolsKind>,
    pub resources: AggregateIndex<ResourcesKind>,
    pub prompts: AggregateIndex<PromptsKind>,
    scheduler: Arc<Scheduler>,
    state: RwLock<SetState>,
    jobs_tx: mpsc::Sender<RefreshJob>,
    jobs_rx: Mutex<mpsc::Receiver<RefreshJob>>,
}

impl IndexSet {
    pub fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel(REFRESH_QUEUE_CAPACITY);
        Arc::new(Self {
            tools: AggregateIndex::new(),
            resources: AggregateIndex::new(),
            prompts: AggregateIndex::new(),
            scheduler,
            state: RwLock::new(SetState {
                order: Vec::new(),
                specs: HashMap::new(),
                strategy: NamespaceStrategy::Prefix,
                expose_tools: true,
                route_timeout: Duration::from_secs(30),
                refresh_interval: None,
            }),
            jobs_tx,
            jobs_rx: Mutex::new(jobs_rx),
        })
    }

    /// Adopts a new catalog: cache entries for fingerprints that left the
    /// plan are dropped and all three indices republish.
    pub fn reconfigure(&self, catalog: &Catalog) {
        let mut order = Vec::new();
        let mut specs: HashMap<SpecFingerprint, ServerSpec> = HashMap::new();
        for (spec, fingerprint) in catalog.fingerprinted() {
            order.push((spec.name.clone(), fingerprint.clone()));
            specs.entry(fingerprint).or_insert_with(|| spec.clone());
        }
        let keep: HashSet<SpecFingerprint> = specs.keys().cloned().collect();

        {
            let mut state = self.state.write().expect("index set state poisoned");
            state.order = order;
            state.specs = specs;
            state.strategy = catalog.runtime.tool_namespace_strategy;
            state.expose_tools = catalog.runtime.expose_tools;
            state.route_timeout = catalog.runtime.route_timeout();
            state.refresh_interval = catalog.runtime.tool_refresh_interval();
        }

        self.tools.retain_entries(&|fp| keep.contains(fp));
        self.resources.retain_entries(&|fp| keep.contains(fp));
        self.prompts.retain_entries(&|fp| keep.contains(fp));
        self.rebuild_all();
    }

    pub fn rebuild_all(&self) {
        let (order, strategy) = {
            let state = self.state.read().expect("index set state poisoned");
            (state.order.clone(), state.strategy)
        };
        self.tools.rebuild(&order, strategy);
        self.resources.rebuild(&order, strategy);
        self.prompts.rebuild(&order, strategy);
    }

    pub fn enqueue(&self, job: RefreshJob) {
        if self.jobs_tx.try_send(job).is_err() {
            tracing::warn!("refresh queue is full, dropping job");
        }
    }

    /// Queues a full refresh of every configured server.
    pub fn refresh_all(&self) {
        let fingerprints: Vec<SpecFingerprint> = {
            let state = self.state.read().expect("index set state poisoned");
            state.specs.keys().cloned().collect()
        };
        for fingerprint in fingerprints {
            self.enqueue(RefreshJob {
                fingerprint,
                kind: None,
            });
        }
    }

    /// Spawns the bounded refresh worker pool.
    pub fn spawn_workers(
        self: &Arc<Self>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|_| {
                let set = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = set.jobs_rx.lock().await;
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                job = rx.recv() => job,
                            }
                        };
                        let Some(job) = job else { break };
                        set.run_refresh(job).await;
                    }
                })
            })
            .collect()
    }

    /// Forwards downstream `listChanged` notifications into refresh jobs.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ListChangedEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        set.enqueue(RefreshJob {
                            fingerprint: event.fingerprint,
                            kind: Some(event.kind),
                        });
                    }
                }
            }
        })
    }

    /// Periodic full refresh at `toolRefreshSeconds`; 0 turns the timer
    /// off (event-driven refresh continues to work).
    pub fn spawn_refresh_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = {
                    let state = set.state.read().expect("index set state poisoned");
                    state.refresh_interval
                };
                let sleep_for = interval.unwrap_or(TIMER_OFF_RECHECK);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                if interval.is_some() {
                    set.refresh_all();
                }
            }
        })
    }

    async fn run_refresh(&self, job: RefreshJob) {
        let (spec, route_timeout, expose_tools) = {
            let state = self.state.read().expect("index set state poisoned");
            let Some(spec) = state.specs.get(&job.fingerprint).cloned() else {
                return;
            };
            (spec, state.route_timeout, state.expose_tools)
        };

        let deadline = Instant::now() + route_timeout;
        let lease = match self
            .scheduler
            .acquire(&job.fingerprint, None, deadline)
            .await
        {
            Ok(lease) => lease,
            Err(HostError::Busy(_)) | Err(HostError::Starting(_)) => {
                // The cached entry stays; the next tick tries again.
                tracing::debug!(
                    server = %spec.name,
                    "refresh skipped, pool has no spare capacity"
                );
                return;
            }
            Err(error) => {
                tracing::warn!(server = %spec.name, error = %error, "refresh could not reach server");
                self.tools.remove_entry(&job.fingerprint);
                self.resources.remove_entry(&job.fingerprint);
                self.prompts.remove_entry(&job.fingerprint);
                self.rebuild_all();
                return;
            }
        };

        let capabilities = lease.instance().capabilities;
        let peer = lease.peer().clone();

        let wants = |kind: ListChangedKind| job.kind.is_none() || job.kind == Some(kind);
        if wants(ListChangedKind::Tools) {
            if expose_tools {
                refresh_kind(&self.tools, &spec, &job.fingerprint, capabilities, &peer, deadline)
                    .await;
            } else {
                self.tools.remove_entry(&job.fingerprint);
            }
        }
        if wants(ListChangedKind::Resources) {
            refresh_kind(
                &self.resources,
                &spec,
                &job.fingerprint,
                capabilities,
                &peer,
                deadline,
            )
            .await;
        }
        if wants(ListChangedKind::Prompts) {
            refresh_kind(
                &self.prompts,
                &spec,
                &job.fingerprint,
                capabilities,
                &peer,
                deadline,
            )
            .await;
        }

        lease.release().await;
        self.rebuild_all();
    }
}

/// Refreshes one cache entry. Any list failure (including *method not
/// supported*) drops the entry so the rebuild stops publishing that
/// server's names until a refresh succeeds again.
async fn refresh_kind<K: IndexKind>(
    index: &AggregateIndex<K>,
    spec: &ServerSpec,
    fingerprint: &SpecFingerprint,
    capabilities: mcpd_core::CapabilityFlags,
    peer: &rmcp::Peer<rmcp::RoleClient>,
    deadline: Instant,
) {
    if !K::capability_ok(&capabilities) {
        index.remove_entry(fingerprint);
        return;
    }
    match tokio::time::timeout_at(deadline, K::list(peer)).await {
        Err(_) => {
            tracing::warn!(kind = K::LABEL, server = %spec.name, "list timed out");
            index.remove_entry(fingerprint);
        }
        Ok(Err(error)) => {
            tracing::warn!(kind = K::LABEL, server = %spec.name, error = %error, "list failed");
            index.remove_entry(fingerprint);
        }
        Ok(Ok(mut items)) => {
            items.retain(|item| K::exposed(spec, item));
            index.update_entry(fingerprint, &spec.name, items, capabilities);
        }
    }
}
