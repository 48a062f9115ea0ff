use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use mcpd_core::{CapabilityFlags, NamespaceStrategy, SpecFingerprint};

use crate::kind::IndexKind;
use crate::snapshot::{PublishedItem, Snapshot, Target, etag_of};

const WATCH_CHANNEL_CAPACITY: usize = 16;

struct CacheEntry<T> {
    server: String,
    items: Vec<T>,
    capabilities: CapabilityFlags,
    last_refresh: DateTime<Utc>,
}

struct Published<T> {
    snapshot: Arc<Snapshot<T>>,
    targets: HashMap<String, Target>,
}

type SubscriberList<T> = Arc<RwLock<Vec<(u64, mpsc::Sender<Arc<Snapshot<T>>>)>>>;

/// One aggregation index (tools, resources, or prompts).
pub struct AggregateIndex<K: IndexKind> {
    cache: Mutex<HashMap<SpecFingerprint, CacheEntry<K::Item>>>,
    published: ArcSwap<Published<K::Item>>,
    subscribers: SubscriberList<K::Item>,
    next_sub_id: AtomicU64,
}

impl<K: IndexKind> Default for AggregateIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IndexKind> AggregateIndex<K> {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            published: ArcSwap::from_pointee(Published {
                snapshot: Arc::new(Snapshot::empty()),
                targets: HashMap::new(),
            }),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_sub_id: AtomicU64::new(1),
        }
    }

    /// Current snapshot; wait-free.
    pub fn snapshot(&self) -> Arc<Snapshot<K::Item>> {
        Arc::clone(&self.published.load().snapshot)
    }

    /// Public name → dispatch target; wait-free.
    pub fn resolve(&self, public_name: &str) -> Option<Target> {
        self.published.load().targets.get(public_name).cloned()
    }

    pub(crate) fn update_entry(
        &self,
        fingerprint: &SpecFingerprint,
        server: &str,
        items: Vec<K::Item>,
        capabilities: CapabilityFlags,
    ) {
        let mut cache = self.cache.lock().expect("index cache poisoned");
        cache.insert(
            fingerprint.clone(),
            CacheEntry {
                server: server.to_string(),
                items,
                capabilities,
                last_refresh: Utc::now(),
            },
        );
    }

    /// Capability revocation or a failed list call: the server's entry
    /// disappears from this index until a later refresh restores it.
    pub(crate) fn remove_entry(&self, fingerprint: &SpecFingerprint) -> bool {
        self.cache
            .lock()
            .expect("index cache poisoned")
            .remove(fingerprint)
            .is_some()
    }

    pub(crate) fn retain_entries(&self, keep: &dyn Fn(&SpecFingerprint) -> bool) {
        self.cache
            .lock()
            .expect("index cache poisoned")
            .retain(|fingerprint, _| keep(fingerprint));
    }

    pub fn last_refresh(&self, fingerprint: &SpecFingerprint) -> Option<DateTime<Utc>> {
        self.cache
            .lock()
            .expect("index cache poisoned")
            .get(fingerprint)
            .map(|entry| entry.last_refresh)
    }

    /// Rebuilds and, when content changed, atomically publishes a new
    /// snapshot + target map and notifies subscribers. `order` is the
    /// catalog order of `(server name, fingerprint)`: flat-namespace
    /// conflicts keep the first seen.
    ///
    /// The cache lock is held only to copy entries out; sorting,
    /// namespacing, and hashing all run lock-free.
    pub(crate) fn rebuild(
        &self,
        order: &[(String, SpecFingerprint)],
        strategy: NamespaceStrategy,
    ) -> bool {
        let entries: Vec<(SpecFingerprint, String, Vec<K::Item>, CapabilityFlags)> = {
            let cache = self.cache.lock().expect("index cache poisoned");
            order
                .iter()
                .filter_map(|(_, fingerprint)| {
                    cache.get(fingerprint).map(|entry| {
                        (
                            fingerprint.clone(),
                            entry.server.clone(),
                            entry.items.clone(),
                            entry.capabilities,
                        )
                    })
                })
                .collect()
        };

        let mut items: Vec<PublishedItem<K::Item>> = Vec::new();
        let mut targets: HashMap<String, Target> = HashMap::new();
        for (fingerprint, server, list, capabilities) in entries {
            for item in list {
                let original = K::original_name(&item);
                let public = match strategy {
                    NamespaceStrategy::Prefix if K::NAMESPACED => {
                        format!("{server}.{original}")
                    }
                    _ => original.clone(),
                };
                if let Some(existing) = targets.get(&public) {
                    tracing::warn!(
                        kind = K::LABEL,
                        name = %public,
                        first = %existing.fingerprint,
                        shadowed = %fingerprint,
                        "name conflict, first seen wins"
                    );
                    continue;
                }
                targets.insert(
                    public.clone(),
                    Target {
                        fingerprint: fingerprint.clone(),
                        original,
                        capabilities,
                    },
                );
                items.push(PublishedItem {
                    public_name: public.clone(),
                    server: server.clone(),
                    item: K::with_public_name(item, &public),
                });
            }
        }
        items.sort_by(|a, b| a.public_name.cmp(&b.public_name));

        let etag = etag_of(&items);
        if etag == self.published.load().snapshot.etag {
            return false;
        }

        let snapshot = Arc::new(Snapshot { etag, items });
        self.published.store(Arc::new(Published {
            snapshot: Arc::clone(&snapshot),
            targets,
        }));

        // Copy the subscriber slice under the read lock, send outside it.
        // A full channel drops the notification; the subscriber still sees
        // the latest snapshot on its next `snapshot()` read.
        let receivers: Vec<mpsc::Sender<Arc<Snapshot<K::Item>>>> = {
            let subscribers = self.subscribers.read().expect("subscriber list poisoned");
            subscribers.iter().map(|(_, tx)| tx.clone()).collect()
        };
        for tx in receivers {
            let _ = tx.try_send(Arc::clone(&snapshot));
        }
        true
    }

    /// Registers a change subscriber. The broadcaster never closes the
    /// channel from its side; dropping the stream unsubscribes.
    pub fn subscribe(&self) -> SnapshotStream<K::Item> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("subscriber list poisoned")
            .push((id, tx));
        SnapshotStream {
            id,
            rx,
            registry: Arc::clone(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber list poisoned")
            .len()
    }
}

/// A subscriber's receive side. Dropping it removes the registration.
pub struct SnapshotStream<T> {
    id: u64,
    rx: mpsc::Receiver<Arc<Snapshot<T>>>,
    registry: Arc<RwLock<Vec<(u64, mpsc::Sender<Arc<Snapshot<T>>>)>>>,
}

impl<T> SnapshotStream<T> {
    pub async fn recv(&mut self) -> Option<Arc<Snapshot<T>>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Snapshot<T>>> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for SnapshotStream<T> {
    fn drop(&mut self) {
        self.registry
            .write()
            .expect("subscriber list poisoned")
            .retain(|(id, _)| *id != self.id);
    }
}
