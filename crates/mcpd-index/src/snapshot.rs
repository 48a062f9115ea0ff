use serde::Serialize;
use sha2::{Digest, Sha256};

use mcpd_core::{CapabilityFlags, HostError, SpecFingerprint};

/// Fixed page size for list pagination.
pub const PAGE_SIZE: usize = 200;

/// One aggregated entry: the public name plus the item as the downstream
/// server reported it (renamed for namespaced kinds).
#[derive(Debug, Clone, Serialize)]
pub struct PublishedItem<T> {
    pub public_name: String,
    pub server: String,
    #[serde(flatten)]
    pub item: T,
}

/// Immutable, etagged view of one aggregated list. Published atomically;
/// readers see this snapshot in full or its successor in full.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot<T> {
    pub etag: String,
    pub items: Vec<PublishedItem<T>>,
}

impl<T: Serialize> Snapshot<T> {
    pub(crate) fn empty() -> Self {
        Self {
            etag: etag_of::<T>(&[]),
            items: Vec::new(),
        }
    }
}

/// Where a public name dispatches to.
#[derive(Debug, Clone)]
pub struct Target {
    pub fingerprint: SpecFingerprint,
    pub original: String,
    pub capabilities: CapabilityFlags,
}

/// Content hash of the serialized items; two snapshots with equal etags
/// have equal content.
pub(crate) fn etag_of<T: Serialize>(items: &[PublishedItem<T>]) -> String {
    let payload = serde_json::to_vec(items).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

/// One page of a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub etag: String,
    pub items: Vec<PublishedItem<T>>,
    pub next_cursor: Option<String>,
}

/// Cursor-based pagination over a snapshot. The cursor carries the etag it
/// was issued against and the last public name served; an etag mismatch
/// (the snapshot changed underneath the caller) restarts from the top.
pub fn page<T: Clone + Serialize>(
    snapshot: &Snapshot<T>,
    cursor: Option<&str>,
    page_size: usize,
) -> Result<Page<T>, HostError> {
    let start = match cursor {
        None | Some("") => 0,
        Some(raw) => {
            let (etag, last_name) = raw.split_once(':').ok_or_else(|| {
                HostError::InvalidParams(format!("malformed cursor '{raw}'"))
            })?;
            if etag != snapshot.etag {
                0
            } else {
                snapshot
                    .items
                    .iter()
                    .position(|item| item.public_name.as_str() > last_name)
                    .unwrap_or(snapshot.items.len())
            }
        }
    };

    let end = (start + page_size).min(snapshot.items.len());
    let items: Vec<PublishedItem<T>> = snapshot.items[start..end].to_vec();
    let next_cursor = (end < snapshot.items.len())
        .then(|| format!("{}:{}", snapshot.etag, snapshot.items[end - 1].public_name));

    Ok(Page {
        etag: snapshot.etag.clone(),
        items,
        next_cursor,
    })
}
