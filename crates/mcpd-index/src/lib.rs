//! Aggregation indices: one generic pattern, instantiated for tools,
//! resources, and prompts.
//!
//! Per-server lists are cached by fingerprint; rebuilds sort, namespace,
//! and hash outside the cache lock and publish `{snapshot, target map}`
//! together behind a single atomic pointer, so `snapshot()` and
//! `resolve()` are wait-free.

mod index;
mod kind;
mod set;
mod snapshot;

pub use index::{AggregateIndex, SnapshotStream};
pub use kind::{IndexKind, PromptsKind, ResourcesKind, ToolsKind};
pub use set::{IndexSet, RefreshJob};
pub use snapshot::{PAGE_SIZE, Page, PublishedItem, Snapshot, Target, page};

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
