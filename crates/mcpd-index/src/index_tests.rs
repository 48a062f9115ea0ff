use std::collections::BTreeMap;

use rmcp::model::Tool;

use mcpd_core::{
    CapabilityFlags, DEFAULT_PROTOCOL_VERSION, ExposeSpec, NamespaceStrategy, ServerSpec,
    SpecFingerprint, Strategy, TransportSpec,
};

use super::kind::ToolsKind;
use super::index::AggregateIndex;
use super::snapshot::page;

fn tool(name: &str) -> Tool {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "description": "test tool",
        "inputSchema": {"type": "object", "properties": {}},
    }))
    .expect("tool json")
}

fn fingerprint_for(command: &str) -> SpecFingerprint {
    ServerSpec {
        name: command.to_string(),
        transport: TransportSpec::Stdio {
            command: command.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        },
        protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        strategy: Strategy::Stateless,
        max_concurrent: 1,
        idle_seconds: 60,
        session_ttl_seconds: 300,
        min_ready: 0,
        expose: ExposeSpec::default(),
        tags: Vec::new(),
        disabled: false,
    }
    .fingerprint()
}

fn caps_with_tools() -> CapabilityFlags {
    CapabilityFlags {
        tools: true,
        ..CapabilityFlags::default()
    }
}

#[test]
fn prefix_namespacing_sorts_and_maps_targets() {
    let index: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let fp1 = fingerprint_for("s1");
    let fp2 = fingerprint_for("s2");
    let order = vec![("s1".to_string(), fp1.clone()), ("s2".to_string(), fp2.clone())];

    index.update_entry(&fp1, "s1", vec![tool("a"), tool("b")], caps_with_tools());
    index.update_entry(&fp2, "s2", vec![tool("b"), tool("c")], caps_with_tools());
    assert!(index.rebuild(&order, NamespaceStrategy::Prefix));

    let snapshot = index.snapshot();
    let names: Vec<&str> = snapshot
        .items
        .iter()
        .map(|item| item.public_name.as_str())
        .collect();
    assert_eq!(names, vec!["s1.a", "s1.b", "s2.b", "s2.c"]);

    let target = index.resolve("s2.b").expect("target for s2.b");
    assert_eq!(target.fingerprint, fp2);
    assert_eq!(target.original, "b");
    assert!(target.capabilities.tools);
    assert!(index.resolve("b").is_none(), "unprefixed name is not published");

    // Published tool names carry the public name.
    assert_eq!(snapshot.items[0].item.name.as_ref(), "s1.a");
}

#[test]
fn unchanged_rebuild_keeps_etag_and_stays_silent() {
    let index: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let fp = fingerprint_for("s1");
    let order = vec![("s1".to_string(), fp.clone())];

    index.update_entry(&fp, "s1", vec![tool("a")], caps_with_tools());
    assert!(index.rebuild(&order, NamespaceStrategy::Prefix));
    let etag = index.snapshot().etag.clone();

    let mut stream = index.subscribe();

    // Same content again: same etag, no publication, no notification.
    index.update_entry(&fp, "s1", vec![tool("a")], caps_with_tools());
    assert!(!index.rebuild(&order, NamespaceStrategy::Prefix));
    assert_eq!(index.snapshot().etag, etag);
    assert!(stream.try_recv().is_none());

    // Changed content: new etag, exactly one notification.
    index.update_entry(&fp, "s1", vec![tool("a"), tool("d")], caps_with_tools());
    assert!(index.rebuild(&order, NamespaceStrategy::Prefix));
    assert_ne!(index.snapshot().etag, etag);
    let notified = stream.try_recv().expect("one notification");
    assert_eq!(notified.etag, index.snapshot().etag);
    assert!(stream.try_recv().is_none());
}

#[test]
fn flat_conflicts_keep_first_seen() {
    let index: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let fp1 = fingerprint_for("s1");
    let fp2 = fingerprint_for("s2");
    let order = vec![("s1".to_string(), fp1.clone()), ("s2".to_string(), fp2.clone())];

    index.update_entry(&fp1, "s1", vec![tool("shared")], caps_with_tools());
    index.update_entry(&fp2, "s2", vec![tool("shared")], caps_with_tools());
    index.rebuild(&order, NamespaceStrategy::Flat);

    let snapshot = index.snapshot();
    assert_eq!(snapshot.items.len(), 1);
    let target = index.resolve("shared").expect("flat target");
    assert_eq!(target.fingerprint, fp1, "first seen wins");
}

#[test]
fn removing_an_entry_unpublishes_its_names() {
    let index: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let fp1 = fingerprint_for("s1");
    let fp2 = fingerprint_for("s2");
    let order = vec![("s1".to_string(), fp1.clone()), ("s2".to_string(), fp2.clone())];

    index.update_entry(&fp1, "s1", vec![tool("a")], caps_with_tools());
    index.update_entry(&fp2, "s2", vec![tool("b")], caps_with_tools());
    index.rebuild(&order, NamespaceStrategy::Prefix);
    assert_eq!(index.snapshot().items.len(), 2);

    assert!(index.remove_entry(&fp2));
    index.rebuild(&order, NamespaceStrategy::Prefix);
    assert_eq!(index.snapshot().items.len(), 1);
    assert!(index.resolve("s2.b").is_none());
}

#[test]
fn pagination_walks_the_snapshot_in_fixed_pages() {
    let index: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let fp = fingerprint_for("s1");
    let order = vec![("s1".to_string(), fp.clone())];
    let tools: Vec<Tool> = (0..450).map(|i| tool(&format!("t{i:04}"))).collect();
    index.update_entry(&fp, "s1", tools, caps_with_tools());
    index.rebuild(&order, NamespaceStrategy::Prefix);

    let snapshot = index.snapshot();
    let first = page(&snapshot, None, 200).unwrap();
    assert_eq!(first.items.len(), 200);
    let cursor = first.next_cursor.expect("more pages");

    let second = page(&snapshot, Some(&cursor), 200).unwrap();
    assert_eq!(second.items.len(), 200);
    assert_ne!(
        first.items.last().unwrap().public_name,
        second.items[0].public_name
    );
    let cursor = second.next_cursor.expect("one more page");

    let third = page(&snapshot, Some(&cursor), 200).unwrap();
    assert_eq!(third.items.len(), 50);
    assert!(third.next_cursor.is_none());

    // A cursor from a different etag restarts from the beginning.
    let stale = format!("not-the-etag:{}", first.items.last().unwrap().public_name);
    let restarted = page(&snapshot, Some(&stale), 200).unwrap();
    assert_eq!(restarted.items[0].public_name, first.items[0].public_name);

    // A cursor without the etag separator is rejected.
    assert!(page(&snapshot, Some("garbage"), 200).is_err());
}

#[test]
fn equal_etags_mean_equal_content() {
    let a: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let b: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let fp = fingerprint_for("s1");
    let order = vec![("s1".to_string(), fp.clone())];

    a.update_entry(&fp, "s1", vec![tool("x"), tool("y")], caps_with_tools());
    b.update_entry(&fp, "s1", vec![tool("x"), tool("y")], caps_with_tools());
    a.rebuild(&order, NamespaceStrategy::Prefix);
    b.rebuild(&order, NamespaceStrategy::Prefix);

    assert_eq!(a.snapshot().etag, b.snapshot().etag);
    assert_eq!(
        serde_json::to_value(&*a.snapshot()).unwrap(),
        serde_json::to_value(&*b.snapshot()).unwrap()
    );
}

#[test]
fn dropping_a_stream_unsubscribes() {
    let index: AggregateIndex<ToolsKind> = AggregateIndex::new();
    let stream = index.subscribe();
    assert_eq!(index.subscriber_count(), 1);
    drop(stream);
    assert_eq!(index.subscriber_count(), 0);
}
