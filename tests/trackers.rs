//! Chunk trackers, workspaces, listeners and object caches.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use fixtures::{eventually, grid_item, grid_table, int_field, spawn_core};
use swarmtable::core::revision::FieldType;
use swarmtable::{
    ItemId, LocalNetwork, Revision, RevisionCodec, TableDescriptor, TransactionCache, Value,
    Workspace,
};

#[test]
fn new_chunks_propagate_into_tracker_revisions_once() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4600, false);
    // Poses track the vertex chunks that reference them.
    let poses = core.add_table(TableDescriptor::new("poses", vec![FieldType::Double]).unwrap());
    let vertices =
        core.add_table(TableDescriptor::new("vertices", vec![FieldType::Int32]).unwrap());

    let pose_chunk = poses.new_chunk_with_generated_id();
    let mut pose = poses.new_revision();
    pose.set_item_id(ItemId::generate(core.own_peer().as_str()));
    pose.set(0, Value::Double(1.5)).unwrap();
    let pose_id = pose.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&poses, &pose_chunk, pose);
    assert!(txn.commit());

    vertices.push_new_chunk_ids_to_tracker(
        "poses",
        Arc::new(move |_vertex: &Revision| pose_id),
    );

    let vertex_chunk = vertices.new_chunk_with_generated_id();
    let mut txn = core.begin_transaction();
    let mut vertex = vertices.new_revision();
    vertex.set_item_id(ItemId::generate(core.own_peer().as_str()));
    vertex.set(0, Value::Int32(1)).unwrap();
    txn.insert(&vertices, &vertex_chunk, vertex);
    assert!(txn.commit());

    let mut reader = core.begin_transaction();
    let tracked = reader.get_by_id(&poses, &pose_id).unwrap();
    assert!(
        tracked.trackees().contains("vertices", &vertex_chunk.id()),
        "pose revision now names the new vertex chunk"
    );
    let now = core.clock().sample();
    let history_len = pose_chunk.with_data(|data| data.history(&pose_id, now).unwrap().len());
    assert_eq!(history_len, 2, "insert plus one tracker update");

    // A second insert into the same chunk adds nothing to the trackee map,
    // so no further tracker update is staged.
    let mut txn = core.begin_transaction();
    let mut vertex = vertices.new_revision();
    vertex.set_item_id(ItemId::generate(core.own_peer().as_str()));
    vertex.set(0, Value::Int32(2)).unwrap();
    txn.insert(&vertices, &vertex_chunk, vertex);
    assert!(txn.commit());

    let now = core.clock().sample();
    let history_len = pose_chunk.with_data(|data| data.history(&pose_id, now).unwrap().len());
    assert_eq!(history_len, 2, "tracker propagation is idempotent");

    // A reader can resolve the trackees it finds.
    let mut reader = core.begin_transaction();
    assert!(reader.fetch_all_chunks_tracked_by_items_in(&poses));
    core.shutdown();
}

#[test]
fn workspace_narrows_reads_but_not_writes() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4610, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();

    let revision = grid_item(&core, &table, 42);
    let id = revision.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, revision);
    assert!(txn.commit());

    let blind = Arc::new(Workspace::with_table_filters(
        vec!["grid".to_string()],
        Vec::new(),
    ));
    let mut narrowed = core.begin_transaction_with(blind);
    assert!(narrowed.get_by_id(&table, &id).is_none());
    assert!(narrowed.dump_active_chunks(&table).is_empty());

    // Writes pass through regardless of the filter.
    let unfiltered_insert = grid_item(&core, &table, 7);
    let new_id = unfiltered_insert.item_id();
    narrowed.insert(&table, &chunk, unfiltered_insert);
    assert!(narrowed.commit());
    let mut reader = core.begin_transaction();
    assert!(reader.get_by_id(&table, &new_id).is_some());
    core.shutdown();
}

#[test]
fn listeners_receive_new_chunks() {
    let network = LocalNetwork::new();
    let core_a = spawn_core(&network, 4620, false);
    let core_b = spawn_core(&network, 4621, false);
    let table_a = grid_table(&core_a);
    let table_b = grid_table(&core_b);

    // B asks A to push every chunk A creates.
    table_b.announce_to_listeners(&[core_a.own_peer().clone()]);
    let chunk = table_a.new_chunk_with_generated_id();
    assert!(
        eventually(Duration::from_secs(5), || table_b.has_chunk(&chunk.id())),
        "new chunk pushed to the listener"
    );
    core_b.shutdown();
    core_a.shutdown();
}

#[derive(Clone)]
struct Counter {
    value: i32,
}

struct CounterCodec;

impl RevisionCodec<Counter> for CounterCodec {
    fn object_from_revision(&self, revision: &Revision) -> Counter {
        let value = match revision.get(0).unwrap() {
            Some(Value::Int32(value)) => *value,
            _ => 0,
        };
        Counter { value }
    }

    fn object_to_revision(&self, object: &Counter, revision: &mut Revision) {
        revision.set(0, Value::Int32(object.value)).unwrap();
    }

    fn requires_update(&self, new: &Counter, old: &Counter) -> bool {
        new.value != old.value
    }
}

#[test]
fn cache_stages_dirty_objects_and_skips_clean_ones() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4630, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();

    let seeded = grid_item(&core, &table, 5);
    let seeded_id = seeded.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, seeded);
    assert!(txn.commit());

    // Insert through the cache, mutate the seeded object.
    let mut txn = core.begin_transaction();
    let mut cache = TransactionCache::new(Arc::clone(&table), Arc::new(CounterCodec));
    let fresh_id = ItemId::generate(core.own_peer().as_str());
    cache.insert(&chunk, fresh_id, Counter { value: 11 });
    cache.get_mut(&mut txn, &seeded_id).unwrap().value = 6;
    cache.prepare_for_commit(&mut txn);
    assert!(txn.commit());

    let mut reader = core.begin_transaction();
    assert_eq!(int_field(&reader.get_by_id(&table, &fresh_id).unwrap()), 11);
    assert_eq!(int_field(&reader.get_by_id(&table, &seeded_id).unwrap()), 6);

    // A touched-but-equal object stages nothing.
    let mut txn = core.begin_transaction();
    let mut cache = TransactionCache::new(Arc::clone(&table), Arc::new(CounterCodec));
    let current = cache.get_mut(&mut txn, &seeded_id).unwrap();
    current.value = 6;
    cache.prepare_for_commit(&mut txn);
    assert!(txn.commit());
    let now = core.clock().sample();
    let history_len = chunk.with_data(|data| data.history(&seeded_id, now).unwrap().len());
    assert_eq!(history_len, 2, "clean write-back suppressed");
    core.shutdown();
}
