//! Save/restore round-trip through the gzip table archive.

mod fixtures;

use fixtures::{grid_item, grid_table, int_field, spawn_core};
use swarmtable::{LocalNetwork, TableArchive};

#[test]
fn archived_table_survives_process_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.archive");

    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4300, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();
    let chunk_id = chunk.id();

    let first = grid_item(&core, &table, 42);
    let second = grid_item(&core, &table, 21);
    let first_id = first.item_id();
    let second_id = second.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, first);
    txn.insert(&table, &chunk, second);
    assert!(txn.commit());

    let now = core.clock().sample();
    let original_insert_times: Vec<_> = [first_id, second_id]
        .iter()
        .map(|id| chunk.get_by_id(id, now).unwrap().insert_time())
        .collect();

    let archive = TableArchive::new(&path);
    assert_eq!(archive.store(&table, now).unwrap(), 2);
    core.kill();

    // Fresh process state.
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4300, false);
    let table = grid_table(&core);
    assert_eq!(archive.restore(&table, core.clock()).unwrap(), 2);

    let chunk = table
        .local_chunk(&chunk_id)
        .expect("chunk recreated under its original id");
    let now = core.clock().sample();
    let first_read = chunk.get_by_id(&first_id, now).unwrap();
    let second_read = chunk.get_by_id(&second_id, now).unwrap();
    assert_eq!(int_field(&first_read), 42);
    assert_eq!(int_field(&second_read), 21);
    assert_eq!(first_read.insert_time(), original_insert_times[0]);
    assert_eq!(second_read.insert_time(), original_insert_times[1]);

    // Restored state accepts new commits: the clock resumed past the
    // archived timestamps.
    let mut txn = core.begin_transaction();
    let mut draft = txn.get_by_id(&table, &first_id).unwrap().copy_for_write();
    draft.set(0, swarmtable::Value::Int32(43)).unwrap();
    txn.update(&table, draft);
    assert!(txn.commit());
    core.shutdown();
}
