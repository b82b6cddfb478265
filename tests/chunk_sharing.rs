//! Legacy chunk sharing: single-peer reads, cross-peer conflicts, grind.

mod fixtures;

use std::time::Duration;

use fixtures::{eventually, grid_item, grid_table, int_field, spawn_core};
use swarmtable::LocalNetwork;

#[test]
fn single_insert_then_read() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4100, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();

    let revision = grid_item(&core, &table, 42);
    let id = revision.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, revision);
    assert!(txn.commit());

    let mut reader = core.begin_transaction();
    let read = reader.get_by_id(&table, &id).expect("item readable");
    assert_eq!(int_field(&read), 42);
    assert_eq!(reader.dump_active_chunks(&table).len(), 1);
    core.shutdown();
}

#[test]
fn concurrent_remote_updates_commit_exactly_once() {
    let network = LocalNetwork::new();
    let core_a = spawn_core(&network, 4110, false);
    let core_b = spawn_core(&network, 4111, false);
    let table_a = grid_table(&core_a);
    let table_b = grid_table(&core_b);

    let chunk_a = table_a.new_chunk_with_generated_id();
    let revision = grid_item(&core_a, &table_a, 42);
    let id = revision.item_id();
    let mut seed = core_a.begin_transaction();
    seed.insert(&table_a, &chunk_a, revision);
    assert!(seed.commit());

    assert!(chunk_a.request_participation_from(core_b.own_peer()));
    assert!(table_b.has_chunk(&chunk_a.id()), "replica installed via init");

    // Both peers snapshot the same version, then race their updates.
    let mut txn_a = core_a.begin_transaction();
    let mut txn_b = core_b.begin_transaction();
    let mut draft_a = txn_a.get_by_id(&table_a, &id).unwrap().copy_for_write();
    let mut draft_b = txn_b.get_by_id(&table_b, &id).unwrap().copy_for_write();
    draft_a.set(0, swarmtable::Value::Int32(21)).unwrap();
    draft_b.set(0, swarmtable::Value::Int32(84)).unwrap();
    txn_a.update(&table_a, draft_a);
    txn_b.update(&table_b, draft_b);

    let committed_a = txn_a.commit();
    let committed_b = txn_b.commit();
    assert!(committed_a ^ committed_b, "exactly one commit must win");

    let winner = if committed_a { 21 } else { 84 };
    for core in [&core_a, &core_b] {
        let table = core.get_table("grid").unwrap();
        let mut reader = core.begin_transaction();
        let read = reader.get_by_id(&table, &id).unwrap();
        assert_eq!(int_field(&read), winner);
    }
    core_b.shutdown();
    core_a.shutdown();
}

#[test]
fn grind_insert_update_cycles_across_peers() {
    const PEERS: usize = 3;
    const CYCLES: usize = 4;

    let network = LocalNetwork::new();
    let cores: Vec<_> = (0..PEERS)
        .map(|i| spawn_core(&network, 4120 + i as u16, false))
        .collect();
    let tables: Vec<_> = cores.iter().map(grid_table).collect();

    let chunk = tables[0].new_chunk_with_generated_id();
    let chunk_id = chunk.id();
    for core in &cores[1..] {
        assert!(chunk.request_participation_from(core.own_peer()));
    }

    std::thread::scope(|scope| {
        for (core, table) in cores.iter().zip(&tables) {
            scope.spawn(move || {
                for cycle in 0..CYCLES {
                    let chunk = table.local_chunk(&chunk_id).unwrap();
                    // Insert a fresh item, retrying on conflict.
                    let id = loop {
                        let revision = grid_item(core, table, cycle as i32);
                        let id = revision.item_id();
                        let mut txn = core.begin_transaction();
                        txn.insert(table, &chunk, revision);
                        if txn.commit() {
                            break id;
                        }
                    };
                    // Update it, retrying on conflict.
                    loop {
                        let mut txn = core.begin_transaction();
                        let mut draft =
                            txn.get_by_id(table, &id).unwrap().copy_for_write();
                        draft
                            .set(0, swarmtable::Value::Int32(cycle as i32 + 1000))
                            .unwrap();
                        txn.update(table, draft);
                        if txn.commit() {
                            break;
                        }
                    }
                }
            });
        }
    });

    let expected = PEERS * CYCLES;
    for (core, table) in cores.iter().zip(&tables) {
        assert!(
            eventually(Duration::from_secs(5), || {
                let mut reader = core.begin_transaction();
                reader.dump_active_chunks(table).len() == expected
            }),
            "every peer converges to {expected} items"
        );
        let mut reader = core.begin_transaction();
        for id in reader.get_available_ids(table) {
            let revision = reader.get_by_id(table, &id).expect("inserted id readable");
            assert!(int_field(&revision) >= 1000, "update applied");
        }
    }
    for core in cores {
        core.kill();
    }
}
