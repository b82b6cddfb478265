//! Time-qualified reads over an item's history.

mod fixtures;

use fixtures::{grid_item, grid_table, int_field, spawn_core};
use swarmtable::{LocalNetwork, LogicalTime};

#[test]
fn reads_at_past_times_see_past_versions() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4200, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();

    let revision = grid_item(&core, &table, 42);
    let id = revision.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, revision);
    assert!(txn.commit());

    let mut txn = core.begin_transaction();
    let mut draft = txn.get_by_id(&table, &id).unwrap().copy_for_write();
    draft.set(0, swarmtable::Value::Int32(21)).unwrap();
    txn.update(&table, draft);
    assert!(txn.commit());
    let t_mid = core.clock().sample();

    let mut txn = core.begin_transaction();
    let mut draft = txn.get_by_id(&table, &id).unwrap().copy_for_write();
    draft.set(0, swarmtable::Value::Int32(84)).unwrap();
    txn.update(&table, draft);
    assert!(txn.commit());
    let now = core.clock().sample();

    assert_eq!(int_field(&chunk.get_by_id(&id, t_mid).unwrap()), 21);
    assert_eq!(int_field(&chunk.get_by_id(&id, now).unwrap()), 84);
    let history = chunk.with_data(|data| data.history(&id, now).unwrap());
    assert_eq!(history.len(), 3);
    // Newest first, strictly decreasing update times.
    let times: Vec<LogicalTime> = history.iter().map(|r| r.update_time()).collect();
    assert!(times.windows(2).all(|pair| pair[0] > pair[1]));

    // Snapshot transactions behave the same as raw container reads.
    let mut past = swarmtable::Transaction::begin_at(core.manager().clone(), t_mid);
    assert_eq!(int_field(&past.get_by_id(&table, &id).unwrap()), 21);
    core.shutdown();
}
