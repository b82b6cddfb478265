//! Transaction engine: conflict conditions, auto-merge, merge API,
//! parallel commits.

mod fixtures;

use fixtures::{grid_item, grid_table, int_field, spawn_core};
use swarmtable::core::revision::FieldType;
use swarmtable::{
    disjoint_fields_policy, ItemId, LocalNetwork, TableDescriptor, Value,
};

#[test]
fn conflict_condition_enforces_uniqueness() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4500, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();

    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, grid_item(&core, &table, 42));
    assert!(txn.commit());

    // A second insert demanding that no row holds 42 must fail.
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, grid_item(&core, &table, 42));
    txn.add_conflict_condition(&table, &chunk, 0, Value::Int32(42));
    assert!(!txn.commit());

    // The same insert without the matching row present succeeds.
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, grid_item(&core, &table, 7));
    txn.add_conflict_condition(&table, &chunk, 0, Value::Int32(9));
    assert!(txn.commit());
    core.shutdown();
}

#[test]
fn auto_merge_resolves_disjoint_field_edits() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4510, false);
    let table = core.add_table(
        TableDescriptor::new("pair", vec![FieldType::Int32, FieldType::Int32]).unwrap(),
    );
    table.add_merge_policy(disjoint_fields_policy());
    let chunk = table.new_chunk_with_generated_id();

    let mut revision = table.new_revision();
    revision.set_item_id(ItemId::generate(core.own_peer().as_str()));
    revision.set(0, Value::Int32(1)).unwrap();
    revision.set(1, Value::Int32(2)).unwrap();
    let id = revision.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, revision);
    assert!(txn.commit());

    // Two snapshots of the same version edit different fields.
    let mut txn_a = core.begin_transaction();
    let mut txn_b = core.begin_transaction();
    let mut draft_a = txn_a.get_by_id(&table, &id).unwrap().copy_for_write();
    let mut draft_b = txn_b.get_by_id(&table, &id).unwrap().copy_for_write();
    draft_a.set(0, Value::Int32(10)).unwrap();
    draft_b.set(1, Value::Int32(20)).unwrap();
    txn_a.update(&table, draft_a);
    txn_b.update(&table, draft_b);

    assert!(txn_a.commit());
    assert!(txn_b.commit(), "disjoint edit auto-merges instead of failing");

    let mut reader = core.begin_transaction();
    let read = reader.get_by_id(&table, &id).unwrap();
    assert_eq!(read.get(0).unwrap(), Some(&Value::Int32(10)));
    assert_eq!(read.get(1).unwrap(), Some(&Value::Int32(20)));
    core.shutdown();
}

#[test]
fn failed_commit_merges_into_fresh_transaction() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4520, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();

    let contested = grid_item(&core, &table, 1);
    let contested_id = contested.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, contested);
    assert!(txn.commit());

    // Stage one conflicting update and one untouched insert.
    let mut stale = core.begin_transaction();
    let mut conflicted = stale.get_by_id(&table, &contested_id).unwrap().copy_for_write();
    conflicted.set(0, Value::Int32(5)).unwrap();
    stale.update(&table, conflicted);
    let fresh_insert = grid_item(&core, &table, 8);
    let fresh_id = fresh_insert.item_id();
    stale.insert(&table, &chunk, fresh_insert);

    // Concurrent winner invalidates the staged update.
    let mut winner = core.begin_transaction();
    let mut winning = winner.get_by_id(&table, &contested_id).unwrap().copy_for_write();
    winning.set(0, Value::Int32(3)).unwrap();
    winner.update(&table, winning);
    assert!(winner.commit());
    assert!(!stale.commit());

    // Rebase: non-conflicting changes route into a fresh transaction.
    let mut rebased = core.begin_transaction();
    let mut conflicts = swarmtable::ConflictMap::new();
    stale.merge_into(&mut rebased, &mut conflicts);
    let grid_conflicts = conflicts.get("grid").expect("conflict reported");
    assert_eq!(grid_conflicts.len(), 1);
    assert_eq!(
        grid_conflicts[0].ours.as_ref().unwrap().item_id(),
        contested_id
    );
    assert_eq!(int_field(grid_conflicts[0].theirs.as_ref().unwrap()), 3);

    assert!(rebased.commit(), "merged remainder commits cleanly");
    let mut reader = core.begin_transaction();
    assert!(reader.get_by_id(&table, &fresh_id).is_some());
    assert_eq!(
        int_field(&reader.get_by_id(&table, &contested_id).unwrap()),
        3,
        "conflicting update stays unapplied"
    );
    core.shutdown();
}

#[test]
fn parallel_commit_exposes_pending_writes_to_successor() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4530, false);
    let table = grid_table(&core);
    let chunk = table.new_chunk_with_generated_id();

    let revision = grid_item(&core, &table, 42);
    let id = revision.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk, revision);
    let pending = txn.commit_in_parallel().expect("no conflicts");

    // The successor sees the predecessor's writes before they land.
    let mut successor = core.begin_transaction_on(&pending);
    let read = successor.get_by_id(&table, &id).expect("pending write visible");
    assert_eq!(int_field(&read), 42);

    let mut draft = read.copy_for_write();
    draft.set(0, Value::Int32(43)).unwrap();
    successor.update(&table, draft);

    pending.join();
    assert!(successor.commit());

    let mut reader = core.begin_transaction();
    assert_eq!(int_field(&reader.get_by_id(&table, &id).unwrap()), 43);
    core.shutdown();
}
