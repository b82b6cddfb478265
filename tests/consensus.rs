//! Consensus chunks: replication, joins, elections, multi-chunk commits.

mod fixtures;

use std::time::Duration;

use fixtures::{eventually, grid_item, grid_table, int_field, spawn_core};
use swarmtable::{Core, LocalNetwork, NetTable, RaftState};

fn consensus_cluster(
    network: &LocalNetwork,
    base_port: u16,
    size: usize,
) -> (Vec<Core>, Vec<std::sync::Arc<NetTable>>, swarmtable::Chunk) {
    let cores: Vec<_> = (0..size)
        .map(|i| spawn_core(network, base_port + i as u16, true))
        .collect();
    let tables: Vec<_> = cores.iter().map(grid_table).collect();

    let chunk = tables[0].new_chunk_with_generated_id();
    let chunk_id = chunk.id();
    for (core, table) in cores.iter().zip(&tables).skip(1) {
        assert!(chunk.request_participation_from(core.own_peer()));
        assert!(
            eventually(Duration::from_secs(10), || table.has_chunk(&chunk_id)),
            "replica installed through the consensus join"
        );
    }
    (cores, tables, chunk)
}

#[test]
fn write_replicates_to_joined_peers() {
    let network = LocalNetwork::new();
    let (cores, tables, chunk) = consensus_cluster(&network, 4400, 3);

    let revision = grid_item(&cores[0], &tables[0], 42);
    let id = revision.item_id();
    let mut txn = cores[0].begin_transaction();
    txn.insert(&tables[0], &chunk, revision);
    assert!(txn.commit());

    for (core, table) in cores.iter().zip(&tables) {
        let replica = table.local_chunk(&chunk.id()).unwrap();
        assert!(
            eventually(Duration::from_secs(5), || {
                let now = core.clock().sample();
                replica.get_by_id(&id, now).is_some()
            }),
            "write visible on every peer"
        );
        let now = core.clock().sample();
        assert_eq!(int_field(&replica.get_by_id(&id, now).unwrap()), 42);
    }
    for core in cores {
        core.kill();
    }
}

#[test]
fn leader_reemerges_after_voluntary_stepdown() {
    let network = LocalNetwork::new();
    let (cores, tables, _chunk) = consensus_cluster(&network, 4410, 5);

    let consensus_of = |table: &NetTable| {
        table
            .active_chunks()
            .into_iter()
            .next()
            .and_then(|chunk| chunk.as_consensus().cloned())
            .unwrap()
    };
    let nodes: Vec<_> = tables.iter().map(|t| consensus_of(t)).collect();

    // Wait for the initial leader.
    assert!(eventually(Duration::from_secs(10), || {
        nodes.iter().any(|node| node.state() == RaftState::Leader)
    }));
    let old_leader = nodes
        .iter()
        .find(|node| node.state() == RaftState::Leader)
        .unwrap();
    let old_term = old_leader.term();
    assert!(old_leader.give_up_leadership());

    // A leader emerges in a later term and the peers agree on it.
    assert!(
        eventually(Duration::from_secs(10), || {
            let leaders: Vec<_> = nodes
                .iter()
                .filter(|node| node.state() == RaftState::Leader)
                .collect();
            if leaders.len() != 1 || leaders[0].term() <= old_term {
                return false;
            }
            let elected = leaders[0].node().own_peer().clone();
            nodes
                .iter()
                .all(|node| node.leader().as_ref() == Some(&elected))
        }),
        "new leader elected and agreed upon within bounded time"
    );

    // Entries appended after the election still commit by majority.
    let revision = grid_item(&cores[0], &tables[0], 7);
    let id = revision.item_id();
    let chunk = tables[0].active_chunks().into_iter().next().unwrap();
    let mut txn = cores[0].begin_transaction();
    txn.insert(&tables[0], &chunk, revision);
    assert!(txn.commit());
    for (core, table) in cores.iter().zip(&tables) {
        let replica = table.local_chunk(&chunk.id()).unwrap();
        assert!(eventually(Duration::from_secs(5), || {
            let now = core.clock().sample();
            replica.get_by_id(&id, now).is_some()
        }));
    }
    for core in cores {
        core.kill();
    }
}

#[test]
fn severed_peer_is_evicted_and_writes_continue() {
    let network = LocalNetwork::new();
    let (cores, tables, chunk) = consensus_cluster(&network, 4420, 3);

    // Let a leader settle, then crash a follower without a leave
    // announcement.
    let state_of = |i: usize| {
        tables[i]
            .local_chunk(&chunk.id())
            .unwrap()
            .as_consensus()
            .unwrap()
            .state()
    };
    assert!(eventually(Duration::from_secs(10), || {
        (0..cores.len()).any(|i| state_of(i) == RaftState::Leader)
    }));
    let victim = (0..cores.len())
        .find(|&i| state_of(i) != RaftState::Leader)
        .expect("a follower exists");
    network.sever(cores[victim].own_peer());

    // The tracker notices the missed heartbeats and evicts the peer.
    let survivor = (0..cores.len()).find(|i| *i != victim).unwrap();
    let survivor_chunk = tables[survivor].local_chunk(&chunk.id()).unwrap();
    assert!(
        eventually(Duration::from_secs(10), || survivor_chunk.peer_size() == 1),
        "swarm shrinks to the surviving pair"
    );

    // A write with one of three peers gone still reaches the majority.
    let revision = grid_item(&cores[survivor], &tables[survivor], 9);
    let id = revision.item_id();
    let mut txn = cores[survivor].begin_transaction();
    txn.insert(&tables[survivor], &survivor_chunk, revision);
    assert!(txn.commit());
    assert!(eventually(Duration::from_secs(5), || {
        let now = cores[survivor].clock().sample();
        survivor_chunk.get_by_id(&id, now).is_some()
    }));
    for core in cores {
        core.kill();
    }
}

#[test]
fn multi_chunk_commit_prepares_both_consensus_chunks() {
    let network = LocalNetwork::new();
    let core = spawn_core(&network, 4430, true);
    let table = grid_table(&core);
    let chunk_x = table.new_chunk_with_generated_id();
    let chunk_y = table.new_chunk_with_generated_id();

    let first = grid_item(&core, &table, 1);
    let second = grid_item(&core, &table, 2);
    let first_id = first.item_id();
    let second_id = second.item_id();
    let mut txn = core.begin_transaction();
    txn.insert(&table, &chunk_x, first);
    txn.insert(&table, &chunk_y, second);
    assert!(txn.commit(), "two-phase prepare across both chunk logs");

    let now = core.clock().sample();
    assert!(chunk_x.get_by_id(&first_id, now).is_some());
    assert!(chunk_y.get_by_id(&second_id, now).is_some());
    core.kill();
}
