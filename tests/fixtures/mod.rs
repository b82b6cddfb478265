//! Shared multi-peer test fixtures: co-located peers on the in-process
//! transport.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use swarmtable::core::revision::FieldType;
use swarmtable::{
    Config, Core, ItemId, LocalNetwork, NetTable, PeerId, Revision, TableDescriptor, Value,
};

pub fn quiet_config(use_raft: bool) -> Config {
    let mut config = Config::default();
    config.use_raft = use_raft;
    config.logging.stdout = false;
    config.logging.filter = Some("warn".to_string());
    config
}

pub fn peer(port: u16) -> PeerId {
    PeerId::parse(format!("127.0.0.1:{port}")).unwrap()
}

pub fn spawn_core(network: &LocalNetwork, port: u16, use_raft: bool) -> Core {
    Core::init(peer(port), quiet_config(use_raft), network)
}

/// A single-int-field table, registered identically on every peer.
pub fn grid_table(core: &Core) -> Arc<NetTable> {
    core.add_table(TableDescriptor::new("grid", vec![FieldType::Int32]).unwrap())
}

pub fn grid_item(core: &Core, table: &NetTable, value: i32) -> Revision {
    let mut revision = table.new_revision();
    revision.set_item_id(ItemId::generate(core.own_peer().as_str()));
    revision.set(0, Value::Int32(value)).unwrap();
    revision
}

pub fn int_field(revision: &swarmtable::RevisionHandle) -> i32 {
    match revision.get(0).unwrap() {
        Some(Value::Int32(value)) => *value,
        other => panic!("expected int field, got {other:?}"),
    }
}

/// Poll `probe` until it returns true or the deadline passes.
pub fn eventually(limit: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
