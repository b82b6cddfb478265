//! Net table manager: owns the tables of one peer and routes inbound
//! requests to them.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::chunk::PeerTimeoutPolicy;
use crate::core::identity::PeerId;
use crate::core::time::LogicalClock;
use crate::net::hub::{Hub, MessageHandler};
use crate::net::proto::{Message, Payload};

use super::net_table::NetTable;
use super::template::TableDescriptor;

pub struct NetTableManager {
    use_raft: bool,
    timeout_policy: PeerTimeoutPolicy,
    clock: Arc<LogicalClock>,
    hub: RwLock<Option<Arc<dyn Hub>>>,
    tables: RwLock<BTreeMap<String, Arc<NetTable>>>,
}

impl NetTableManager {
    pub fn new(use_raft: bool, timeout_policy: PeerTimeoutPolicy, clock: Arc<LogicalClock>) -> Self {
        Self {
            use_raft,
            timeout_policy,
            clock,
            hub: RwLock::new(None),
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    /// The hub is attached after construction: the transport needs the
    /// manager as its handler before the manager can send through it.
    pub fn set_hub(&self, hub: Arc<dyn Hub>) {
        let mut slot = self.hub.write().unwrap_or_else(|e| e.into_inner());
        assert!(slot.is_none(), "hub attached twice");
        *slot = Some(hub);
    }

    fn hub(&self) -> Arc<dyn Hub> {
        self.hub
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .expect("hub not attached")
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn add_table(&self, descriptor: TableDescriptor) -> Arc<NetTable> {
        let table = Arc::new(NetTable::new(
            descriptor,
            self.use_raft,
            self.timeout_policy,
            self.hub(),
            Arc::clone(&self.clock),
        ));
        table.spawn_chunk_fetcher();
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let previous = tables.insert(table.name().to_string(), Arc::clone(&table));
        assert!(previous.is_none(), "table {} added twice", table.name());
        table
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<NetTable>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn tables(&self) -> Vec<Arc<NetTable>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Announced shutdown: leave every chunk of every table.
    pub fn leave_all_chunks(&self) {
        for table in self.tables() {
            table.leave_all_chunks();
        }
    }

    /// Hard teardown: stop consensus machinery without announcing.
    pub fn kill(&self) {
        let tables: Vec<Arc<NetTable>> = {
            let mut guard = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let tables = guard.values().cloned().collect();
            guard.clear();
            tables
        };
        for table in tables {
            table.stop_chunk_fetcher();
            for chunk in table.active_chunks() {
                if let Some(consensus) = chunk.as_consensus() {
                    consensus.stop();
                }
            }
        }
    }

    fn payload_table<'p>(payload: &'p Payload) -> Option<&'p str> {
        match payload {
            Payload::ChunkConnect { chunk }
            | Payload::ChunkInsert { chunk, .. }
            | Payload::ChunkLeave { chunk }
            | Payload::ChunkLock { chunk, .. }
            | Payload::ChunkNewPeer { chunk, .. }
            | Payload::ChunkUnlock { chunk }
            | Payload::ChunkUpdate { chunk, .. }
            | Payload::QueryState { chunk }
            | Payload::Vote { chunk, .. }
            | Payload::RaftChunkLock { chunk, .. }
            | Payload::RaftChunkUnlock { chunk, .. }
            | Payload::RaftTxnInfo { chunk, .. }
            | Payload::RaftTxnQuery { chunk, .. }
            | Payload::RaftInsert { chunk, .. }
            | Payload::RaftLeave { chunk, .. }
            | Payload::RaftConnect { chunk } => Some(&chunk.table),
            Payload::ChunkInit(init) => Some(&init.chunk.table),
            Payload::AppendEntries(append) => Some(&append.chunk.table),
            Payload::PushNewChunks { table, .. }
            | Payload::AnnounceToListeners { table }
            | Payload::RoutedIndex { table, .. }
            | Payload::RoutedSpatial { table, .. } => Some(table),
            _ => None,
        }
    }

    fn handle_discovery(&self, _sender: &PeerId) -> Payload {
        // Any peer can answer discovery: it knows the transport's reachable
        // set plus itself.
        let hub = self.hub();
        let mut peers = hub.ready_peers();
        peers.push(hub.own_peer().clone());
        peers.sort();
        peers.dedup();
        Payload::PeerList { peers }
    }
}

impl MessageHandler for NetTableManager {
    fn handle(&self, message: &Message) -> Payload {
        let payload = &message.payload;
        match payload {
            Payload::Discovery => return self.handle_discovery(&message.sender),
            Payload::DiscoveryRemove { .. } | Payload::Ready => return Payload::Ack,
            _ => {}
        }
        let Some(table_name) = Self::payload_table(payload) else {
            tracing::warn!(kind = payload.kind(), "request without table routing");
            return Payload::Invalid;
        };
        let Some(table) = self.get_table(table_name) else {
            return Payload::Decline {
                reason: format!("unknown table `{table_name}`"),
            };
        };
        table.handle_request(&message.sender, payload)
    }
}
