//! Inter-peer message schemas and CBOR encoding.
//!
//! Every request and reply travels as a [`Message`]: sender, logical
//! timestamp, payload. The receiver synchronizes its clock with the
//! timestamp before the handler runs; replies are stamped with a fresh
//! sample. Payloads form a sum type over the canonical request kinds.

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::identity::{ChunkId, Id, PeerId};
use crate::core::time::LogicalTime;

/// Canonical request kind names of the wire contract.
pub mod kind {
    pub const DISCOVERY: &str = "discovery";
    pub const DISCOVERY_REMOVE: &str = "discovery.remove";
    pub const READY: &str = "ready";

    pub const CHUNK_CONNECT: &str = "chunk.connect";
    pub const CHUNK_INIT: &str = "chunk.init";
    pub const CHUNK_INSERT: &str = "chunk.insert";
    pub const CHUNK_LEAVE: &str = "chunk.leave";
    pub const CHUNK_LOCK: &str = "chunk.lock";
    pub const CHUNK_NEW_PEER: &str = "chunk.new-peer";
    pub const CHUNK_UNLOCK: &str = "chunk.unlock";
    pub const CHUNK_UPDATE: &str = "chunk.update";

    pub const TABLE_PUSH_NEW_CHUNKS: &str = "table.push-new-chunks";
    pub const TABLE_ANNOUNCE_TO_LISTENERS: &str = "table.announce-to-listeners";
    pub const TABLE_ROUTED_INDEX: &str = "table.routed-index";
    pub const TABLE_ROUTED_SPATIAL: &str = "table.routed-spatial";

    pub const RAFT_APPEND_ENTRIES: &str = "consensus.append-entries";
    pub const RAFT_VOTE: &str = "consensus.vote";
    pub const RAFT_QUERY_STATE: &str = "consensus.query-state";
    pub const RAFT_CHUNK_LOCK: &str = "consensus.chunk-lock";
    pub const RAFT_CHUNK_UNLOCK: &str = "consensus.chunk-unlock";
    pub const RAFT_TXN_INFO: &str = "consensus.chunk-transaction-info";
    pub const RAFT_TXN_QUERY: &str = "consensus.chunk-transaction-query";
    pub const RAFT_INSERT: &str = "consensus.insert";
    pub const RAFT_LEAVE: &str = "consensus.leave";
    pub const RAFT_CONNECT: &str = "consensus.connect";

    pub const ACK: &str = "ack";
    pub const DECLINE: &str = "decline";
    pub const INVALID: &str = "invalid";
    pub const REDUNDANT: &str = "redundant";
}

/// Table + chunk addressing shared by all chunk-scoped requests.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkRef {
    pub table: String,
    pub chunk_id: ChunkId,
}

/// Full legacy-chunk state for a joining peer.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkInit {
    pub chunk: ChunkRef,
    pub peers: Vec<PeerId>,
    /// Encoded revisions, entire histories, oldest first per item.
    pub revisions: Vec<Vec<u8>>,
}

/// Replicated log entry kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEntryKind {
    AddPeer { peer: PeerId },
    RemovePeer { peer: PeerId },
    LockRequest { peer: PeerId },
    UnlockRequest {
        peer: PeerId,
        lock_index: u64,
        proceed_commits: bool,
    },
    InsertRevision { revision: Vec<u8> },
    MultiChunkInfo(MultiChunkInfo),
    Other { tag: String },
}

/// One entry of a consensus chunk's replicated log.
///
/// `(sender, serial_id)` makes retried submissions exactly-once.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub sender: PeerId,
    pub serial_id: u64,
    pub kind: LogEntryKind,
}

/// Participants of a multi-chunk commit, replicated into each chunk's log.
#[derive(Clone, Debug, PartialEq)]
pub struct MultiChunkInfo {
    pub transaction_id: Id,
    pub chunks: Vec<ChunkRef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppendEntries {
    pub chunk: ChunkRef,
    pub term: u64,
    pub leader: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub commit_index: u64,
    pub entries: Vec<LogEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendStatus {
    Accepted,
    /// Previous (index, term) did not match; leader must back up.
    PreviousMismatch,
    StaleTerm,
}

/// Log + data snapshot for a peer joining a consensus chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct RaftInit {
    pub chunk: ChunkRef,
    pub term: u64,
    pub commit_index: u64,
    pub peers: Vec<PeerId>,
    pub entries: Vec<LogEntry>,
}

/// Two-phase-commit actions layered over the per-chunk logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnQueryAction {
    ReadyToCommit,
    Commit,
    Abort,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    // Discovery handshake.
    Discovery,
    DiscoveryRemove { peer: PeerId },
    Ready,
    /// Reply to `Discovery`: every peer the responder knows about.
    PeerList { peers: Vec<PeerId> },

    // Legacy chunk swarm.
    ChunkConnect { chunk: ChunkRef },
    ChunkInit(ChunkInit),
    ChunkInsert { chunk: ChunkRef, revision: Vec<u8> },
    ChunkLeave { chunk: ChunkRef },
    ChunkLock { chunk: ChunkRef, attempt_time: LogicalTime },
    ChunkNewPeer { chunk: ChunkRef, peer: PeerId },
    ChunkUnlock { chunk: ChunkRef },
    ChunkUpdate { chunk: ChunkRef, revision: Vec<u8> },

    // Net table.
    PushNewChunks { table: String, chunks: Vec<ChunkId> },
    AnnounceToListeners { table: String },
    RoutedIndex { table: String, blob: Vec<u8> },
    RoutedSpatial { table: String, blob: Vec<u8> },

    // Consensus chunk.
    AppendEntries(AppendEntries),
    Vote {
        chunk: ChunkRef,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    QueryState { chunk: ChunkRef },
    RaftChunkLock { chunk: ChunkRef, serial_id: u64 },
    RaftChunkUnlock {
        chunk: ChunkRef,
        serial_id: u64,
        lock_index: u64,
        proceed_commits: bool,
    },
    RaftTxnInfo {
        chunk: ChunkRef,
        serial_id: u64,
        info: MultiChunkInfo,
    },
    RaftTxnQuery {
        chunk: ChunkRef,
        transaction_id: Id,
        action: TxnQueryAction,
    },
    RaftInsert {
        chunk: ChunkRef,
        serial_id: u64,
        revision: Vec<u8>,
    },
    RaftLeave { chunk: ChunkRef, serial_id: u64 },
    RaftConnect { chunk: ChunkRef },

    // Standard replies.
    Ack,
    Decline { reason: String },
    Invalid,
    Redundant,

    // Typed replies.
    AppendResponse {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
        commit_index: u64,
        status: AppendStatus,
    },
    VoteResponse { term: u64, granted: bool },
    QueryStateResponse {
        term: u64,
        leader: Option<PeerId>,
        last_log_index: u64,
        commit_index: u64,
    },
    /// Reply to consensus chunk requests: the log index the request landed
    /// at, or zero when it was not appended.
    RaftRequestResponse { entry_index: u64 },
    /// Write reached a non-leader; redirect.
    NotLeader { leader: Option<PeerId> },
    RaftConnectResponse(RaftInit),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        use Payload::*;
        match self {
            Discovery => kind::DISCOVERY,
            DiscoveryRemove { .. } => kind::DISCOVERY_REMOVE,
            Ready => kind::READY,
            PeerList { .. } => "discovery.peer-list",
            ChunkConnect { .. } => kind::CHUNK_CONNECT,
            ChunkInit(_) => kind::CHUNK_INIT,
            ChunkInsert { .. } => kind::CHUNK_INSERT,
            ChunkLeave { .. } => kind::CHUNK_LEAVE,
            ChunkLock { .. } => kind::CHUNK_LOCK,
            ChunkNewPeer { .. } => kind::CHUNK_NEW_PEER,
            ChunkUnlock { .. } => kind::CHUNK_UNLOCK,
            ChunkUpdate { .. } => kind::CHUNK_UPDATE,
            PushNewChunks { .. } => kind::TABLE_PUSH_NEW_CHUNKS,
            AnnounceToListeners { .. } => kind::TABLE_ANNOUNCE_TO_LISTENERS,
            RoutedIndex { .. } => kind::TABLE_ROUTED_INDEX,
            RoutedSpatial { .. } => kind::TABLE_ROUTED_SPATIAL,
            AppendEntries(_) => kind::RAFT_APPEND_ENTRIES,
            Vote { .. } => kind::RAFT_VOTE,
            QueryState { .. } => kind::RAFT_QUERY_STATE,
            RaftChunkLock { .. } => kind::RAFT_CHUNK_LOCK,
            RaftChunkUnlock { .. } => kind::RAFT_CHUNK_UNLOCK,
            RaftTxnInfo { .. } => kind::RAFT_TXN_INFO,
            RaftTxnQuery { .. } => kind::RAFT_TXN_QUERY,
            RaftInsert { .. } => kind::RAFT_INSERT,
            RaftLeave { .. } => kind::RAFT_LEAVE,
            RaftConnect { .. } => kind::RAFT_CONNECT,
            Ack => kind::ACK,
            Decline { .. } => kind::DECLINE,
            Invalid => kind::INVALID,
            Redundant => kind::REDUNDANT,
            AppendResponse { .. } => "consensus.append-entries-response",
            VoteResponse { .. } => "consensus.vote-response",
            QueryStateResponse { .. } => "consensus.query-state-response",
            RaftRequestResponse { .. } => "consensus.request-response",
            NotLeader { .. } => "consensus.not-leader",
            RaftConnectResponse(_) => "consensus.connect-response",
        }
    }
}

/// The envelope all inter-peer traffic travels in.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub sender: PeerId,
    pub time: LogicalTime,
    pub payload: Payload,
}

impl Message {
    pub fn new(sender: PeerId, time: LogicalTime, payload: Payload) -> Self {
        Self {
            sender,
            time,
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.payload, Payload::Ack)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message payload malformed: {reason}")]
    Malformed { reason: String },
    #[error("invalid cbor: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error(transparent)]
    InvalidId(#[from] crate::core::identity::InvalidId),
}

// =========================================================================
// Encoding. Tag-prefixed arrays; the writer is a Vec, which cannot fail.
// =========================================================================

type Enc<'a> = Encoder<&'a mut Vec<u8>>;
type EncResult = Result<(), minicbor::encode::Error<std::convert::Infallible>>;

mod tags {
    pub const DISCOVERY: u16 = 0;
    pub const READY: u16 = 1;
    pub const DISCOVERY_REMOVE: u16 = 2;
    pub const PEER_LIST: u16 = 3;
    pub const CHUNK_CONNECT: u16 = 10;
    pub const CHUNK_INIT: u16 = 11;
    pub const CHUNK_INSERT: u16 = 12;
    pub const CHUNK_LEAVE: u16 = 13;
    pub const CHUNK_LOCK: u16 = 14;
    pub const CHUNK_NEW_PEER: u16 = 15;
    pub const CHUNK_UNLOCK: u16 = 16;
    pub const CHUNK_UPDATE: u16 = 17;
    pub const PUSH_NEW_CHUNKS: u16 = 20;
    pub const ANNOUNCE_TO_LISTENERS: u16 = 21;
    pub const ROUTED_INDEX: u16 = 22;
    pub const ROUTED_SPATIAL: u16 = 23;
    pub const APPEND_ENTRIES: u16 = 30;
    pub const VOTE: u16 = 31;
    pub const QUERY_STATE: u16 = 32;
    pub const RAFT_CHUNK_LOCK: u16 = 33;
    pub const RAFT_CHUNK_UNLOCK: u16 = 34;
    pub const RAFT_TXN_INFO: u16 = 35;
    pub const RAFT_TXN_QUERY: u16 = 36;
    pub const RAFT_INSERT: u16 = 37;
    pub const RAFT_LEAVE: u16 = 38;
    pub const RAFT_CONNECT: u16 = 39;
    pub const ACK: u16 = 50;
    pub const DECLINE: u16 = 51;
    pub const INVALID: u16 = 52;
    pub const REDUNDANT: u16 = 53;
    pub const APPEND_RESPONSE: u16 = 60;
    pub const VOTE_RESPONSE: u16 = 61;
    pub const QUERY_STATE_RESPONSE: u16 = 62;
    pub const RAFT_REQUEST_RESPONSE: u16 = 63;
    pub const NOT_LEADER: u16 = 64;
    pub const RAFT_CONNECT_RESPONSE: u16 = 65;
}

fn encode_chunk_ref(e: &mut Enc<'_>, chunk: &ChunkRef) -> EncResult {
    e.array(2)?;
    e.str(&chunk.table)?;
    e.bytes(chunk.chunk_id.id().as_bytes())?;
    Ok(())
}

fn encode_peers(e: &mut Enc<'_>, peers: &[PeerId]) -> EncResult {
    e.array(peers.len() as u64)?;
    for peer in peers {
        e.str(peer.as_str())?;
    }
    Ok(())
}

fn encode_blobs(e: &mut Enc<'_>, blobs: &[Vec<u8>]) -> EncResult {
    e.array(blobs.len() as u64)?;
    for blob in blobs {
        e.bytes(blob)?;
    }
    Ok(())
}

fn encode_log_entry(e: &mut Enc<'_>, entry: &LogEntry) -> EncResult {
    e.array(5)?;
    e.u64(entry.index)?;
    e.u64(entry.term)?;
    e.str(entry.sender.as_str())?;
    e.u64(entry.serial_id)?;
    match &entry.kind {
        LogEntryKind::AddPeer { peer } => {
            e.array(2)?.u8(0)?;
            e.str(peer.as_str())?;
        }
        LogEntryKind::RemovePeer { peer } => {
            e.array(2)?.u8(1)?;
            e.str(peer.as_str())?;
        }
        LogEntryKind::LockRequest { peer } => {
            e.array(2)?.u8(2)?;
            e.str(peer.as_str())?;
        }
        LogEntryKind::UnlockRequest {
            peer,
            lock_index,
            proceed_commits,
        } => {
            e.array(4)?.u8(3)?;
            e.str(peer.as_str())?;
            e.u64(*lock_index)?;
            e.bool(*proceed_commits)?;
        }
        LogEntryKind::InsertRevision { revision } => {
            e.array(2)?.u8(4)?;
            e.bytes(revision)?;
        }
        LogEntryKind::MultiChunkInfo(info) => {
            e.array(2)?.u8(5)?;
            encode_multi_chunk_info(e, info)?;
        }
        LogEntryKind::Other { tag } => {
            e.array(2)?.u8(6)?;
            e.str(tag)?;
        }
    }
    Ok(())
}

fn encode_multi_chunk_info(e: &mut Enc<'_>, info: &MultiChunkInfo) -> EncResult {
    e.array(2)?;
    e.bytes(info.transaction_id.as_bytes())?;
    e.array(info.chunks.len() as u64)?;
    for chunk in &info.chunks {
        encode_chunk_ref(e, chunk)?;
    }
    Ok(())
}

fn encode_payload(e: &mut Enc<'_>, payload: &Payload) -> EncResult {
    use Payload::*;
    match payload {
        Discovery => {
            e.array(1)?.u16(tags::DISCOVERY)?;
        }
        Ready => {
            e.array(1)?.u16(tags::READY)?;
        }
        DiscoveryRemove { peer } => {
            e.array(2)?.u16(tags::DISCOVERY_REMOVE)?;
            e.str(peer.as_str())?;
        }
        PeerList { peers } => {
            e.array(2)?.u16(tags::PEER_LIST)?;
            encode_peers(e, peers)?;
        }
        ChunkConnect { chunk } => {
            e.array(2)?.u16(tags::CHUNK_CONNECT)?;
            encode_chunk_ref(e, chunk)?;
        }
        ChunkInit(init) => {
            e.array(4)?.u16(tags::CHUNK_INIT)?;
            encode_chunk_ref(e, &init.chunk)?;
            encode_peers(e, &init.peers)?;
            encode_blobs(e, &init.revisions)?;
        }
        ChunkInsert { chunk, revision } => {
            e.array(3)?.u16(tags::CHUNK_INSERT)?;
            encode_chunk_ref(e, chunk)?;
            e.bytes(revision)?;
        }
        ChunkLeave { chunk } => {
            e.array(2)?.u16(tags::CHUNK_LEAVE)?;
            encode_chunk_ref(e, chunk)?;
        }
        ChunkLock {
            chunk,
            attempt_time,
        } => {
            e.array(3)?.u16(tags::CHUNK_LOCK)?;
            encode_chunk_ref(e, chunk)?;
            e.u64(attempt_time.serialize())?;
        }
        ChunkNewPeer { chunk, peer } => {
            e.array(3)?.u16(tags::CHUNK_NEW_PEER)?;
            encode_chunk_ref(e, chunk)?;
            e.str(peer.as_str())?;
        }
        ChunkUnlock { chunk } => {
            e.array(2)?.u16(tags::CHUNK_UNLOCK)?;
            encode_chunk_ref(e, chunk)?;
        }
        ChunkUpdate { chunk, revision } => {
            e.array(3)?.u16(tags::CHUNK_UPDATE)?;
            encode_chunk_ref(e, chunk)?;
            e.bytes(revision)?;
        }
        PushNewChunks { table, chunks } => {
            e.array(3)?.u16(tags::PUSH_NEW_CHUNKS)?;
            e.str(table)?;
            e.array(chunks.len() as u64)?;
            for chunk in chunks {
                e.bytes(chunk.id().as_bytes())?;
            }
        }
        AnnounceToListeners { table } => {
            e.array(2)?.u16(tags::ANNOUNCE_TO_LISTENERS)?;
            e.str(table)?;
        }
        RoutedIndex { table, blob } => {
            e.array(3)?.u16(tags::ROUTED_INDEX)?;
            e.str(table)?;
            e.bytes(blob)?;
        }
        RoutedSpatial { table, blob } => {
            e.array(3)?.u16(tags::ROUTED_SPATIAL)?;
            e.str(table)?;
            e.bytes(blob)?;
        }
        AppendEntries(append) => {
            e.array(8)?.u16(tags::APPEND_ENTRIES)?;
            encode_chunk_ref(e, &append.chunk)?;
            e.u64(append.term)?;
            e.str(append.leader.as_str())?;
            e.u64(append.prev_log_index)?;
            e.u64(append.prev_log_term)?;
            e.u64(append.commit_index)?;
            e.array(append.entries.len() as u64)?;
            for entry in &append.entries {
                encode_log_entry(e, entry)?;
            }
        }
        Vote {
            chunk,
            term,
            last_log_index,
            last_log_term,
        } => {
            e.array(5)?.u16(tags::VOTE)?;
            encode_chunk_ref(e, chunk)?;
            e.u64(*term)?;
            e.u64(*last_log_index)?;
            e.u64(*last_log_term)?;
        }
        QueryState { chunk } => {
            e.array(2)?.u16(tags::QUERY_STATE)?;
            encode_chunk_ref(e, chunk)?;
        }
        RaftChunkLock { chunk, serial_id } => {
            e.array(3)?.u16(tags::RAFT_CHUNK_LOCK)?;
            encode_chunk_ref(e, chunk)?;
            e.u64(*serial_id)?;
        }
        RaftChunkUnlock {
            chunk,
            serial_id,
            lock_index,
            proceed_commits,
        } => {
            e.array(5)?.u16(tags::RAFT_CHUNK_UNLOCK)?;
            encode_chunk_ref(e, chunk)?;
            e.u64(*serial_id)?;
            e.u64(*lock_index)?;
            e.bool(*proceed_commits)?;
        }
        RaftTxnInfo {
            chunk,
            serial_id,
            info,
        } => {
            e.array(4)?.u16(tags::RAFT_TXN_INFO)?;
            encode_chunk_ref(e, chunk)?;
            e.u64(*serial_id)?;
            encode_multi_chunk_info(e, info)?;
        }
        RaftTxnQuery {
            chunk,
            transaction_id,
            action,
        } => {
            e.array(4)?.u16(tags::RAFT_TXN_QUERY)?;
            encode_chunk_ref(e, chunk)?;
            e.bytes(transaction_id.as_bytes())?;
            e.u8(match action {
                TxnQueryAction::ReadyToCommit => 0,
                TxnQueryAction::Commit => 1,
                TxnQueryAction::Abort => 2,
            })?;
        }
        RaftInsert {
            chunk,
            serial_id,
            revision,
        } => {
            e.array(4)?.u16(tags::RAFT_INSERT)?;
            encode_chunk_ref(e, chunk)?;
            e.u64(*serial_id)?;
            e.bytes(revision)?;
        }
        RaftLeave { chunk, serial_id } => {
            e.array(3)?.u16(tags::RAFT_LEAVE)?;
            encode_chunk_ref(e, chunk)?;
            e.u64(*serial_id)?;
        }
        RaftConnect { chunk } => {
            e.array(2)?.u16(tags::RAFT_CONNECT)?;
            encode_chunk_ref(e, chunk)?;
        }
        Ack => {
            e.array(1)?.u16(tags::ACK)?;
        }
        Decline { reason } => {
            e.array(2)?.u16(tags::DECLINE)?;
            e.str(reason)?;
        }
        Invalid => {
            e.array(1)?.u16(tags::INVALID)?;
        }
        Redundant => {
            e.array(1)?.u16(tags::REDUNDANT)?;
        }
        AppendResponse {
            term,
            last_log_index,
            last_log_term,
            commit_index,
            status,
        } => {
            e.array(6)?.u16(tags::APPEND_RESPONSE)?;
            e.u64(*term)?;
            e.u64(*last_log_index)?;
            e.u64(*last_log_term)?;
            e.u64(*commit_index)?;
            e.u8(match status {
                AppendStatus::Accepted => 0,
                AppendStatus::PreviousMismatch => 1,
                AppendStatus::StaleTerm => 2,
            })?;
        }
        VoteResponse { term, granted } => {
            e.array(3)?.u16(tags::VOTE_RESPONSE)?;
            e.u64(*term)?;
            e.bool(*granted)?;
        }
        QueryStateResponse {
            term,
            leader,
            last_log_index,
            commit_index,
        } => {
            e.array(5)?.u16(tags::QUERY_STATE_RESPONSE)?;
            e.u64(*term)?;
            match leader {
                Some(peer) => e.str(peer.as_str())?,
                None => e.str("")?,
            };
            e.u64(*last_log_index)?;
            e.u64(*commit_index)?;
        }
        RaftRequestResponse { entry_index } => {
            e.array(2)?.u16(tags::RAFT_REQUEST_RESPONSE)?;
            e.u64(*entry_index)?;
        }
        NotLeader { leader } => {
            e.array(2)?.u16(tags::NOT_LEADER)?;
            match leader {
                Some(peer) => e.str(peer.as_str())?,
                None => e.str("")?,
            };
        }
        RaftConnectResponse(init) => {
            e.array(6)?.u16(tags::RAFT_CONNECT_RESPONSE)?;
            encode_chunk_ref(e, &init.chunk)?;
            e.u64(init.term)?;
            e.u64(init.commit_index)?;
            encode_peers(e, &init.peers)?;
            e.array(init.entries.len() as u64)?;
            for entry in &init.entries {
                encode_log_entry(e, entry)?;
            }
        }
    }
    Ok(())
}

pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    let result: EncResult = (|| {
        e.array(3)?;
        e.str(message.sender.as_str())?;
        e.u64(message.time.serialize())?;
        encode_payload(&mut e, &message.payload)?;
        Ok(())
    })();
    result.expect("encoding to Vec cannot fail");
    buf
}

// =========================================================================
// Decoding.
// =========================================================================

fn expect_array(d: &mut Decoder<'_>, context: &str) -> Result<u64, ProtoError> {
    d.array()?.ok_or_else(|| ProtoError::Malformed {
        reason: format!("indefinite array in {context}"),
    })
}

fn check_len(got: u64, want: u64, context: &str) -> Result<(), ProtoError> {
    if got != want {
        return Err(ProtoError::Malformed {
            reason: format!("{context}: expected {want} elements, got {got}"),
        });
    }
    Ok(())
}

fn decode_peer(d: &mut Decoder<'_>) -> Result<PeerId, ProtoError> {
    Ok(PeerId::parse(d.str()?)?)
}

fn decode_optional_peer(d: &mut Decoder<'_>) -> Result<Option<PeerId>, ProtoError> {
    let raw = d.str()?;
    if raw.is_empty() {
        Ok(None)
    } else {
        Ok(Some(PeerId::parse(raw)?))
    }
}

fn decode_id(d: &mut Decoder<'_>) -> Result<Id, ProtoError> {
    let bytes = d.bytes()?;
    let arr: [u8; 16] = bytes.try_into().map_err(|_| ProtoError::Malformed {
        reason: format!("id must be 16 bytes (got {})", bytes.len()),
    })?;
    Ok(Id::from_bytes(arr))
}

fn decode_chunk_ref(d: &mut Decoder<'_>) -> Result<ChunkRef, ProtoError> {
    let len = expect_array(d, "chunk ref")?;
    check_len(len, 2, "chunk ref")?;
    let table = d.str()?.to_string();
    let chunk_id = ChunkId::from_id(decode_id(d)?);
    Ok(ChunkRef { table, chunk_id })
}

fn decode_peers(d: &mut Decoder<'_>) -> Result<Vec<PeerId>, ProtoError> {
    let len = expect_array(d, "peer list")?;
    let mut peers = Vec::with_capacity(len as usize);
    for _ in 0..len {
        peers.push(decode_peer(d)?);
    }
    Ok(peers)
}

fn decode_blobs(d: &mut Decoder<'_>) -> Result<Vec<Vec<u8>>, ProtoError> {
    let len = expect_array(d, "blob list")?;
    let mut blobs = Vec::with_capacity(len as usize);
    for _ in 0..len {
        blobs.push(d.bytes()?.to_vec());
    }
    Ok(blobs)
}

fn decode_multi_chunk_info(d: &mut Decoder<'_>) -> Result<MultiChunkInfo, ProtoError> {
    let len = expect_array(d, "multi-chunk info")?;
    check_len(len, 2, "multi-chunk info")?;
    let transaction_id = decode_id(d)?;
    let chunk_count = expect_array(d, "multi-chunk info chunks")?;
    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for _ in 0..chunk_count {
        chunks.push(decode_chunk_ref(d)?);
    }
    Ok(MultiChunkInfo {
        transaction_id,
        chunks,
    })
}

fn decode_log_entry(d: &mut Decoder<'_>) -> Result<LogEntry, ProtoError> {
    let len = expect_array(d, "log entry")?;
    check_len(len, 5, "log entry")?;
    let index = d.u64()?;
    let term = d.u64()?;
    let sender = decode_peer(d)?;
    let serial_id = d.u64()?;
    let kind_len = expect_array(d, "log entry kind")?;
    let tag = d.u8()?;
    let kind = match (tag, kind_len) {
        (0, 2) => LogEntryKind::AddPeer {
            peer: decode_peer(d)?,
        },
        (1, 2) => LogEntryKind::RemovePeer {
            peer: decode_peer(d)?,
        },
        (2, 2) => LogEntryKind::LockRequest {
            peer: decode_peer(d)?,
        },
        (3, 4) => LogEntryKind::UnlockRequest {
            peer: decode_peer(d)?,
            lock_index: d.u64()?,
            proceed_commits: d.bool()?,
        },
        (4, 2) => LogEntryKind::InsertRevision {
            revision: d.bytes()?.to_vec(),
        },
        (5, 2) => LogEntryKind::MultiChunkInfo(decode_multi_chunk_info(d)?),
        (6, 2) => LogEntryKind::Other {
            tag: d.str()?.to_string(),
        },
        (tag, len) => {
            return Err(ProtoError::Malformed {
                reason: format!("log entry kind tag {tag} with {len} elements"),
            })
        }
    };
    Ok(LogEntry {
        index,
        term,
        sender,
        serial_id,
        kind,
    })
}

fn decode_log_entries(d: &mut Decoder<'_>) -> Result<Vec<LogEntry>, ProtoError> {
    let len = expect_array(d, "log entries")?;
    let mut entries = Vec::with_capacity(len as usize);
    for _ in 0..len {
        entries.push(decode_log_entry(d)?);
    }
    Ok(entries)
}

fn decode_payload(d: &mut Decoder<'_>) -> Result<Payload, ProtoError> {
    let len = expect_array(d, "payload")?;
    if len == 0 {
        return Err(ProtoError::Malformed {
            reason: "empty payload array".into(),
        });
    }
    let tag = d.u16()?;
    let payload = match tag {
        tags::DISCOVERY => Payload::Discovery,
        tags::READY => Payload::Ready,
        tags::DISCOVERY_REMOVE => Payload::DiscoveryRemove {
            peer: decode_peer(d)?,
        },
        tags::PEER_LIST => Payload::PeerList {
            peers: decode_peers(d)?,
        },
        tags::CHUNK_CONNECT => Payload::ChunkConnect {
            chunk: decode_chunk_ref(d)?,
        },
        tags::CHUNK_INIT => Payload::ChunkInit(ChunkInit {
            chunk: decode_chunk_ref(d)?,
            peers: decode_peers(d)?,
            revisions: decode_blobs(d)?,
        }),
        tags::CHUNK_INSERT => Payload::ChunkInsert {
            chunk: decode_chunk_ref(d)?,
            revision: d.bytes()?.to_vec(),
        },
        tags::CHUNK_LEAVE => Payload::ChunkLeave {
            chunk: decode_chunk_ref(d)?,
        },
        tags::CHUNK_LOCK => Payload::ChunkLock {
            chunk: decode_chunk_ref(d)?,
            attempt_time: LogicalTime::from_serialized(d.u64()?),
        },
        tags::CHUNK_NEW_PEER => Payload::ChunkNewPeer {
            chunk: decode_chunk_ref(d)?,
            peer: decode_peer(d)?,
        },
        tags::CHUNK_UNLOCK => Payload::ChunkUnlock {
            chunk: decode_chunk_ref(d)?,
        },
        tags::CHUNK_UPDATE => Payload::ChunkUpdate {
            chunk: decode_chunk_ref(d)?,
            revision: d.bytes()?.to_vec(),
        },
        tags::PUSH_NEW_CHUNKS => {
            let table = d.str()?.to_string();
            let count = expect_array(d, "pushed chunks")?;
            let mut chunks = Vec::with_capacity(count as usize);
            for _ in 0..count {
                chunks.push(ChunkId::from_id(decode_id(d)?));
            }
            Payload::PushNewChunks { table, chunks }
        }
        tags::ANNOUNCE_TO_LISTENERS => Payload::AnnounceToListeners {
            table: d.str()?.to_string(),
        },
        tags::ROUTED_INDEX => Payload::RoutedIndex {
            table: d.str()?.to_string(),
            blob: d.bytes()?.to_vec(),
        },
        tags::ROUTED_SPATIAL => Payload::RoutedSpatial {
            table: d.str()?.to_string(),
            blob: d.bytes()?.to_vec(),
        },
        tags::APPEND_ENTRIES => Payload::AppendEntries(AppendEntries {
            chunk: decode_chunk_ref(d)?,
            term: d.u64()?,
            leader: decode_peer(d)?,
            prev_log_index: d.u64()?,
            prev_log_term: d.u64()?,
            commit_index: d.u64()?,
            entries: decode_log_entries(d)?,
        }),
        tags::VOTE => Payload::Vote {
            chunk: decode_chunk_ref(d)?,
            term: d.u64()?,
            last_log_index: d.u64()?,
            last_log_term: d.u64()?,
        },
        tags::QUERY_STATE => Payload::QueryState {
            chunk: decode_chunk_ref(d)?,
        },
        tags::RAFT_CHUNK_LOCK => Payload::RaftChunkLock {
            chunk: decode_chunk_ref(d)?,
            serial_id: d.u64()?,
        },
        tags::RAFT_CHUNK_UNLOCK => Payload::RaftChunkUnlock {
            chunk: decode_chunk_ref(d)?,
            serial_id: d.u64()?,
            lock_index: d.u64()?,
            proceed_commits: d.bool()?,
        },
        tags::RAFT_TXN_INFO => Payload::RaftTxnInfo {
            chunk: decode_chunk_ref(d)?,
            serial_id: d.u64()?,
            info: decode_multi_chunk_info(d)?,
        },
        tags::RAFT_TXN_QUERY => {
            let chunk = decode_chunk_ref(d)?;
            let transaction_id = decode_id(d)?;
            let action = match d.u8()? {
                0 => TxnQueryAction::ReadyToCommit,
                1 => TxnQueryAction::Commit,
                2 => TxnQueryAction::Abort,
                other => {
                    return Err(ProtoError::Malformed {
                        reason: format!("unknown txn query action {other}"),
                    })
                }
            };
            Payload::RaftTxnQuery {
                chunk,
                transaction_id,
                action,
            }
        }
        tags::RAFT_INSERT => Payload::RaftInsert {
            chunk: decode_chunk_ref(d)?,
            serial_id: d.u64()?,
            revision: d.bytes()?.to_vec(),
        },
        tags::RAFT_LEAVE => Payload::RaftLeave {
            chunk: decode_chunk_ref(d)?,
            serial_id: d.u64()?,
        },
        tags::RAFT_CONNECT => Payload::RaftConnect {
            chunk: decode_chunk_ref(d)?,
        },
        tags::ACK => Payload::Ack,
        tags::DECLINE => Payload::Decline {
            reason: d.str()?.to_string(),
        },
        tags::INVALID => Payload::Invalid,
        tags::REDUNDANT => Payload::Redundant,
        tags::APPEND_RESPONSE => {
            let term = d.u64()?;
            let last_log_index = d.u64()?;
            let last_log_term = d.u64()?;
            let commit_index = d.u64()?;
            let status = match d.u8()? {
                0 => AppendStatus::Accepted,
                1 => AppendStatus::PreviousMismatch,
                2 => AppendStatus::StaleTerm,
                other => {
                    return Err(ProtoError::Malformed {
                        reason: format!("unknown append status {other}"),
                    })
                }
            };
            Payload::AppendResponse {
                term,
                last_log_index,
                last_log_term,
                commit_index,
                status,
            }
        }
        tags::VOTE_RESPONSE => Payload::VoteResponse {
            term: d.u64()?,
            granted: d.bool()?,
        },
        tags::QUERY_STATE_RESPONSE => Payload::QueryStateResponse {
            term: d.u64()?,
            leader: decode_optional_peer(d)?,
            last_log_index: d.u64()?,
            commit_index: d.u64()?,
        },
        tags::RAFT_REQUEST_RESPONSE => Payload::RaftRequestResponse {
            entry_index: d.u64()?,
        },
        tags::NOT_LEADER => Payload::NotLeader {
            leader: decode_optional_peer(d)?,
        },
        tags::RAFT_CONNECT_RESPONSE => Payload::RaftConnectResponse(RaftInit {
            chunk: decode_chunk_ref(d)?,
            term: d.u64()?,
            commit_index: d.u64()?,
            peers: decode_peers(d)?,
            entries: decode_log_entries(d)?,
        }),
        other => {
            return Err(ProtoError::Malformed {
                reason: format!("unknown payload tag {other}"),
            })
        }
    };
    Ok(payload)
}

pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtoError> {
    let mut d = Decoder::new(bytes);
    let len = expect_array(&mut d, "message")?;
    check_len(len, 3, "message")?;
    let sender = decode_peer(&mut d)?;
    let time = LogicalTime::from_serialized(d.u64()?);
    let payload = decode_payload(&mut d)?;
    Ok(Message {
        sender,
        time,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn round_trip(payload: Payload) -> Payload {
        let message = Message::new(peer("10.0.0.1:4040"), LogicalTime::from_serialized(9), payload);
        let decoded = decode_message(&encode_message(&message)).unwrap();
        assert_eq!(decoded.sender, message.sender);
        assert_eq!(decoded.time, message.time);
        decoded.payload
    }

    fn chunk_ref() -> ChunkRef {
        ChunkRef {
            table: "poses".into(),
            chunk_id: ChunkId::generate("10.0.0.1:4040"),
        }
    }

    #[test]
    fn envelope_round_trip() {
        let payload = round_trip(Payload::ChunkLock {
            chunk: chunk_ref(),
            attempt_time: LogicalTime::from_serialized(77),
        });
        assert!(matches!(payload, Payload::ChunkLock { .. }));
        assert_eq!(payload.kind(), kind::CHUNK_LOCK);
    }

    #[test]
    fn append_entries_round_trip_with_all_entry_kinds() {
        let sender = peer("10.0.0.2:4040");
        let entries = vec![
            LogEntry {
                index: 1,
                term: 1,
                sender: sender.clone(),
                serial_id: 1,
                kind: LogEntryKind::AddPeer {
                    peer: peer("10.0.0.3:4040"),
                },
            },
            LogEntry {
                index: 2,
                term: 1,
                sender: sender.clone(),
                serial_id: 2,
                kind: LogEntryKind::LockRequest {
                    peer: sender.clone(),
                },
            },
            LogEntry {
                index: 3,
                term: 2,
                sender: sender.clone(),
                serial_id: 3,
                kind: LogEntryKind::InsertRevision {
                    revision: vec![1, 2, 3],
                },
            },
            LogEntry {
                index: 4,
                term: 2,
                sender: sender.clone(),
                serial_id: 4,
                kind: LogEntryKind::UnlockRequest {
                    peer: sender.clone(),
                    lock_index: 2,
                    proceed_commits: true,
                },
            },
            LogEntry {
                index: 5,
                term: 2,
                sender: sender.clone(),
                serial_id: 5,
                kind: LogEntryKind::MultiChunkInfo(MultiChunkInfo {
                    transaction_id: Id::generate("10.0.0.2:4040"),
                    chunks: vec![chunk_ref(), chunk_ref()],
                }),
            },
        ];
        let original = AppendEntries {
            chunk: chunk_ref(),
            term: 2,
            leader: sender,
            prev_log_index: 0,
            prev_log_term: 0,
            commit_index: 3,
            entries,
        };
        let payload = round_trip(Payload::AppendEntries(original.clone()));
        match payload {
            Payload::AppendEntries(decoded) => assert_eq!(decoded, original),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn standard_replies_round_trip() {
        assert!(matches!(round_trip(Payload::Ack), Payload::Ack));
        assert!(matches!(round_trip(Payload::Invalid), Payload::Invalid));
        assert!(matches!(round_trip(Payload::Redundant), Payload::Redundant));
        match round_trip(Payload::Decline {
            reason: "not leader".into(),
        }) {
            Payload::Decline { reason } => assert_eq!(reason, "not leader"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn optional_leader_encodes_as_empty() {
        match round_trip(Payload::NotLeader { leader: None }) {
            Payload::NotLeader { leader } => assert!(leader.is_none()),
            other => panic!("unexpected payload {other:?}"),
        }
        match round_trip(Payload::NotLeader {
            leader: Some(peer("10.0.0.9:19")),
        }) {
            Payload::NotLeader { leader } => {
                assert_eq!(leader.unwrap().as_str(), "10.0.0.9:19")
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(3).unwrap();
        e.str("10.0.0.1:4040").unwrap();
        e.u64(1).unwrap();
        e.array(1).unwrap();
        e.u16(9999).unwrap();
        let err = decode_message(&buf).unwrap_err();
        assert!(matches!(err, ProtoError::Malformed { .. }));
    }
}
