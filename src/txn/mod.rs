//! Transactions: snapshot reads, deltas, optimistic commit.

pub mod cache;
pub mod chunk_txn;
pub mod net_table_txn;
pub mod transaction;
pub mod workspace;

pub use cache::{RevisionCodec, TransactionCache};
pub use chunk_txn::{ChunkTransaction, CommitFuture, Conflict, ConflictCondition, Conflicts};
pub use net_table_txn::NetTableTransaction;
pub use transaction::{ConflictMap, ParallelCommit, TableFutures, Transaction};
pub use workspace::Workspace;
