//! Core capability errors (typing, structure, state machines).
//!
//! These are bounded and stable: they represent domain/refusal states, not
//! library implementation details. Integrity violations (duplicate update
//! time for one item, chunk id changed after insert) are not errors — they
//! abort the process, because continuing would corrupt replicated state.

use thiserror::Error;

use super::identity::{ChunkId, ItemId};
use super::revision::FieldType;
use super::time::LogicalTime;

/// Field access with the wrong static type.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("field {index} holds {actual:?}, requested {requested:?}")]
pub struct TypeMismatch {
    pub index: usize,
    pub actual: FieldType,
    pub requested: FieldType,
}

/// Revision does not agree with the table template.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("revision structure does not match table `{table}`: {reason}")]
pub struct StructureMismatch {
    pub table: String,
    pub reason: String,
}

/// State-machine violation, e.g. unlocking a chunk that is not locked.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid state in {context}: {reason}")]
pub struct InvalidState {
    pub context: &'static str,
    pub reason: String,
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),
    #[error(transparent)]
    StructureMismatch(#[from] StructureMismatch),
    #[error(transparent)]
    InvalidState(#[from] InvalidState),
    #[error("item {item} already present in container")]
    DuplicateInsert { item: ItemId },
    #[error("item {item} not present at time {time}")]
    NoSuchItem { item: ItemId, time: LogicalTime },
    #[error("chunk {chunk} not held locally")]
    NoSuchChunk { chunk: ChunkId },
    #[error("field index {index} out of range (template has {len} fields)")]
    NoSuchField { index: usize, len: usize },
}
