//! Revisions: time-stamped versions of one record.
//!
//! A revision is immutable once visible. Mutation clones the shared handle
//! into a writable draft (`copy_for_write`), edits the draft and submits it
//! through a transaction; concurrent readers keep the original.
//!
//! The trackee map rides inside the revision payload so it survives
//! replication and archiving.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Serialize};

use super::error::{CoreError, TypeMismatch};
use super::identity::{ChunkId, Id, ItemId};
use super::time::LogicalTime;

/// Declared type of one custom field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    UInt64,
    Double,
    String,
    Blob,
    Hash128,
    Time,
}

/// Value of one custom field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    Blob(Vec<u8>),
    Hash128(Id),
    Time(LogicalTime),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Bool,
            Value::Int32(_) => FieldType::Int32,
            Value::Int64(_) => FieldType::Int64,
            Value::UInt64(_) => FieldType::UInt64,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
            Value::Blob(_) => FieldType::Blob,
            Value::Hash128(_) => FieldType::Hash128,
            Value::Time(_) => FieldType::Time,
        }
    }
}

/// Chunks this revision depends on, by table name.
///
/// Ids only, never handles: traversal resolves through the net table, so
/// cyclic dependencies between chunks stay cycle-free in memory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackeeMap {
    inner: BTreeMap<String, BTreeSet<ChunkId>>,
}

impl TrackeeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn chunks_of(&self, table: &str) -> impl Iterator<Item = &ChunkId> {
        self.inner.get(table).into_iter().flatten()
    }

    pub fn tables(&self) -> impl Iterator<Item = (&String, &BTreeSet<ChunkId>)> {
        self.inner.iter()
    }

    pub fn insert(&mut self, table: &str, chunk: ChunkId) -> bool {
        self.inner.entry(table.to_string()).or_default().insert(chunk)
    }

    pub fn contains(&self, table: &str, chunk: &ChunkId) -> bool {
        self.inner
            .get(table)
            .map(|set| set.contains(chunk))
            .unwrap_or(false)
    }

    /// Union-merge; returns whether anything was added.
    pub fn merge(&mut self, other: &TrackeeMap) -> bool {
        let mut changed = false;
        for (table, chunks) in &other.inner {
            let entry = self.inner.entry(table.clone()).or_default();
            for chunk in chunks {
                changed |= entry.insert(*chunk);
            }
        }
        changed
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Field {
    ty: FieldType,
    value: Option<Value>,
}

/// One time-stamped version of a record.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    item_id: ItemId,
    chunk_id: ChunkId,
    insert_time: LogicalTime,
    update_time: LogicalTime,
    removed: bool,
    fields: Vec<Field>,
    trackees: TrackeeMap,
}

/// Shared handle to an immutable revision.
pub type RevisionHandle = Arc<Revision>;

impl Revision {
    /// An empty revision with the given field layout, all values unset.
    /// Tables use this as their structure template.
    pub fn with_layout(field_types: &[FieldType]) -> Self {
        Self {
            item_id: ItemId::from_id(Id::from_bytes([0u8; 16])),
            chunk_id: ChunkId::from_id(Id::from_bytes([0u8; 16])),
            insert_time: LogicalTime::INVALID,
            update_time: LogicalTime::INVALID,
            removed: false,
            fields: field_types
                .iter()
                .map(|&ty| Field { ty, value: None })
                .collect(),
            trackees: TrackeeMap::new(),
        }
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn insert_time(&self) -> LogicalTime {
        self.insert_time
    }

    pub fn update_time(&self) -> LogicalTime {
        self.update_time
    }

    /// Update time if set, else insert time.
    pub fn modification_time(&self) -> LogicalTime {
        if self.update_time.is_valid() {
            self.update_time
        } else {
            self.insert_time
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn trackees(&self) -> &TrackeeMap {
        &self.trackees
    }

    pub fn trackees_mut(&mut self) -> &mut TrackeeMap {
        &mut self.trackees
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn set_item_id(&mut self, id: ItemId) {
        self.item_id = id;
    }

    pub(crate) fn set_chunk_id(&mut self, id: ChunkId) {
        self.chunk_id = id;
    }

    pub(crate) fn set_insert_time(&mut self, time: LogicalTime) {
        self.insert_time = time;
    }

    pub(crate) fn set_update_time(&mut self, time: LogicalTime) {
        self.update_time = time;
    }

    pub(crate) fn set_removed(&mut self) {
        self.removed = true;
    }

    pub fn field_type(&self, index: usize) -> Result<FieldType, CoreError> {
        self.fields
            .get(index)
            .map(|f| f.ty)
            .ok_or(CoreError::NoSuchField {
                index,
                len: self.fields.len(),
            })
    }

    /// Read a field. `None` means the slot is typed but unset.
    pub fn get(&self, index: usize) -> Result<Option<&Value>, CoreError> {
        self.fields
            .get(index)
            .map(|f| f.value.as_ref())
            .ok_or(CoreError::NoSuchField {
                index,
                len: self.fields.len(),
            })
    }

    /// Write a field; the value type must match the slot's declared type.
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), CoreError> {
        let len = self.fields.len();
        let field = self
            .fields
            .get_mut(index)
            .ok_or(CoreError::NoSuchField { index, len })?;
        if field.ty != value.field_type() {
            return Err(TypeMismatch {
                index,
                actual: field.ty,
                requested: value.field_type(),
            }
            .into());
        }
        field.value = Some(value);
        Ok(())
    }

    /// Whether field count and declared types agree with `template`.
    pub fn structure_match(&self, template: &Revision) -> bool {
        self.fields.len() == template.fields.len()
            && self
                .fields
                .iter()
                .zip(&template.fields)
                .all(|(a, b)| a.ty == b.ty)
    }

    /// Whether the value at `index` equals the one in `other`.
    pub fn field_match(&self, other: &Revision, index: usize) -> bool {
        match (self.fields.get(index), other.fields.get(index)) {
            (Some(a), Some(b)) => a.value == b.value,
            _ => false,
        }
    }

    pub fn verify_equal(&self, index: usize, expected: &Value) -> bool {
        matches!(self.get(index), Ok(Some(value)) if value == expected)
    }

    /// Clone into a writable draft; the original stays shared and immutable.
    pub fn copy_for_write(self: &Arc<Self>) -> Revision {
        Revision::clone(self)
    }

    pub fn into_handle(self) -> RevisionHandle {
        Arc::new(self)
    }
}

// =========================================================================
// Wire codec (CBOR). Shared by replication payloads and the table archive.
// =========================================================================

fn encode_value(e: &mut Encoder<&mut Vec<u8>>, value: &Value) {
    let result: Result<_, minicbor::encode::Error<std::convert::Infallible>> = (|| {
        match value {
            Value::Bool(v) => e.bool(*v)?,
            Value::Int32(v) => e.i32(*v)?,
            Value::Int64(v) => e.i64(*v)?,
            Value::UInt64(v) => e.u64(*v)?,
            Value::Double(v) => e.f64(*v)?,
            Value::String(v) => e.str(v)?,
            Value::Blob(v) => e.bytes(v)?,
            Value::Hash128(v) => e.bytes(v.as_bytes())?,
            Value::Time(v) => e.u64((*v).serialize())?,
        };
        Ok(())
    })();
    result.expect("encoding to Vec cannot fail");
}

fn field_type_tag(ty: FieldType) -> u8 {
    match ty {
        FieldType::Bool => 0,
        FieldType::Int32 => 1,
        FieldType::Int64 => 2,
        FieldType::UInt64 => 3,
        FieldType::Double => 4,
        FieldType::String => 5,
        FieldType::Blob => 6,
        FieldType::Hash128 => 7,
        FieldType::Time => 8,
    }
}

fn field_type_from_tag(tag: u8) -> Result<FieldType, RevisionDecodeError> {
    Ok(match tag {
        0 => FieldType::Bool,
        1 => FieldType::Int32,
        2 => FieldType::Int64,
        3 => FieldType::UInt64,
        4 => FieldType::Double,
        5 => FieldType::String,
        6 => FieldType::Blob,
        7 => FieldType::Hash128,
        8 => FieldType::Time,
        other => {
            return Err(RevisionDecodeError::Malformed {
                reason: format!("unknown field type tag {other}"),
            })
        }
    })
}

/// Revision payload parse failure. Logged and declined at RPC boundaries.
#[derive(Debug, thiserror::Error)]
pub enum RevisionDecodeError {
    #[error("revision payload malformed: {reason}")]
    Malformed { reason: String },
    #[error("revision payload truncated or invalid cbor: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

/// Serialize a revision with its full field list, timestamps, chunk id and
/// trackee map.
pub fn encode_revision(revision: &Revision) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    let result: Result<_, minicbor::encode::Error<std::convert::Infallible>> = (|| {
        e.array(7)?;
        e.bytes(revision.item_id.id().as_bytes())?;
        e.bytes(revision.chunk_id.id().as_bytes())?;
        e.u64(revision.insert_time.serialize())?;
        e.u64(revision.update_time.serialize())?;
        e.bool(revision.removed)?;
        e.array(revision.fields.len() as u64)?;
        for field in &revision.fields {
            match &field.value {
                Some(value) => {
                    e.array(2)?;
                    e.u8(field_type_tag(field.ty))?;
                    encode_value(&mut e, value);
                }
                None => {
                    e.array(1)?;
                    e.u8(field_type_tag(field.ty))?;
                }
            }
        }
        e.map(revision.trackees.inner.len() as u64)?;
        for (table, chunks) in &revision.trackees.inner {
            e.str(table)?;
            e.array(chunks.len() as u64)?;
            for chunk in chunks {
                e.bytes(chunk.id().as_bytes())?;
            }
        }
        Ok(())
    })();
    result.expect("encoding to Vec cannot fail");
    buf
}

fn decode_id_bytes(d: &mut Decoder<'_>) -> Result<Id, RevisionDecodeError> {
    let bytes = d.bytes()?;
    let arr: [u8; 16] = bytes.try_into().map_err(|_| RevisionDecodeError::Malformed {
        reason: format!("id must be 16 bytes (got {})", bytes.len()),
    })?;
    Ok(Id::from_bytes(arr))
}

fn decode_value(d: &mut Decoder<'_>, ty: FieldType) -> Result<Value, RevisionDecodeError> {
    Ok(match ty {
        FieldType::Bool => Value::Bool(d.bool()?),
        FieldType::Int32 => Value::Int32(d.i32()?),
        FieldType::Int64 => Value::Int64(d.i64()?),
        FieldType::UInt64 => Value::UInt64(d.u64()?),
        FieldType::Double => Value::Double(d.f64()?),
        FieldType::String => Value::String(d.str()?.to_string()),
        FieldType::Blob => Value::Blob(d.bytes()?.to_vec()),
        FieldType::Hash128 => Value::Hash128(decode_id_bytes(d)?),
        FieldType::Time => Value::Time(LogicalTime::from_serialized(d.u64()?)),
    })
}

/// Parse a revision payload produced by [`encode_revision`].
pub fn decode_revision(payload: &[u8]) -> Result<Revision, RevisionDecodeError> {
    let mut d = Decoder::new(payload);
    let len = d.array()?;
    if len != Some(7) {
        return Err(RevisionDecodeError::Malformed {
            reason: format!("expected 7-element array, got {len:?}"),
        });
    }
    let item_id = ItemId::from_id(decode_id_bytes(&mut d)?);
    let chunk_id = ChunkId::from_id(decode_id_bytes(&mut d)?);
    let insert_time = LogicalTime::from_serialized(d.u64()?);
    let update_time = LogicalTime::from_serialized(d.u64()?);
    let removed = d.bool()?;

    let field_count = d.array()?.ok_or_else(|| RevisionDecodeError::Malformed {
        reason: "indefinite field array".into(),
    })?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let entry_len = d.array()?;
        let ty = field_type_from_tag(d.u8()?)?;
        let value = match entry_len {
            Some(1) => None,
            Some(2) => Some(decode_value(&mut d, ty)?),
            other => {
                return Err(RevisionDecodeError::Malformed {
                    reason: format!("field entry must have 1 or 2 elements, got {other:?}"),
                })
            }
        };
        fields.push(Field { ty, value });
    }

    let trackee_count = d.map()?.ok_or_else(|| RevisionDecodeError::Malformed {
        reason: "indefinite trackee map".into(),
    })?;
    let mut trackees = TrackeeMap::new();
    for _ in 0..trackee_count {
        let table = d.str()?.to_string();
        let chunk_count = d.array()?.ok_or_else(|| RevisionDecodeError::Malformed {
            reason: "indefinite trackee chunk array".into(),
        })?;
        let entry = trackees.inner.entry(table).or_default();
        for _ in 0..chunk_count {
            entry.insert(ChunkId::from_id(decode_id_bytes(&mut d)?));
        }
    }

    if d.position() != payload.len() {
        return Err(RevisionDecodeError::Malformed {
            reason: "trailing bytes after revision".into(),
        });
    }

    Ok(Revision {
        item_id,
        chunk_id,
        insert_time,
        update_time,
        removed,
        fields,
        trackees,
    })
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Revision(item {}, chunk {}, inserted {}, updated {}, {} fields{})",
            self.item_id,
            self.chunk_id,
            self.insert_time,
            self.update_time,
            self.fields.len(),
            if self.removed { ", removed" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_revision() -> Revision {
        let mut rev = Revision::with_layout(&[
            FieldType::Int32,
            FieldType::String,
            FieldType::Blob,
            FieldType::Time,
        ]);
        rev.set_item_id(ItemId::generate("t:1"));
        rev.set_chunk_id(ChunkId::generate("t:1"));
        rev.set_insert_time(LogicalTime::from_serialized(3));
        rev.set_update_time(LogicalTime::from_serialized(9));
        rev.set(0, Value::Int32(42)).unwrap();
        rev.set(1, Value::String("pose".into())).unwrap();
        rev.set(3, Value::Time(LogicalTime::from_serialized(7)))
            .unwrap();
        rev.trackees_mut().insert("poses", ChunkId::generate("t:1"));
        rev
    }

    #[test]
    fn set_rejects_type_mismatch() {
        let mut rev = Revision::with_layout(&[FieldType::Int32]);
        let err = rev.set(0, Value::String("nope".into())).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch(_)));
    }

    #[test]
    fn set_rejects_out_of_range_index() {
        let mut rev = Revision::with_layout(&[FieldType::Int32]);
        assert!(matches!(
            rev.set(3, Value::Int32(1)),
            Err(CoreError::NoSuchField { index: 3, len: 1 })
        ));
    }

    #[test]
    fn structure_match_compares_layout_only() {
        let template = Revision::with_layout(&[FieldType::Int32, FieldType::String]);
        let mut rev = Revision::with_layout(&[FieldType::Int32, FieldType::String]);
        rev.set(0, Value::Int32(5)).unwrap();
        assert!(rev.structure_match(&template));

        let other = Revision::with_layout(&[FieldType::Int64, FieldType::String]);
        assert!(!other.structure_match(&template));
        let shorter = Revision::with_layout(&[FieldType::Int32]);
        assert!(!shorter.structure_match(&template));
    }

    #[test]
    fn copy_for_write_leaves_original_untouched() {
        let handle = sample_revision().into_handle();
        let mut draft = handle.copy_for_write();
        draft.set(0, Value::Int32(21)).unwrap();
        assert_eq!(handle.get(0).unwrap(), Some(&Value::Int32(42)));
        assert_eq!(draft.get(0).unwrap(), Some(&Value::Int32(21)));
    }

    #[test]
    fn codec_round_trip_preserves_everything() {
        let rev = sample_revision();
        let decoded = decode_revision(&encode_revision(&rev)).unwrap();
        assert_eq!(rev, decoded);
    }

    #[test]
    fn codec_round_trip_with_unset_fields_and_removed() {
        let mut rev = Revision::with_layout(&[FieldType::Double, FieldType::Hash128]);
        rev.set_item_id(ItemId::generate("t:1"));
        rev.set_chunk_id(ChunkId::generate("t:1"));
        rev.set_insert_time(LogicalTime::from_serialized(1));
        rev.set_update_time(LogicalTime::from_serialized(2));
        rev.set_removed();
        let decoded = decode_revision(&encode_revision(&rev)).unwrap();
        assert_eq!(rev, decoded);
        assert!(decoded.is_removed());
        assert_eq!(decoded.get(0).unwrap(), None);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let bytes = encode_revision(&sample_revision());
        assert!(decode_revision(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn trackee_merge_reports_change() {
        let mut a = TrackeeMap::new();
        let chunk = ChunkId::generate("t:1");
        assert!(a.insert("poses", chunk));
        let mut b = TrackeeMap::new();
        assert!(b.merge(&a));
        assert!(!b.merge(&a), "second merge adds nothing");
        assert!(b.contains("poses", &chunk));
    }

    #[test]
    fn modification_time_prefers_update() {
        let mut rev = Revision::with_layout(&[]);
        rev.set_insert_time(LogicalTime::from_serialized(4));
        assert_eq!(rev.modification_time().serialize(), 4);
        rev.set_update_time(LogicalTime::from_serialized(6));
        assert_eq!(rev.modification_time().serialize(), 6);
    }
}
