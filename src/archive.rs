//! Per-table archives.
//!
//! A gzip-compressed stream of `4-byte LE revision count`, then per
//! revision `varint length | revision payload`. Reload recreates chunks
//! from the chunk ids the stored revisions declare and synchronizes the
//! logical clock past every restored timestamp.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::core::identity::ChunkId;
use crate::core::revision::{decode_revision, encode_revision, Revision, RevisionDecodeError};
use crate::core::time::{LogicalClock, LogicalTime};
use crate::table::NetTable;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive truncated: {context}")]
    Truncated { context: &'static str },
    #[error("archive holds undecodable revision: {0}")]
    Revision(#[from] RevisionDecodeError),
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

fn read_varint(bytes: &[u8], offset: &mut usize) -> Result<u64, ArchiveError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*offset).ok_or(ArchiveError::Truncated {
            context: "varint",
        })?;
        *offset += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(ArchiveError::Truncated {
                context: "varint overlong",
            });
        }
    }
}

pub struct TableArchive {
    path: PathBuf,
}

impl TableArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store the table's state visible at `time`: the latest revision of
    /// every item across all locally held chunks, removed items included.
    /// Returns the number of revisions written.
    pub fn store(&self, table: &NetTable, time: LogicalTime) -> Result<usize, ArchiveError> {
        let mut revisions = Vec::new();
        for chunk in table.active_chunks() {
            chunk.with_data(|data| {
                for (id, _) in data.latest_update_times() {
                    if let Some(revision) = data.get_by_id(&id, time) {
                        revisions.push(encode_revision(&revision));
                    }
                }
            });
        }

        let mut body = Vec::new();
        body.extend_from_slice(&(revisions.len() as u32).to_le_bytes());
        for payload in &revisions {
            write_varint(&mut body, payload.len() as u64);
            body.extend_from_slice(payload);
        }

        let file = File::create(&self.path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&body)?;
        encoder.finish()?;
        Ok(revisions.len())
    }

    /// Recreate chunks from their declared ids and install the stored
    /// revisions with their original timestamps. Returns the number of
    /// revisions restored.
    pub fn restore(
        &self,
        table: &NetTable,
        clock: &LogicalClock,
    ) -> Result<usize, ArchiveError> {
        let file = File::open(&self.path)?;
        let mut decoder = GzDecoder::new(file);
        let mut body = Vec::new();
        decoder.read_to_end(&mut body)?;

        if body.len() < 4 {
            return Err(ArchiveError::Truncated { context: "count" });
        }
        let count = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let mut offset = 4usize;

        let mut by_chunk: BTreeMap<ChunkId, Vec<Revision>> = BTreeMap::new();
        let mut max_time = LogicalTime::INVALID;
        for _ in 0..count {
            let length = read_varint(&body, &mut offset)? as usize;
            let end = offset
                .checked_add(length)
                .filter(|end| *end <= body.len())
                .ok_or(ArchiveError::Truncated { context: "payload" })?;
            let revision = decode_revision(&body[offset..end])?;
            offset = end;
            if revision.update_time() > max_time {
                max_time = revision.update_time();
            }
            by_chunk.entry(revision.chunk_id()).or_default().push(revision);
        }

        let mut restored = 0usize;
        for (chunk_id, revisions) in by_chunk {
            let chunk = match table.local_chunk(&chunk_id) {
                Some(chunk) => chunk,
                None => table.new_chunk(chunk_id),
            };
            for revision in revisions {
                chunk.restore_local(revision);
                restored += 1;
            }
        }
        clock.synchronize(max_time);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut offset = 0;
            assert_eq!(read_varint(&buf, &mut offset).unwrap(), value);
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn varint_rejects_truncation() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 100_000);
        buf.pop();
        let mut offset = 0;
        assert!(read_varint(&buf, &mut offset).is_err());
    }
}
