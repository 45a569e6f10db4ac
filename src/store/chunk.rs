//! Chunked storage: payloads bigger than one record's 512 byte data region
//! are split across a `ChunkHeader` parent and N `ChunkData` children.
//!
//! The parent's data region holds a fixed metadata blob (total size, chunk
//! count, a CRC-64 of the whole payload, the first chunk's local id) plus,
//! when it fits, the full child id array. Children are written in file order
//! immediately after the parent, which is what makes the fast read path
//! possible: with the first child's local id in hand, reassembly is k
//! sequential slot reads and never touches an index.
//!
//! Each child's envelope starts with its own 10 byte header (chunk index and
//! payload length) so an out-of-order or orphaned chunk is self-describing.

use crc::{Crc, CRC_64_XZ};
use tracing::warn;

use crate::error::{LatticeError, Result};
use crate::record::{local_id, Node, NodeId, NodeType, BINARY_MAX};

use super::mutate::wal_data_bytes;
use super::{Lattice, StoreMode};

/// Payload bytes carried by one chunk child.
pub const CHUNK_PAYLOAD: usize = 500;

/// Per-child header inside the envelope: `chunk_index: u64 | length: u16`.
const CHILD_HEADER: usize = 10;

/// Fixed part of the parent metadata blob:
/// `total_size: u64 | chunk_count: u32 | checksum: u64 | first_chunk_local_id: u32`.
const META_FIXED: usize = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub total_size: u64,
    pub chunk_count: u32,
    pub checksum: u64,
    /// Local id of the first chunk child, or 0 before the children exist.
    pub first_chunk_local_id: u32,
    /// The full child id array, when `24 + 8 * chunk_count` fits the
    /// envelope.
    pub chunk_ids: Option<Vec<NodeId>>,
}

impl ChunkMeta {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_FIXED);
        out.extend_from_slice(&self.total_size.to_le_bytes());
        out.extend_from_slice(&self.chunk_count.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.first_chunk_local_id.to_le_bytes());
        if let Some(ids) = &self.chunk_ids {
            for id in ids {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
        debug_assert!(out.len() <= BINARY_MAX);
        out
    }

    fn decode(payload: &[u8]) -> Option<ChunkMeta> {
        if payload.len() < META_FIXED {
            return None;
        }
        let total_size = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let chunk_count = u32::from_le_bytes(payload[8..12].try_into().unwrap());
        let checksum = u64::from_le_bytes(payload[12..20].try_into().unwrap());
        let first_chunk_local_id = u32::from_le_bytes(payload[20..24].try_into().unwrap());

        let ids_len = payload.len() - META_FIXED;
        let chunk_ids = if ids_len == chunk_count as usize * 8 && chunk_count > 0 {
            Some(
                payload[META_FIXED..]
                    .chunks_exact(8)
                    .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                    .collect(),
            )
        } else {
            None
        };

        Some(ChunkMeta {
            total_size,
            chunk_count,
            checksum,
            first_chunk_local_id,
            chunk_ids,
        })
    }

    fn ids_fit(chunk_count: u32) -> bool {
        META_FIXED + chunk_count as usize * 8 <= BINARY_MAX
    }
}

/// Parse a chunk child's envelope into `(chunk_index, payload)`.
fn parse_child(node: &Node) -> Option<(u64, &[u8])> {
    let (payload, _) = node.binary_payload()?;
    if payload.len() < CHILD_HEADER {
        return None;
    }
    let index = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let length = u16::from_le_bytes(payload[8..10].try_into().unwrap()) as usize;
    if CHILD_HEADER + length > payload.len() {
        return None;
    }
    Some((index, &payload[CHILD_HEADER..CHILD_HEADER + length]))
}

impl Lattice {
    /// Store a payload of any size as a chunked aggregate. Returns the
    /// parent's id; the caller reads it back with [`Lattice::get_chunked`].
    /// `kind` records what the payload logically is; the parent itself is
    /// typed `ChunkHeader`.
    pub fn add_chunked(
        &mut self,
        kind: NodeType,
        name: &str,
        bytes: &[u8],
        parent_id: NodeId,
    ) -> Result<NodeId> {
        let r = self.add_chunked_inner(kind, name, bytes, parent_id);
        self.note_err(r)
    }

    fn add_chunked_inner(
        &mut self,
        kind: NodeType,
        name: &str,
        bytes: &[u8],
        parent_id: NodeId,
    ) -> Result<NodeId> {
        if name.is_empty() || bytes.is_empty() {
            return Err(LatticeError::NullInput);
        }
        let chunk_count = bytes.len().div_ceil(CHUNK_PAYLOAD) as u32;
        let checksum = CRC64.checksum(bytes);

        // Aggregate parents are named under the C: prefix.
        let header_name = if name.starts_with("C:") {
            name.to_owned()
        } else {
            format!("C:{}", name)
        };

        let provisional = ChunkMeta {
            total_size: bytes.len() as u64,
            chunk_count,
            checksum,
            first_chunk_local_id: 0,
            chunk_ids: None,
        };
        let header_id =
            self.add_binary(NodeType::ChunkHeader, &header_name, &provisional.encode(), parent_id)?;

        // The logical payload type rides in the parent's payload region.
        if let Ok(idx) = self.locate_mut(header_id) {
            self.nodes[idx].payload_mut()[0..4].copy_from_slice(&(kind as u32).to_le_bytes());
            self.write_back(idx)?;
        }

        let mut first_chunk_local = 0u32;
        let mut chunk_ids = Vec::with_capacity(chunk_count as usize);
        for (i, piece) in bytes.chunks(CHUNK_PAYLOAD).enumerate() {
            let child_name = format!("C:{}:{}:{}", header_id, i, chunk_count);
            let mut framed = Vec::with_capacity(CHILD_HEADER + piece.len());
            framed.extend_from_slice(&(i as u64).to_le_bytes());
            framed.extend_from_slice(&(piece.len() as u16).to_le_bytes());
            framed.extend_from_slice(piece);

            let child_id = self.add_binary(NodeType::ChunkData, &child_name, &framed, header_id)?;
            if i == 0 {
                first_chunk_local = local_id(child_id);
            }
            chunk_ids.push(child_id);
        }

        // Now that the children exist, fix up the parent metadata.
        let meta = ChunkMeta {
            total_size: bytes.len() as u64,
            chunk_count,
            checksum,
            first_chunk_local_id: first_chunk_local,
            chunk_ids: ChunkMeta::ids_fit(chunk_count).then_some(chunk_ids),
        };
        let idx = self.locate_mut(header_id)?;
        self.nodes[idx]
            .set_binary(&meta.encode(), false)
            .map_err(|_| LatticeError::InvalidNode)?;
        self.write_back(idx)?;
        if let Some(wal) = &self.wal {
            wal.append_update_node(header_id, wal_data_bytes(&self.nodes[idx]))?;
        }
        self.dirty = true;

        Ok(header_id)
    }

    pub fn is_chunked(&self, id: NodeId) -> Result<bool> {
        Ok(self.read_copy(id)?.kind == NodeType::ChunkHeader)
    }

    fn chunk_meta_of(&self, parent: &Node) -> Result<ChunkMeta> {
        if parent.kind != NodeType::ChunkHeader {
            return Err(LatticeError::InvalidNode);
        }
        let (payload, _) = parent.binary_payload().ok_or(LatticeError::Corruption)?;
        ChunkMeta::decode(payload).ok_or(LatticeError::Corruption)
    }

    /// Total payload size of a chunked aggregate, without reading any chunk.
    pub fn get_chunked_size(&self, parent_id: NodeId) -> Result<u64> {
        let parent = self.read_copy(parent_id)?;
        Ok(self.chunk_meta_of(&parent)?.total_size)
    }

    /// Reassemble a chunked payload into a fresh buffer.
    pub fn get_chunked(&mut self, parent_id: NodeId) -> Result<Vec<u8>> {
        let parent = self.get_copy(parent_id)?;
        let meta = self.chunk_meta_of(&parent)?;
        let mut out = vec![0u8; meta.total_size as usize];
        self.reassemble(&parent, &meta, &mut out)?;
        Ok(out)
    }

    /// Reassemble into a caller buffer. Fails with `BufferTooSmall` when the
    /// buffer can't hold the whole payload; returns the payload length.
    pub fn get_chunked_to_buffer(&mut self, parent_id: NodeId, buf: &mut [u8]) -> Result<usize> {
        let parent = self.get_copy(parent_id)?;
        let meta = self.chunk_meta_of(&parent)?;
        if (buf.len() as u64) < meta.total_size {
            return Err(LatticeError::BufferTooSmall);
        }
        let total = meta.total_size as usize;
        self.reassemble(&parent, &meta, &mut buf[..total])?;
        Ok(total)
    }

    /// Copy each chunk's payload into `out` in index order. `out` is exactly
    /// `meta.total_size` long; the final chunk is truncated to fit.
    fn reassemble(&mut self, parent: &Node, meta: &ChunkMeta, out: &mut [u8]) -> Result<()> {
        let chunks = self.resolve_chunks(parent, meta)?;

        for node in &chunks {
            let (index, payload) = parse_child(node).ok_or(LatticeError::Corruption)?;
            let start = index as usize * CHUNK_PAYLOAD;
            if start > out.len() {
                return Err(LatticeError::Corruption);
            }
            let n = payload.len().min(out.len() - start);
            out[start..start + n].copy_from_slice(&payload[..n]);
        }

        if CRC64.checksum(out) != meta.checksum {
            warn!(parent = parent.id, "chunked payload checksum mismatch");
            return Err(LatticeError::Corruption);
        }
        Ok(())
    }

    /// Find the aggregate's chunk records, cheapest path first:
    ///
    /// 1. Disk mode with a recorded first chunk: read `chunk_count` records
    ///    straight off their sequential slots.
    /// 2. The id array, when the parent metadata carried it.
    /// 3. Scan for `C:<parent>:` names and sort by the parsed index.
    fn resolve_chunks(&mut self, parent: &Node, meta: &ChunkMeta) -> Result<Vec<Node>> {
        let count = meta.chunk_count as usize;

        if meta.first_chunk_local_id > 0 && matches!(self.mode, StoreMode::Disk { .. }) {
            if let Some(chunks) = self.chunks_by_slot_run(parent, meta) {
                return Ok(chunks);
            }
            // Sequential slots didn't pan out (compaction, partial write).
            // Fall through.
        }

        if let Some(ids) = &meta.chunk_ids {
            let mut chunks = Vec::with_capacity(count);
            for &id in ids {
                chunks.push(self.read_copy(id)?);
            }
            if chunks.len() == count {
                return Ok(chunks);
            }
        }

        // Last resort: scan by name.
        let wanted = format!("C:{}:", parent.id);
        let mut found: Vec<(u64, Node)> = Vec::new();
        self.scan_all(|node| {
            if node.kind == NodeType::ChunkData && node.name().starts_with(&wanted) {
                if let Some((index, _)) = parse_child(node) {
                    found.push((index, node.clone()));
                }
            }
            found.len() < count
        });
        if found.len() < count {
            return Err(LatticeError::ChunkIncomplete);
        }
        found.sort_by_key(|(index, _)| *index);
        Ok(found.into_iter().map(|(_, node)| node).collect())
    }

    fn chunks_by_slot_run(&self, parent: &Node, meta: &ChunkMeta) -> Option<Vec<Node>> {
        let data_file = self.file.as_ref()?;
        let first_slot = meta.first_chunk_local_id.checked_sub(1)?;
        let wanted = format!("C:{}:", parent.id);

        let mut chunks = Vec::with_capacity(meta.chunk_count as usize);
        for k in 0..meta.chunk_count {
            let bytes = data_file.slot_bytes(first_slot + k)?;
            let node = Node::decode(bytes).ok()?;
            if node.kind != NodeType::ChunkData || !node.name().starts_with(&wanted) {
                return None;
            }
            chunks.push(node);
        }
        Some(chunks)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn meta_roundtrip_without_ids() {
        let meta = ChunkMeta {
            total_size: 1510,
            chunk_count: 4,
            checksum: 0xdead_beef_cafe_f00d,
            first_chunk_local_id: 7,
            chunk_ids: None,
        };
        let bytes = meta.encode();
        assert_eq!(bytes.len(), META_FIXED);
        assert_eq!(ChunkMeta::decode(&bytes), Some(meta));
    }

    #[test]
    fn meta_roundtrip_with_ids() {
        let meta = ChunkMeta {
            total_size: 1000,
            chunk_count: 2,
            checksum: 1,
            first_chunk_local_id: 3,
            chunk_ids: Some(vec![0x1_0000_0003, 0x1_0000_0004]),
        };
        let bytes = meta.encode();
        assert_eq!(ChunkMeta::decode(&bytes), Some(meta));
    }

    #[test]
    fn id_array_fits_up_to_sixty_chunks() {
        // 24 + 8 * 60 = 504 <= 510; one more crosses the envelope limit.
        assert!(ChunkMeta::ids_fit(60));
        assert!(!ChunkMeta::ids_fit(61));
    }

    #[test]
    fn short_meta_is_rejected() {
        assert_eq!(ChunkMeta::decode(&[0u8; 10]), None);
    }
}
