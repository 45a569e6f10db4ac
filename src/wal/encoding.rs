//! Byte level encode/decode for WAL records. Kept separate from the engine so
//! the recovery walker and the append path share exactly one definition of
//! the format.
//!
//! A record is a fixed 21 byte header followed by an opaque payload:
//!
//! ```text
//! u64 sequence | u8 op | u64 node_id | u32 data_size | payload...
//! ```
//!
//! All integers are little endian. A header of 21 zero bytes is the sentinel
//! that terminates the valid region; it can never be confused with a real
//! record because sequence numbers start at 1.

use std::ops::Range;

use num_enum::TryFromPrimitive;

use crate::record::{NodeId, NodeType};

pub const WAL_MAGIC: u32 = 0x5741_4C20; // "WAL "
pub const WAL_VERSION: u32 = 1;

pub const RECORD_HEADER_SIZE: usize = 8 + 1 + 8 + 4;

/// Recovery refuses payloads larger than this; a bigger size field means
/// we're reading garbage.
pub const MAX_PAYLOAD: u32 = 1_048_576;

/// Recovery also refuses sequence numbers that jump more than this far past
/// the header's high-water mark.
pub const MAX_SEQUENCE_JUMP: u64 = 1000;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum WalOp {
    AddNode = 1,
    UpdateNode = 2,
    DeleteNode = 3,
    AddChild = 4,
    Checkpoint = 5,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RecordHeader {
    pub sequence: u64,
    pub op: WalOp,
    pub node_id: NodeId,
    pub data_size: u32,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[8] = self.op as u8;
        buf[9..17].copy_from_slice(&self.node_id.to_le_bytes());
        buf[17..21].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    /// None for the all-zero sentinel, Err for an unknown opcode.
    pub fn decode(buf: &[u8]) -> Result<Option<RecordHeader>, ()> {
        assert!(buf.len() >= RECORD_HEADER_SIZE);
        if buf[..RECORD_HEADER_SIZE].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let op = WalOp::try_from(buf[8]).map_err(|_| ())?;
        Ok(Some(RecordHeader {
            sequence: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            op,
            node_id: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
            data_size: u32::from_le_bytes(buf[17..21].try_into().unwrap()),
        }))
    }
}

// *** The WAL file header (the state ledger) ***

const WO_MAGIC: Range<usize> = 0..4;
const WO_VERSION: Range<usize> = 4..8;
const WO_SEQUENCE: Range<usize> = 8..16;
const WO_CHECKPOINT: Range<usize> = 16..24;
const WO_COMMIT_COUNT: Range<usize> = 24..32;
const WO_LAST_VALID: Range<usize> = 32..40;

pub const WAL_HEADER_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WalHeader {
    /// Highest sequence number ever assigned.
    pub sequence: u64,
    /// Everything at or below this sequence is already applied to the data
    /// file and must be skipped on replay.
    pub checkpoint_sequence: u64,
    /// Durability watermark: how many records have been fsynced.
    pub commit_count: u64,
    /// Byte offset one past the last durable record.
    pub last_valid_offset: u64,
}

impl Default for WalHeader {
    fn default() -> Self {
        WalHeader {
            sequence: 0,
            checkpoint_sequence: 0,
            commit_count: 0,
            last_valid_offset: WAL_HEADER_SIZE as u64,
        }
    }
}

impl WalHeader {
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[WO_MAGIC].copy_from_slice(&WAL_MAGIC.to_le_bytes());
        buf[WO_VERSION].copy_from_slice(&WAL_VERSION.to_le_bytes());
        buf[WO_SEQUENCE].copy_from_slice(&self.sequence.to_le_bytes());
        buf[WO_CHECKPOINT].copy_from_slice(&self.checkpoint_sequence.to_le_bytes());
        buf[WO_COMMIT_COUNT].copy_from_slice(&self.commit_count.to_le_bytes());
        buf[WO_LAST_VALID].copy_from_slice(&self.last_valid_offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<WalHeader> {
        if buf.len() < WAL_HEADER_SIZE {
            return None;
        }
        if u32::from_le_bytes(buf[WO_MAGIC].try_into().unwrap()) != WAL_MAGIC {
            return None;
        }
        if u32::from_le_bytes(buf[WO_VERSION].try_into().unwrap()) != WAL_VERSION {
            return None;
        }
        Some(WalHeader {
            sequence: u64::from_le_bytes(buf[WO_SEQUENCE].try_into().unwrap()),
            checkpoint_sequence: u64::from_le_bytes(buf[WO_CHECKPOINT].try_into().unwrap()),
            commit_count: u64::from_le_bytes(buf[WO_COMMIT_COUNT].try_into().unwrap()),
            last_valid_offset: u64::from_le_bytes(buf[WO_LAST_VALID].try_into().unwrap()),
        })
    }
}

// *** Per-op payloads ***

/// A fully decoded WAL record, ready to replay.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    AddNode {
        node_id: NodeId,
        kind: NodeType,
        name: String,
        /// Raw data region bytes as written: either NUL-terminated text or a
        /// binary envelope. Replay re-runs the envelope heuristic.
        data: Vec<u8>,
        parent_id: NodeId,
    },
    UpdateNode {
        node_id: NodeId,
        data: Vec<u8>,
    },
    DeleteNode {
        node_id: NodeId,
    },
    AddChild {
        parent_id: NodeId,
        child_id: NodeId,
    },
    Checkpoint,
}

/// `ADD_NODE` payload: `type:u8 | name_len:u32 | name | data_len:u32 | data |
/// parent_id:u64`.
pub fn encode_add_node(
    buf: &mut bumpalo::collections::Vec<'_, u8>,
    kind: NodeType,
    name: &str,
    data: &[u8],
    parent_id: NodeId,
) {
    buf.push(kind as u32 as u8);
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(&parent_id.to_le_bytes());
}

/// `ADD_CHILD` payload: `parent_id:u64 | child_id:u64`.
pub fn encode_add_child(
    buf: &mut bumpalo::collections::Vec<'_, u8>,
    parent_id: NodeId,
    child_id: NodeId,
) {
    buf.extend_from_slice(&parent_id.to_le_bytes());
    buf.extend_from_slice(&child_id.to_le_bytes());
}

fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if bytes.len() < n {
        return None;
    }
    let (head, rest) = bytes.split_at(n);
    *bytes = rest;
    Some(head)
}

fn take_u32(bytes: &mut &[u8]) -> Option<u32> {
    take(bytes, 4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn parse_add_node(header: &RecordHeader, mut payload: &[u8]) -> Option<WalRecord> {
    let raw_kind = *take(&mut payload, 1)?.first()?;
    let kind = NodeType::try_from(raw_kind as u32).ok()?;

    let name_len = take_u32(&mut payload)? as usize;
    let name = take(&mut payload, name_len)?;
    let name = std::str::from_utf8(name).ok()?.to_owned();

    let data_len = take_u32(&mut payload)? as usize;
    let data = take(&mut payload, data_len)?.to_vec();

    // Current logs write a u64 parent id; logs from before the id widening
    // carry a u32. Accept both.
    let parent_id = match payload.len() {
        8 => u64::from_le_bytes(payload.try_into().unwrap()),
        4 => u32::from_le_bytes(payload.try_into().unwrap()) as u64,
        _ => return None,
    };

    Some(WalRecord::AddNode {
        node_id: header.node_id,
        kind,
        name,
        data,
        parent_id,
    })
}

fn parse_add_child(payload: &[u8]) -> Option<WalRecord> {
    // u64 pair, or a legacy u32 pair.
    match payload.len() {
        16 => Some(WalRecord::AddChild {
            parent_id: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
            child_id: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
        }),
        8 => Some(WalRecord::AddChild {
            parent_id: u32::from_le_bytes(payload[0..4].try_into().unwrap()) as u64,
            child_id: u32::from_le_bytes(payload[4..8].try_into().unwrap()) as u64,
        }),
        _ => None,
    }
}

/// Decode one record's payload. None means the payload doesn't parse, which
/// recovery treats the same as hitting garbage.
pub fn parse_record(header: &RecordHeader, payload: &[u8]) -> Option<WalRecord> {
    match header.op {
        WalOp::AddNode => parse_add_node(header, payload),
        WalOp::UpdateNode => Some(WalRecord::UpdateNode {
            node_id: header.node_id,
            data: payload.to_vec(),
        }),
        WalOp::DeleteNode => Some(WalRecord::DeleteNode {
            node_id: header.node_id,
        }),
        WalOp::AddChild => parse_add_child(payload),
        WalOp::Checkpoint => Some(WalRecord::Checkpoint),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn header_sentinel_and_roundtrip() {
        let zeros = [0u8; RECORD_HEADER_SIZE];
        assert_eq!(RecordHeader::decode(&zeros), Ok(None));

        let h = RecordHeader {
            sequence: 7,
            op: WalOp::AddNode,
            node_id: 0x1_0000_0002,
            data_size: 99,
        };
        let bytes = h.encode();
        assert_eq!(RecordHeader::decode(&bytes), Ok(Some(h)));

        let mut bad = bytes;
        bad[8] = 0xEE;
        assert_eq!(RecordHeader::decode(&bad), Err(()));
    }

    #[test]
    fn wal_header_roundtrip() {
        let h = WalHeader {
            sequence: 100,
            checkpoint_sequence: 40,
            commit_count: 90,
            last_valid_offset: 4096,
        };
        let bytes = h.encode();
        assert_eq!(WalHeader::decode(&bytes), Some(h));

        let mut bad = bytes;
        bad[0] ^= 0xFF;
        assert_eq!(WalHeader::decode(&bad), None);
    }

    #[test]
    fn add_node_roundtrip() {
        let bump = Bump::new();
        let mut buf = bumpalo::collections::Vec::new_in(&bump);
        encode_add_node(&mut buf, NodeType::Primitive, "ISA_ADD", b"op=+\0", 42);

        let header = RecordHeader {
            sequence: 1,
            op: WalOp::AddNode,
            node_id: 5,
            data_size: buf.len() as u32,
        };
        let rec = parse_record(&header, &buf).unwrap();
        assert_eq!(
            rec,
            WalRecord::AddNode {
                node_id: 5,
                kind: NodeType::Primitive,
                name: "ISA_ADD".into(),
                data: b"op=+\0".to_vec(),
                parent_id: 42,
            }
        );
    }

    #[test]
    fn add_node_accepts_legacy_u32_parent() {
        // Hand-build a payload with a 4 byte parent id.
        let mut payload = Vec::new();
        payload.push(NodeType::Learning as u32 as u8);
        payload.extend_from_slice(&2u32.to_le_bytes());
        payload.extend_from_slice(b"ab");
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.push(b'x');
        payload.extend_from_slice(&7u32.to_le_bytes());

        let header = RecordHeader {
            sequence: 1,
            op: WalOp::AddNode,
            node_id: 9,
            data_size: payload.len() as u32,
        };
        match parse_record(&header, &payload).unwrap() {
            WalRecord::AddNode { parent_id, .. } => assert_eq!(parent_id, 7),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn add_child_both_widths() {
        let bump = Bump::new();
        let mut buf = bumpalo::collections::Vec::new_in(&bump);
        encode_add_child(&mut buf, 10, 20);
        let header = RecordHeader {
            sequence: 1,
            op: WalOp::AddChild,
            node_id: 10,
            data_size: buf.len() as u32,
        };
        assert_eq!(
            parse_record(&header, &buf).unwrap(),
            WalRecord::AddChild { parent_id: 10, child_id: 20 }
        );

        let mut legacy = Vec::new();
        legacy.extend_from_slice(&3u32.to_le_bytes());
        legacy.extend_from_slice(&4u32.to_le_bytes());
        assert_eq!(
            parse_record(&header, &legacy).unwrap(),
            WalRecord::AddChild { parent_id: 3, child_id: 4 }
        );
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let header = RecordHeader {
            sequence: 1,
            op: WalOp::AddNode,
            node_id: 1,
            data_size: 3,
        };
        assert!(parse_record(&header, &[1, 0, 0]).is_none());
    }
}
