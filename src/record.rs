//! Every node in the lattice is stored in a fixed size record, and the record
//! layout is identical on disk and in memory. That's what buys us O(1) slot
//! addressing: the file offset of slot `i` is always
//! `FILE_HEADER_SIZE + i * RECORD_SIZE`.
//!
//! The code to read and write records involves a lot of explicit offsets.
//! This module encapsulates all of that, so the rest of the crate can deal in
//! [`Node`] values and never touch raw byte ranges.
//!
//! Field notes:
//!
//! - `id` is `(device_id << 32) | local_id`. A zero id marks the slot dead.
//! - `data` is either a NUL terminated string or a binary envelope: a little
//!   endian u16 length whose high bit flags external compression, followed by
//!   up to 510 payload bytes. The store never interprets the payload beyond
//!   this envelope.
//! - The children word at [`RO_CHILDREN`] is reserved. It is written as zero
//!   and ignored on read; the in-memory child list is rebuilt from parent
//!   links when a file is loaded.

use std::ops::Range;

use smallvec::SmallVec;

pub const NAME_SIZE: usize = 64;
pub const DATA_SIZE: usize = 512;
pub const PAYLOAD_SIZE: usize = 128;

/// Max payload of a binary envelope: the 512 byte data region minus the
/// 2 byte length header.
pub const BINARY_MAX: usize = DATA_SIZE - 2;

/// High bit of the envelope length header. Set by callers that store
/// externally compressed payloads; the store carries it through untouched.
pub const COMPRESSED_FLAG: u16 = 0x8000;

// "LATT", little endian.
pub const FILE_MAGIC: u32 = 0x4C41_5454;
pub const FILE_HEADER_SIZE: usize = 16;

// Record fields live at fixed offsets.
const RO_ID: Range<usize> = 0..8;
const RO_TYPE: Range<usize> = 8..12;
// 12..16 reserved for flags (an explicit is_binary bit, some day).
const RO_NAME: Range<usize> = 16..80;
const RO_DATA: Range<usize> = 80..592;
const RO_PARENT: Range<usize> = 592..600;
const RO_CHILD_COUNT: Range<usize> = 600..604;
// 604..608 reserved.
const RO_CHILDREN: Range<usize> = 608..616;
const RO_CONFIDENCE: Range<usize> = 616..624;
const RO_TIMESTAMP: Range<usize> = 624..632;
const RO_PAYLOAD: Range<usize> = 632..760;

pub const RECORD_SIZE: usize = 760;
const _: () = assert!(RECORD_SIZE == RO_PAYLOAD.end);

/// Upper bound used by the load-time validator. A live record claiming more
/// children than this is treated as corrupt.
pub const MAX_CHILD_COUNT: u32 = 1000;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum NodeType {
    Primitive = 1,
    Learning = 2,
    Performance = 3,
    CptMetadata = 4,
    ChunkHeader = 5,
    ChunkData = 6,
}

pub struct NodeTypeTryFromError(pub u32);

impl TryFrom<u32> for NodeType {
    type Error = NodeTypeTryFromError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NodeType::Primitive),
            2 => Ok(NodeType::Learning),
            3 => Ok(NodeType::Performance),
            4 => Ok(NodeType::CptMetadata),
            5 => Ok(NodeType::ChunkHeader),
            6 => Ok(NodeType::ChunkData),
            _ => Err(NodeTypeTryFromError(value)),
        }
    }
}

pub fn make_node_id(device_id: u32, local_id: u32) -> NodeId {
    ((device_id as u64) << 32) | local_id as u64
}

pub fn local_id(id: NodeId) -> u32 {
    id as u32
}

pub fn device_id(id: NodeId) -> u32 {
    (id >> 32) as u32
}

/// Why a slot failed to decode. `Dead` is the normal "nothing here" case and
/// is skipped silently; the others are counted as corruption.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotError {
    Dead,
    BadType(u32),
    BadChildCount(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeType,
    name: [u8; NAME_SIZE],
    data: [u8; DATA_SIZE],
    pub parent_id: NodeId,
    /// Rebuilt from parent links on load. Never persisted.
    pub children: SmallVec<[NodeId; 4]>,
    pub confidence: f64,
    /// Microseconds since the unix epoch.
    pub timestamp: u64,
    payload: [u8; PAYLOAD_SIZE],
}

impl Node {
    pub fn new(id: NodeId, kind: NodeType, name: &str, parent_id: NodeId, timestamp: u64) -> Self {
        let mut node = Self {
            id,
            kind,
            name: [0; NAME_SIZE],
            data: [0; DATA_SIZE],
            parent_id,
            children: SmallVec::new(),
            confidence: 1.0,
            timestamp,
            payload: [0; PAYLOAD_SIZE],
        };
        node.set_name(name);
        node
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.fill(0);
        let bytes = name.as_bytes();
        // Names are NUL terminated, so at most NAME_SIZE - 1 bytes survive.
        let len = bytes.len().min(NAME_SIZE - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn set_text(&mut self, text: &str) -> Result<(), ()> {
        let bytes = text.as_bytes();
        if bytes.len() >= DATA_SIZE {
            return Err(());
        }
        self.data.fill(0);
        self.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// The data region as text, if it holds a NUL terminated string.
    pub fn text(&self) -> Option<&str> {
        if self.detect_envelope().is_some() {
            return None;
        }
        let end = self.data.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&self.data[..end]).ok()
    }

    /// Write a binary envelope. `compressed` sets the high bit of the length
    /// header; the payload itself is stored untouched.
    pub fn set_binary(&mut self, bytes: &[u8], compressed: bool) -> Result<(), ()> {
        if bytes.len() > BINARY_MAX {
            return Err(());
        }
        let mut len = bytes.len() as u16;
        if compressed {
            len |= COMPRESSED_FLAG;
        }
        self.data.fill(0);
        self.data[0..2].copy_from_slice(&len.to_le_bytes());
        self.data[2..2 + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Write pre-framed envelope bytes: the caller already prepended the u16
    /// length header (with or without the compression bit).
    pub fn set_framed(&mut self, framed: &[u8]) -> Result<(), ()> {
        if framed.len() < 2 || framed.len() > DATA_SIZE {
            return Err(());
        }
        let len = (u16::from_le_bytes([framed[0], framed[1]]) & !COMPRESSED_FLAG) as usize;
        if len > BINARY_MAX || framed.len() < 2 + len {
            return Err(());
        }
        self.data.fill(0);
        self.data[..framed.len()].copy_from_slice(framed);
        Ok(())
    }

    /// Detect whether the data region holds a binary envelope, returning
    /// `(payload_len, compressed)` when it does.
    ///
    /// The record format carries no explicit binary flag, so this is a
    /// heuristic: the region is binary iff the first two bytes parse as a
    /// plausible length (<= 510 after masking the compression bit) and the
    /// bytes are not a valid NUL terminated string from offset 0. A NUL that
    /// lands strictly inside the envelope payload also marks the region
    /// binary, even when the prefix happens to read as text.
    pub fn detect_envelope(&self) -> Option<(usize, bool)> {
        detect_envelope(&self.data)
    }

    pub fn is_binary(&self) -> bool {
        self.detect_envelope().is_some()
    }

    /// The envelope payload bytes, when the data region is binary.
    pub fn binary_payload(&self) -> Option<(&[u8], bool)> {
        let (len, compressed) = self.detect_envelope()?;
        Some((&self.data[2..2 + len], compressed))
    }

    /// Raw access to the full 512 byte data region.
    pub fn raw_data(&self) -> &[u8; DATA_SIZE] {
        &self.data
    }

    pub fn raw_data_mut(&mut self) -> &mut [u8; DATA_SIZE] {
        &mut self.data
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_SIZE] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8; PAYLOAD_SIZE] {
        &mut self.payload
    }

    /// Serialize into a record slot. `out` must be exactly [`RECORD_SIZE`]
    /// bytes. The reserved children word is always written as zero.
    pub fn encode(&self, out: &mut [u8]) {
        assert_eq!(out.len(), RECORD_SIZE);
        out.fill(0);
        out[RO_ID].copy_from_slice(&self.id.to_le_bytes());
        out[RO_TYPE].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[RO_NAME].copy_from_slice(&self.name);
        out[RO_DATA].copy_from_slice(&self.data);
        out[RO_PARENT].copy_from_slice(&self.parent_id.to_le_bytes());
        out[RO_CHILD_COUNT].copy_from_slice(&(self.children.len() as u32).to_le_bytes());
        out[RO_CONFIDENCE].copy_from_slice(&self.confidence.to_le_bytes());
        out[RO_TIMESTAMP].copy_from_slice(&self.timestamp.to_le_bytes());
        out[RO_PAYLOAD].copy_from_slice(&self.payload);
    }

    /// Decode a record slot. The persisted child count and children word are
    /// ignored; `children` starts empty and is rebuilt by the loader.
    pub fn decode(buf: &[u8]) -> Result<Node, SlotError> {
        assert_eq!(buf.len(), RECORD_SIZE);

        let id = read_u64(buf, RO_ID);
        if id == 0 {
            return Err(SlotError::Dead);
        }

        let raw_type = read_u32(buf, RO_TYPE);
        let kind = NodeType::try_from(raw_type).map_err(|_| SlotError::BadType(raw_type))?;

        let child_count = read_u32(buf, RO_CHILD_COUNT);
        if child_count > MAX_CHILD_COUNT {
            return Err(SlotError::BadChildCount(child_count));
        }

        let mut name = [0u8; NAME_SIZE];
        name.copy_from_slice(&buf[RO_NAME]);
        let mut data = [0u8; DATA_SIZE];
        data.copy_from_slice(&buf[RO_DATA]);
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[RO_PAYLOAD]);

        Ok(Node {
            id,
            kind,
            name,
            data,
            parent_id: read_u64(buf, RO_PARENT),
            children: SmallVec::new(),
            confidence: f64::from_le_bytes(buf[RO_CONFIDENCE].try_into().unwrap()),
            timestamp: read_u64(buf, RO_TIMESTAMP),
            payload,
        })
    }
}

/// Peek at a raw slot without decoding it. Used by the loader to decide
/// whether a slot is live before paying for a full decode.
pub fn slot_id(buf: &[u8]) -> NodeId {
    read_u64(buf, RO_ID)
}

pub fn detect_envelope(data: &[u8; DATA_SIZE]) -> Option<(usize, bool)> {
    let raw = u16::from_le_bytes([data[0], data[1]]);
    let len = (raw & !COMPRESSED_FLAG) as usize;
    if len > BINARY_MAX {
        // Can't be a length header. Definitely text (or garbage).
        return None;
    }
    let compressed = raw & COMPRESSED_FLAG != 0;

    // Is the region a plausible NUL terminated string from offset 0? Note
    // that a short envelope puts a NUL at offset 1 (the length high byte),
    // so a "string" prefix alone proves very little.
    let Some(nul) = data.iter().position(|&b| b == 0) else {
        // No terminator at all. Text always has one.
        return Some((len, compressed));
    };
    if !is_plausible_text(&data[..nul]) {
        return Some((len, compressed));
    }
    // The prefix reads as text. Zero filled text has nothing after its
    // terminator, so any nonzero byte past the first NUL exposes an
    // envelope whose length bytes happened to look printable.
    if data[nul + 1..].iter().any(|&b| b != 0) {
        return Some((len, compressed));
    }
    None
}

/// Valid UTF-8 with no control characters beyond whitespace.
fn is_plausible_text(bytes: &[u8]) -> bool {
    let Ok(s) = std::str::from_utf8(bytes) else {
        return false;
    };
    s.chars().all(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
}

fn read_u32(buf: &[u8], range: Range<usize>) -> u32 {
    u32::from_le_bytes(buf[range].try_into().unwrap())
}

fn read_u64(buf: &[u8], range: Range<usize>) -> u64 {
    u64::from_le_bytes(buf[range].try_into().unwrap())
}

// *** The data file header ***

const HO_MAGIC: Range<usize> = 0..4;
const HO_COUNT: Range<usize> = 4..8;
const HO_NEXT_LOCAL: Range<usize> = 8..12;
const HO_NODES_TO_LOAD: Range<usize> = 12..16;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FileHeader {
    /// Total live records committed to the file.
    pub node_count: u32,
    /// Next local id to assign.
    pub next_local_id: u32,
    /// Record slots to read back on load. In a packed snapshot this equals
    /// `node_count`; in disk mode it's the slot high-water mark, which can be
    /// larger when dead slots are interleaved.
    pub nodes_to_load: u32,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[HO_MAGIC].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        buf[HO_COUNT].copy_from_slice(&self.node_count.to_le_bytes());
        buf[HO_NEXT_LOCAL].copy_from_slice(&self.next_local_id.to_le_bytes());
        buf[HO_NODES_TO_LOAD].copy_from_slice(&self.nodes_to_load.to_le_bytes());
        buf
    }

    /// Returns None when the magic doesn't match.
    pub fn decode(buf: &[u8; FILE_HEADER_SIZE]) -> Option<FileHeader> {
        if read_u32(buf, HO_MAGIC) != FILE_MAGIC {
            return None;
        }
        Some(FileHeader {
            node_count: read_u32(buf, HO_COUNT),
            next_local_id: read_u32(buf, HO_NEXT_LOCAL),
            nodes_to_load: read_u32(buf, HO_NODES_TO_LOAD),
        })
    }
}

/// Byte offset of record slot `index`.
pub fn slot_offset(index: u32) -> u64 {
    FILE_HEADER_SIZE as u64 + index as u64 * RECORD_SIZE as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut node = Node::new(make_node_id(7, 42), NodeType::Primitive, "ISA_ADD", 0, 1234);
        node.set_text("op=+").unwrap();
        node.confidence = 0.5;
        node.children.push(99);

        let mut buf = [0u8; RECORD_SIZE];
        node.encode(&mut buf);

        let back = Node::decode(&buf).unwrap();
        assert_eq!(back.id, make_node_id(7, 42));
        assert_eq!(back.kind, NodeType::Primitive);
        assert_eq!(back.name(), "ISA_ADD");
        assert_eq!(back.text(), Some("op=+"));
        assert_eq!(back.confidence, 0.5);
        assert_eq!(back.timestamp, 1234);
        // Children are never persisted.
        assert!(back.children.is_empty());
    }

    #[test]
    fn dead_and_corrupt_slots() {
        let buf = [0u8; RECORD_SIZE];
        assert_eq!(Node::decode(&buf).unwrap_err(), SlotError::Dead);

        let node = Node::new(1, NodeType::Primitive, "x", 0, 0);
        let mut buf = [0u8; RECORD_SIZE];
        node.encode(&mut buf);
        buf[RO_TYPE].copy_from_slice(&999u32.to_le_bytes());
        assert_eq!(Node::decode(&buf).unwrap_err(), SlotError::BadType(999));

        node.encode(&mut buf);
        buf[RO_CHILD_COUNT].copy_from_slice(&5000u32.to_le_bytes());
        assert_eq!(Node::decode(&buf).unwrap_err(), SlotError::BadChildCount(5000));
    }

    #[test]
    fn binary_envelope_detection() {
        let mut node = Node::new(1, NodeType::Primitive, "x", 0, 0);

        node.set_text("hello world").unwrap();
        assert!(!node.is_binary());
        assert_eq!(node.text(), Some("hello world"));

        node.set_binary(&[0xde, 0xad, 0xbe, 0xef], false).unwrap();
        let (payload, compressed) = node.binary_payload().unwrap();
        assert_eq!(payload, &[0xde, 0xad, 0xbe, 0xef]);
        assert!(!compressed);

        node.set_binary(&[1, 2, 3], true).unwrap();
        let (_, compressed) = node.binary_payload().unwrap();
        assert!(compressed);

        // A short text string whose second byte is large decodes to an
        // implausible length and must stay text.
        node.set_text("AB").unwrap();
        assert!(!node.is_binary());

        // Max payload fits; one more byte doesn't.
        assert!(node.set_binary(&[0u8; BINARY_MAX], false).is_ok());
        assert!(node.set_binary(&[0u8; BINARY_MAX + 1], false).is_err());
    }

    #[test]
    fn name_truncates_at_63_bytes() {
        let long = "N".repeat(200);
        let node = Node::new(1, NodeType::Primitive, &long, 0, 0);
        assert_eq!(node.name().len(), NAME_SIZE - 1);
    }

    #[test]
    fn header_roundtrip() {
        let header = FileHeader {
            node_count: 10,
            next_local_id: 11,
            nodes_to_load: 10,
        };
        let buf = header.encode();
        assert_eq!(FileHeader::decode(&buf), Some(header));
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 0x4C41_5454);

        let garbage = [0xffu8; FILE_HEADER_SIZE];
        assert!(FileHeader::decode(&garbage).is_none());
    }

    #[test]
    fn id_composition() {
        let id = make_node_id(3, 17);
        assert_eq!(id, (3u64 << 32) | 17);
        assert_eq!(local_id(id), 17);
        assert_eq!(device_id(id), 3);
    }
}
