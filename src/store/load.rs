//! Loading, saving and the maintenance passes that rewrite the file.
//!
//! Load never aborts on bad slots. Each slot is validated independently, bad
//! ones are counted and skipped, and a run of ten consecutive invalid slots
//! is taken as the end of live data (pre-allocated files are zero filled
//! past the last write). The summary is logged so the operator knows to run
//! compaction.

use std::io::{BufWriter, Write};

use tracing::{debug, info, warn};

use crate::env;
use crate::error::{LatticeError, Result};
use crate::index::REVERSE_INDEX_CAP_FACTOR;
use crate::record::{local_id, FileHeader, Node, NodeId, SlotError, RECORD_SIZE};

use super::file;
use super::{Lattice, StoreMode};

/// This many invalid slots in a row end the load scan.
const MAX_CONSECUTIVE_INVALID: u32 = 10;

impl Lattice {
    fn local_id_bound(&self) -> u32 {
        (self.max_nodes.saturating_mul(REVERSE_INDEX_CAP_FACTOR)).min(u32::MAX as usize) as u32
    }

    /// Validate a decoded slot beyond what the record codec checks: the
    /// local id must sit inside the sane range unless the record is part of
    /// a chunked aggregate (chunk children legitimately run far past it).
    fn slot_is_sane(&self, node: &Node) -> bool {
        let l = local_id(node.id);
        l != 0 && (l <= self.local_id_bound() || node.name().starts_with("C:"))
    }

    /// RAM mode load: read the snapshot back into the cache arrays.
    pub(super) fn load_ram(&mut self, header: FileHeader) -> Result<()> {
        let data_file = self.file.take().expect("load_ram needs an open file");

        let mut buf = [0u8; RECORD_SIZE];
        let mut consecutive_invalid = 0u32;
        let mut corrupt = 0u32;
        let mut max_local = 0u32;

        for slot in 0..header.nodes_to_load {
            if data_file.read_slot(slot, &mut buf).is_err() {
                // Snapshot is shorter than its header claims. Treat what we
                // have as the whole store.
                warn!(slot, claimed = header.nodes_to_load, "data file ends early");
                break;
            }
            match Node::decode(&buf) {
                Ok(node) if self.slot_is_sane(&node) => {
                    consecutive_invalid = 0;
                    max_local = max_local.max(local_id(node.id));
                    while self.nodes.len() >= self.max_nodes {
                        self.grow_for_load()?;
                    }
                    self.push_cache(node);
                }
                Ok(_) => {
                    corrupt += 1;
                    consecutive_invalid += 1;
                }
                Err(SlotError::Dead) => {
                    consecutive_invalid += 1;
                }
                Err(_) => {
                    corrupt += 1;
                    consecutive_invalid += 1;
                }
            }
            if consecutive_invalid >= MAX_CONSECUTIVE_INVALID {
                debug!(slot, "stopping load after a run of invalid slots");
                break;
            }
        }

        self.file = Some(data_file);
        self.saved_slots = header.nodes_to_load;
        self.live_count = self.nodes.len() as u32;
        self.next_local_id = header.next_local_id.max(max_local + 1).max(1);
        self.corrupt_slots_on_load = corrupt;

        if header.node_count != self.live_count {
            warn!(
                header = header.node_count,
                loaded = self.live_count,
                "header node count disagrees with live records; trusting the records"
            );
        }
        if corrupt > 0 {
            warn!(corrupt, "skipped corrupt slots on load; consider compact_file()");
        }

        self.rebuild_children_from_parents();
        Ok(())
    }

    /// Reconstruct every cached node's child list from parent links. The
    /// persisted children word is meaningless across address spaces and is
    /// never read.
    fn rebuild_children_from_parents(&mut self) {
        let edges: Vec<(NodeId, NodeId)> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id != 0)
            .map(|n| (n.parent_id, n.id))
            .collect();
        for (parent, child) in edges {
            if let Some(idx) = self.cache_idx_of(parent) {
                self.nodes[idx].children.push(child);
            }
        }
    }

    /// Disk mode open: scan the mapping to count live records and build the
    /// parent -> children side index. Nothing is pulled into the cache yet.
    pub(super) fn open_disk(&mut self, header: FileHeader) -> Result<()> {
        let data_file = self.file.as_ref().expect("open_disk needs an open file");
        let cap = data_file.slot_capacity()?;
        let to_scan = header.nodes_to_load.min(cap);

        let mut consecutive_invalid = 0u32;
        let mut corrupt = 0u32;
        let mut max_local = 0u32;
        let mut live = 0u32;
        let mut edges: Vec<(NodeId, NodeId)> = Vec::new();

        for slot in 0..to_scan {
            let Some(bytes) = data_file.slot_bytes(slot) else {
                break;
            };
            match Node::decode(bytes) {
                Ok(node) if self.slot_is_sane(&node) => {
                    consecutive_invalid = 0;
                    live += 1;
                    max_local = max_local.max(local_id(node.id));
                    if node.parent_id != 0 {
                        edges.push((node.parent_id, node.id));
                    }
                }
                Ok(_) => {
                    corrupt += 1;
                    consecutive_invalid += 1;
                }
                Err(SlotError::Dead) => {
                    consecutive_invalid += 1;
                }
                Err(_) => {
                    corrupt += 1;
                    consecutive_invalid += 1;
                }
            }
            if consecutive_invalid >= MAX_CONSECUTIVE_INVALID {
                debug!(slot, "stopping disk scan after a run of invalid slots");
                break;
            }
        }

        for (parent, child) in edges {
            self.child_index.entry(parent).or_default().push(child);
        }
        self.live_count = live;
        self.next_local_id = header.next_local_id.max(max_local + 1).max(1);
        self.corrupt_slots_on_load = corrupt;

        if corrupt > 0 {
            warn!(corrupt, "skipped corrupt slots on open; consider compact_file()");
        }
        Ok(())
    }

    /// RAM mode growth during load ignores the doubling policy and just
    /// keeps doubling until the snapshot fits; the snapshot is the canonical
    /// store, we can't not load it.
    fn grow_for_load(&mut self) -> Result<()> {
        let new_max = self
            .max_nodes
            .checked_mul(2)
            .ok_or(LatticeError::OutOfMemory)?;
        self.max_nodes = new_max;
        self.rev.set_cache_size(new_max);
        Ok(())
    }

    /// Discard all in-memory state and re-read the file. `init` already
    /// loads; this exists for the rare case where another process rewrote
    /// the file while this store sat idle.
    pub fn load(&mut self) -> Result<()> {
        self.nodes.clear();
        self.node_id_map.clear();
        self.last_access.clear();
        self.rev.reset();
        self.prefix.invalidate();
        self.child_index.clear();
        self.evicted.clear();
        self.slot_overrides.clear();
        self.saved_slots = 0;
        self.live_count = 0;
        self.next_local_id = 1;
        self.corrupt_slots_on_load = 0;
        self.dirty = false;

        // Drop the old handle (and mapping) before reopening.
        self.file = None;
        let (mut data_file, header) = file::DataFile::open(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                LatticeError::InvalidMagic
            } else {
                LatticeError::from(e)
            }
        })?;

        match self.mode {
            StoreMode::Ram => {
                self.file = Some(data_file);
                if let Some(header) = header {
                    self.load_ram(header)?;
                }
            }
            StoreMode::Disk { total_file_nodes } => {
                let existing = data_file.slot_capacity()?;
                data_file.map_for_slots(total_file_nodes.max(existing))?;
                self.file = Some(data_file);
                if let Some(header) = header {
                    self.open_disk(header)?;
                }
            }
        }
        Ok(())
    }

    /// Commit the store to disk.
    ///
    /// RAM mode writes an atomic snapshot: `<path>.tmp`, fsync, platform
    /// replace. Disk mode rewrites the header in the mapping and msyncs;
    /// the record writes already went to the mapping.
    pub fn save(&mut self) -> Result<()> {
        match self.mode {
            StoreMode::Ram => self.save_snapshot(),
            StoreMode::Disk { .. } => self.save_disk(),
        }
    }

    fn save_snapshot(&mut self) -> Result<()> {
        // Evicted nodes only exist in the previous snapshot. Carry them
        // forward so replacing the file doesn't lose them.
        let carried = self.read_evicted_nodes()?;
        let total = (self.nodes.len() + carried.len()) as u32;

        let header = FileHeader {
            node_count: total,
            next_local_id: self.next_local_id,
            nodes_to_load: total,
        };

        let tmp = file::write_snapshot(&self.path, |f| {
            let mut w = BufWriter::new(f);
            w.write_all(&header.encode())?;
            let mut buf = [0u8; RECORD_SIZE];
            for node in self.nodes.iter().chain(carried.iter()) {
                node.encode(&mut buf);
                w.write_all(&buf)?;
            }
            w.flush()
        })?;

        self.file
            .as_mut()
            .expect("save needs an open file")
            .replace_with(&tmp)?;

        self.saved_slots = total;
        self.live_count = total;
        self.dirty = false;
        self.ops_since_save = 0;

        if env::verbose() {
            info!(nodes = total, "snapshot saved");
        }
        Ok(())
    }

    /// Read back every evicted node still alive in the previous snapshot.
    pub(super) fn read_evicted_nodes(&self) -> Result<Vec<Node>> {
        if self.evicted.is_empty() {
            return Ok(Vec::new());
        }
        let data_file = self.file.as_ref().expect("read_evicted_nodes needs a file");
        let mut out = Vec::with_capacity(self.evicted.len());
        let mut buf = [0u8; RECORD_SIZE];
        for slot in 0..self.saved_slots {
            if data_file.read_slot(slot, &mut buf).is_err() {
                break;
            }
            if let Ok(node) = Node::decode(&buf) {
                if self.evicted.get(&local_id(node.id)) == Some(&node.id) {
                    out.push(node);
                }
            }
        }
        Ok(out)
    }

    fn save_disk(&mut self) -> Result<()> {
        let header = FileHeader {
            node_count: self.live_count,
            next_local_id: self.next_local_id,
            nodes_to_load: self.next_local_id.saturating_sub(1),
        };
        let data_file = self.file.as_mut().expect("save needs an open file");
        data_file.write_header(&header)?;
        data_file.sync()?;
        self.dirty = false;
        self.ops_since_save = 0;
        Ok(())
    }

    /// Rewrite the file without dead or corrupt slots.
    ///
    /// In RAM mode the snapshot is packed by construction, so this is just a
    /// save. In disk mode live slots are packed into a fresh file, which
    /// breaks the `slot == local_id - 1` alignment; direct-slot lookups
    /// detect the mismatch and fall back to a scan.
    pub fn compact_file(&mut self) -> Result<u32> {
        match self.mode {
            StoreMode::Ram => {
                self.save_snapshot()?;
                Ok(self.live_count)
            }
            StoreMode::Disk { total_file_nodes } => {
                let (packed, next_local_id) = {
                    let data_file = self.file.as_ref().expect("compact needs a file");
                    let cap = data_file.slot_capacity()?;
                    let mut packed: Vec<Vec<u8>> = Vec::new();
                    for slot in 0..self.next_local_id.saturating_sub(1).min(cap) {
                        let Some(bytes) = data_file.slot_bytes(slot) else {
                            break;
                        };
                        if Node::decode(bytes).is_ok() {
                            packed.push(bytes.to_vec());
                        }
                    }
                    (packed, self.next_local_id)
                };

                let header = FileHeader {
                    node_count: packed.len() as u32,
                    next_local_id,
                    nodes_to_load: packed.len() as u32,
                };
                let tmp = file::write_snapshot(&self.path, |f| {
                    let mut w = BufWriter::new(f);
                    w.write_all(&header.encode())?;
                    for bytes in &packed {
                        w.write_all(bytes)?;
                    }
                    w.flush()
                })?;

                let data_file = self.file.as_mut().expect("compact needs a file");
                data_file.replace_with(&tmp)?;
                data_file.map_for_slots(total_file_nodes.max(packed.len() as u32))?;

                // Everything index-shaped referred to the old slot layout.
                self.nodes.clear();
                self.node_id_map.clear();
                self.last_access.clear();
                self.rev.reset();
                self.prefix.invalidate();
                self.child_index.clear();
                self.slot_overrides.clear();
                self.open_disk(header)?;
                self.dirty = false;

                info!(live = self.live_count, "disk store compacted");
                Ok(self.live_count)
            }
        }
    }

    /// Walk every slot, zero the ones that fail validation, and rebuild the
    /// indices. Returns how many slots were repaired.
    pub fn scan_and_repair_corruption(&mut self) -> Result<u32> {
        match self.mode {
            StoreMode::Ram => {
                // Cached records are typed, so they can't be malformed; the
                // repairable state is the index layer.
                self.rev.reset();
                for i in 0..self.nodes.len() {
                    self.rev.set(local_id(self.node_id_map[i]), i);
                }
                self.prefix.invalidate();
                Ok(0)
            }
            StoreMode::Disk { .. } => {
                let mut repaired = 0u32;
                {
                    let data_file = self.file.as_mut().expect("repair needs a file");
                    let cap = data_file.slot_capacity()?;
                    for slot in 0..self.next_local_id.saturating_sub(1).min(cap) {
                        let Some(bytes) = data_file.slot_bytes_mut(slot) else {
                            break;
                        };
                        match Node::decode(bytes) {
                            Ok(_) | Err(SlotError::Dead) => {}
                            Err(_) => {
                                bytes.fill(0);
                                repaired += 1;
                            }
                        }
                    }
                }

                let header = FileHeader {
                    node_count: 0, // recounted by the scan below
                    next_local_id: self.next_local_id,
                    nodes_to_load: self.next_local_id.saturating_sub(1),
                };
                self.nodes.clear();
                self.node_id_map.clear();
                self.last_access.clear();
                self.rev.reset();
                self.prefix.invalidate();
                self.child_index.clear();
                self.slot_overrides.clear();
                self.open_disk(header)?;
                self.save_disk()?;

                if repaired > 0 {
                    warn!(repaired, "zeroed corrupt slots");
                }
                Ok(repaired)
            }
        }
    }
}
