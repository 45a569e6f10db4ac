//! Mutation paths. Every public mutation runs the same gauntlet, in order:
//! admission gate, capacity, slot write, reverse index, parent child append,
//! prefix index, WAL append, auto-save. Failures are mirrored into
//! `last_error` by the public wrappers.

use tracing::debug;

use crate::error::{LatticeError, Result};
use crate::record::{local_id, make_node_id, Node, NodeId, NodeType, DATA_SIZE};

use super::{now_micros, Lattice, StoreMode};

/// The data-region bytes worth logging to the WAL: the envelope for binary
/// payloads, the string plus its terminator for text. Trailing zero fill is
/// never logged.
pub(super) fn wal_data_bytes(node: &Node) -> &[u8] {
    let raw = node.raw_data();
    if let Some((len, _)) = node.detect_envelope() {
        &raw[..2 + len]
    } else {
        let end = raw
            .iter()
            .position(|&b| b == 0)
            .map(|p| p + 1)
            .unwrap_or(DATA_SIZE);
        &raw[..end]
    }
}

impl Lattice {
    // *** Public mutation surface ***

    /// Add a node with a text payload. Returns the new node's id.
    pub fn add(
        &mut self,
        kind: NodeType,
        name: &str,
        text: &str,
        parent_id: NodeId,
    ) -> Result<NodeId> {
        let r = self.add_inner(kind, name, parent_id, |node| {
            node.set_text(text).map_err(|_| LatticeError::InvalidNode)
        });
        self.note_err(r)
    }

    /// Add a node with a binary payload of up to 510 bytes.
    pub fn add_binary(
        &mut self,
        kind: NodeType,
        name: &str,
        bytes: &[u8],
        parent_id: NodeId,
    ) -> Result<NodeId> {
        let r = self.add_inner(kind, name, parent_id, |node| {
            node.set_binary(bytes, false)
                .map_err(|_| LatticeError::InvalidNode)
        });
        self.note_err(r)
    }

    /// Add a node whose payload is already framed (length header first, the
    /// compression bit set by the caller). The envelope is stored unchanged.
    pub fn add_compressed(
        &mut self,
        kind: NodeType,
        name: &str,
        framed: &[u8],
        parent_id: NodeId,
    ) -> Result<NodeId> {
        let r = self.add_inner(kind, name, parent_id, |node| {
            node.set_framed(framed).map_err(|_| LatticeError::InvalidNode)
        });
        self.note_err(r)
    }

    /// Add, unless a node with the same name and type already exists; then
    /// the existing node's confidence and freshness are bumped instead and
    /// its id is returned.
    pub fn add_deduplicated(
        &mut self,
        kind: NodeType,
        name: &str,
        text: &str,
        parent_id: NodeId,
    ) -> Result<NodeId> {
        if let Some(existing) = self.find_exact(name, kind) {
            let r = self.bump_existing(existing);
            return self.note_err(r);
        }
        self.add(kind, name, text, parent_id)
    }

    fn bump_existing(&mut self, id: NodeId) -> Result<NodeId> {
        let idx = self.locate_mut(id)?;
        let node = &mut self.nodes[idx];
        node.confidence = (node.confidence + 0.1).min(1.0);
        node.timestamp = now_micros();
        self.write_back(idx)?;
        if let Some(wal) = &self.wal {
            wal.append_update_node(id, wal_data_bytes(&self.nodes[idx]))?;
        }
        self.dirty = true;
        self.maybe_autosave()?;
        Ok(id)
    }

    /// Overwrite a node's payload with text.
    pub fn update(&mut self, id: NodeId, text: &str) -> Result<()> {
        let r = self.update_inner(id, |node| {
            node.set_text(text).map_err(|_| LatticeError::InvalidNode)
        });
        self.note_err(r)
    }

    /// Overwrite a node's payload with binary bytes.
    pub fn update_binary(&mut self, id: NodeId, bytes: &[u8]) -> Result<()> {
        let r = self.update_inner(id, |node| {
            node.set_binary(bytes, false)
                .map_err(|_| LatticeError::InvalidNode)
        });
        self.note_err(r)
    }

    /// Register `child_id` as a child of `parent_id`. Both must exist. The
    /// edge lives in memory (and the WAL); only the parent's child count is
    /// persisted in the record.
    pub fn add_child(&mut self, parent_id: NodeId, child_id: NodeId) -> Result<()> {
        let r = self.add_child_inner(parent_id, child_id, None);
        self.note_err(r)
    }

    /// Like [`Lattice::add_child`], but also stamps the child's confidence,
    /// treating it as the edge weight.
    pub fn add_child_with_metadata(
        &mut self,
        parent_id: NodeId,
        child_id: NodeId,
        confidence: f64,
    ) -> Result<()> {
        let r = self.add_child_inner(parent_id, child_id, Some(confidence));
        self.note_err(r)
    }

    /// Delete a node. RAM mode compacts the cache; disk mode zeroes the
    /// whole slot in place and leaves the gap.
    pub fn delete(&mut self, id: NodeId) -> Result<()> {
        let r = self.delete_inner(id);
        self.note_err(r)
    }

    // *** Internals ***

    fn add_inner(
        &mut self,
        kind: NodeType,
        name: &str,
        parent_id: NodeId,
        fill: impl FnOnce(&mut Node) -> Result<()>,
    ) -> Result<NodeId> {
        if name.is_empty() {
            return Err(LatticeError::NullInput);
        }

        // The admission gate is machine wide and comes first.
        self.license.admit_one()?;

        if let StoreMode::Disk { total_file_nodes } = self.mode {
            if self.next_local_id > total_file_nodes {
                return Err(LatticeError::CapacityExhausted);
            }
        }
        self.make_room()?;

        let local = self.next_local_id;
        let id = make_node_id(self.device_id, local);
        let mut node = Node::new(id, kind, name, parent_id, now_micros());
        fill(&mut node)?;

        if self.is_disk_mode() {
            let data_file = self.file.as_mut().expect("disk mode always has a file");
            let slot = data_file
                .slot_bytes_mut(local - 1)
                .ok_or(LatticeError::CapacityExhausted)?;
            node.encode(slot);
            data_file.note_write(local);
        }

        self.next_local_id = local + 1;
        self.push_cache(node);

        if parent_id != 0 {
            self.attach_child(parent_id, id);
        }

        self.prefix.add_node(id, name, self.nodes.len());

        if let Some(wal) = &self.wal {
            let idx = self.nodes.len() - 1;
            wal.append_add_node(id, kind, name, wal_data_bytes(&self.nodes[idx]), parent_id)?;
        }

        self.live_count += 1;
        self.dirty = true;
        self.maybe_autosave()?;
        Ok(id)
    }

    fn update_inner(
        &mut self,
        id: NodeId,
        apply: impl FnOnce(&mut Node) -> Result<()>,
    ) -> Result<()> {
        let idx = self.locate_mut(id)?;
        apply(&mut self.nodes[idx])?;
        self.nodes[idx].timestamp = now_micros();
        self.write_back(idx)?;

        if let Some(wal) = &self.wal {
            wal.append_update_node(id, wal_data_bytes(&self.nodes[idx]))?;
        }
        self.dirty = true;
        self.maybe_autosave()?;
        Ok(())
    }

    fn add_child_inner(
        &mut self,
        parent_id: NodeId,
        child_id: NodeId,
        edge_confidence: Option<f64>,
    ) -> Result<()> {
        if parent_id == 0 || child_id == 0 {
            return Err(LatticeError::NullInput);
        }
        // Both ends must resolve before we commit to anything.
        let child_idx = self.locate_mut(child_id)?;
        if let Some(confidence) = edge_confidence {
            self.nodes[child_idx].confidence = confidence.clamp(0.0, 1.0);
            self.write_back(child_idx)?;
        }

        let parent_idx = self.locate_mut(parent_id)?;
        if !self.nodes[parent_idx].children.contains(&child_id) {
            self.nodes[parent_idx].children.push(child_id);
            self.write_back(parent_idx)?;
        }
        if self.is_disk_mode() {
            let children = self.child_index.entry(parent_id).or_default();
            if !children.contains(&child_id) {
                children.push(child_id);
            }
        }

        if let Some(wal) = &self.wal {
            wal.append_add_child(parent_id, child_id)?;
        }
        self.dirty = true;
        self.maybe_autosave()?;
        Ok(())
    }

    pub(super) fn delete_inner(&mut self, id: NodeId) -> Result<()> {
        let idx = self.locate_mut(id)?;
        let local = local_id(id);
        let name = self.nodes[idx].name().to_owned();
        let parent_id = self.nodes[idx].parent_id;

        self.prefix.remove_node(id, &name);
        let _ = self.remove_cache_slot(idx);
        self.evicted.remove(&local);

        if self.is_disk_mode() {
            // Zero the whole slot, not just the id: stale payload bytes in
            // a file that gets shipped around are a leak.
            if let Some(slot) = self.disk_slot_of(id) {
                if let Some(bytes) = self
                    .file
                    .as_mut()
                    .expect("disk mode always has a file")
                    .slot_bytes_mut(slot)
                {
                    bytes.fill(0);
                }
            }
            self.child_index.remove(&id);
            if parent_id != 0 {
                if let Some(children) = self.child_index.get_mut(&parent_id) {
                    children.retain(|c| *c != id);
                }
            }
            self.slot_overrides.remove(&local);
        }

        // Drop the edge from the cached parent too.
        if parent_id != 0 {
            if let Some(pidx) = self.cache_idx_of(parent_id) {
                self.nodes[pidx].children.retain(|c| *c != id);
            }
        }

        if let Some(wal) = &self.wal {
            wal.append_delete_node(id)?;
        }
        self.live_count = self.live_count.saturating_sub(1);
        self.dirty = true;
        self.maybe_autosave()?;
        Ok(())
    }

    /// Best-effort child attach during `add`: a missing parent is logged and
    /// skipped, matching what replay does.
    pub(super) fn attach_child(&mut self, parent_id: NodeId, child_id: NodeId) {
        match self.locate_mut(parent_id) {
            Ok(pidx) => {
                if !self.nodes[pidx].children.contains(&child_id) {
                    self.nodes[pidx].children.push(child_id);
                    let _ = self.write_back(pidx);
                }
                if self.is_disk_mode() {
                    let children = self.child_index.entry(parent_id).or_default();
                    if !children.contains(&child_id) {
                        children.push(child_id);
                    }
                }
            }
            Err(_) => {
                debug!(parent_id, child_id, "parent not found; child added without edge");
            }
        }
    }

    /// Disk mode: push the cached copy at `idx` back into its mapped slot.
    /// RAM mode is a no-op; the cache is canonical there.
    pub(super) fn write_back(&mut self, idx: usize) -> Result<()> {
        if !self.is_disk_mode() {
            return Ok(());
        }
        let id = self.nodes[idx].id;
        let Some(slot) = self.disk_slot_of(id) else {
            return Err(LatticeError::Corruption);
        };
        let node = &self.nodes[idx];
        let data_file = self.file.as_mut().expect("disk mode always has a file");
        let bytes = data_file
            .slot_bytes_mut(slot)
            .ok_or(LatticeError::Corruption)?;
        node.encode(bytes);
        Ok(())
    }

    /// The mapped slot holding `id`. Normally `local_id - 1`; compaction can
    /// shift records, in which case the answer comes from a scan and is
    /// memoized.
    pub(super) fn disk_slot_of(&mut self, id: NodeId) -> Option<u32> {
        let local = local_id(id);
        let data_file = self.file.as_ref()?;

        let direct = local.checked_sub(1)?;
        if let Some(bytes) = data_file.slot_bytes(direct) {
            if crate::record::slot_id(bytes) == id {
                return Some(direct);
            }
        }
        if let Some(&slot) = self.slot_overrides.get(&local) {
            if let Some(bytes) = data_file.slot_bytes(slot) {
                if crate::record::slot_id(bytes) == id {
                    return Some(slot);
                }
            }
        }
        // Compacted file: scan for it and remember the answer.
        let cap = data_file.slot_capacity().ok()?;
        let bound = self.next_local_id.saturating_sub(1).min(cap);
        for slot in 0..bound {
            if let Some(bytes) = data_file.slot_bytes(slot) {
                if crate::record::slot_id(bytes) == id {
                    self.slot_overrides.insert(local, slot);
                    return Some(slot);
                }
            }
        }
        None
    }
}
