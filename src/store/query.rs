//! Read paths. Lookups resolve in a fixed order: reverse index (verified),
//! cache scan, then the file itself (direct mapped slot in disk mode, a
//! positioned read of the last snapshot in RAM mode). Everything returned to
//! callers is an owned copy; nothing hands out references into the cache
//! arrays, which relocate on growth.

use tracing::debug;

use crate::error::{LatticeError, Result};
use crate::record::{local_id, slot_offset, Node, NodeId, NodeType, RECORD_SIZE};

use super::{Lattice, StoreMode};

/// Optional predicates for [`Lattice::find_by_name_filtered`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NameFilters {
    pub min_confidence: Option<f64>,
    pub min_timestamp: Option<u64>,
    pub max_timestamp: Option<u64>,
}

impl NameFilters {
    fn accept(&self, node: &Node) -> bool {
        if let Some(min) = self.min_confidence {
            if node.confidence < min {
                return false;
            }
        }
        if let Some(min) = self.min_timestamp {
            if node.timestamp < min {
                return false;
            }
        }
        if let Some(max) = self.max_timestamp {
            if node.timestamp > max {
                return false;
            }
        }
        true
    }
}

impl Lattice {
    /// Cache position of `id`, if cached. A reverse index hit is only
    /// trusted after confirming the id map agrees; 0 is ambiguous with
    /// "slot 0" by construction.
    pub(crate) fn cache_idx_of(&self, id: NodeId) -> Option<usize> {
        let idx = self.rev.get(local_id(id));
        if idx < self.node_id_map.len() && self.node_id_map[idx] == id {
            return Some(idx);
        }
        self.node_id_map.iter().position(|&x| x == id)
    }

    /// Bring `id` into the cache and return its position. This is the write
    /// side's resolver and the body of `get_copy`.
    pub(crate) fn locate_mut(&mut self, id: NodeId) -> Result<usize> {
        if id == 0 {
            return Err(LatticeError::NullInput);
        }
        if let Some(idx) = self.cache_idx_of(id) {
            self.touch(idx);
            return Ok(idx);
        }

        match self.mode {
            StoreMode::Disk { .. } => {
                // Direct slot first; compaction fallout handled inside.
                let Some(slot) = self.disk_slot_of(id) else {
                    return Err(LatticeError::InvalidNode);
                };
                let data_file = self.file.as_ref().expect("disk mode always has a file");
                let bytes = data_file.slot_bytes(slot).ok_or(LatticeError::InvalidNode)?;
                let mut node = Node::decode(bytes).map_err(|_| LatticeError::Corruption)?;
                if let Some(children) = self.child_index.get(&id) {
                    node.children = children.clone();
                }
                self.make_room()?;
                let idx = self.push_cache(node);
                self.touch(idx);
                Ok(idx)
            }
            StoreMode::Ram => {
                // Only evicted nodes live outside the cache in RAM mode.
                let local = local_id(id);
                if self.evicted.get(&local) != Some(&id) {
                    return Err(LatticeError::InvalidNode);
                }
                let node = self
                    .read_snapshot_node(id)?
                    .ok_or(LatticeError::InvalidNode)?;
                self.make_room()?;
                let idx = self.push_cache(node);
                self.touch(idx);
                self.evicted.remove(&local);
                Ok(idx)
            }
        }
    }

    /// Positioned-read lookup in the last snapshot: the slot at
    /// `local_id - 1` if it still holds the id, otherwise a linear scan
    /// (deletes and eviction reordering shift snapshot slots).
    fn read_snapshot_node(&self, id: NodeId) -> Result<Option<Node>> {
        let Some(data_file) = self.file.as_ref() else {
            return Ok(None);
        };
        let mut buf = [0u8; RECORD_SIZE];

        let direct = local_id(id).saturating_sub(1);
        if direct < self.saved_slots && data_file.read_slot(direct, &mut buf).is_ok() {
            if let Ok(node) = Node::decode(&buf) {
                if node.id == id {
                    return Ok(Some(node));
                }
            }
        }
        for slot in 0..self.saved_slots {
            if data_file.read_slot(slot, &mut buf).is_err() {
                break;
            }
            if let Ok(node) = Node::decode(&buf) {
                if node.id == id {
                    return Ok(Some(node));
                }
            }
        }
        Ok(None)
    }

    /// Owned copy of a node. Never returns references into the store.
    pub fn get_copy(&mut self, id: NodeId) -> Result<Node> {
        let idx = self.locate_mut(id)?;
        Ok(self.nodes[idx].clone())
    }

    /// Read-only variant of [`Lattice::get_copy`]: no cache fill, no access
    /// bump. This is what the isolation layer's readers use.
    pub fn read_copy(&self, id: NodeId) -> Result<Node> {
        if id == 0 {
            return Err(LatticeError::NullInput);
        }
        if let Some(idx) = self.cache_idx_of(id) {
            return Ok(self.nodes[idx].clone());
        }
        match self.mode {
            StoreMode::Disk { .. } => {
                let data_file = self.file.as_ref().expect("disk mode always has a file");
                // No memoization on this path; walk directly.
                let direct = local_id(id).saturating_sub(1);
                if let Some(bytes) = data_file.slot_bytes(direct) {
                    if crate::record::slot_id(bytes) == id {
                        let mut node =
                            Node::decode(bytes).map_err(|_| LatticeError::Corruption)?;
                        if let Some(children) = self.child_index.get(&id) {
                            node.children = children.clone();
                        }
                        return Ok(node);
                    }
                }
                let cap = data_file.slot_capacity()?;
                for slot in 0..self.next_local_id.saturating_sub(1).min(cap) {
                    if let Some(bytes) = data_file.slot_bytes(slot) {
                        if crate::record::slot_id(bytes) == id {
                            let mut node =
                                Node::decode(bytes).map_err(|_| LatticeError::Corruption)?;
                            if let Some(children) = self.child_index.get(&id) {
                                node.children = children.clone();
                            }
                            return Ok(node);
                        }
                    }
                }
                Err(LatticeError::InvalidNode)
            }
            StoreMode::Ram => {
                if self.evicted.get(&local_id(id)) != Some(&id) {
                    return Err(LatticeError::InvalidNode);
                }
                self.read_snapshot_node(id)?.ok_or(LatticeError::InvalidNode)
            }
        }
    }

    /// Does a live node with this id exist anywhere in the store?
    pub fn contains(&self, id: NodeId) -> bool {
        self.read_copy(id).is_ok()
    }

    /// Copy a node's payload into `buf`. Returns `(length, is_binary)`.
    /// Binary payloads come from the envelope; text is copied without its
    /// terminator.
    pub fn get_binary(&mut self, id: NodeId, buf: &mut [u8]) -> Result<(usize, bool)> {
        let idx = self.locate_mut(id)?;
        let node = &self.nodes[idx];
        if let Some((payload, _compressed)) = node.binary_payload() {
            if buf.len() < payload.len() {
                return Err(LatticeError::BufferTooSmall);
            }
            buf[..payload.len()].copy_from_slice(payload);
            Ok((payload.len(), true))
        } else {
            let text = node.text().unwrap_or("");
            if buf.len() < text.len() {
                return Err(LatticeError::BufferTooSmall);
            }
            buf[..text.len()].copy_from_slice(text.as_bytes());
            Ok((text.len(), false))
        }
    }

    pub fn is_binary(&mut self, id: NodeId) -> Result<bool> {
        let idx = self.locate_mut(id)?;
        Ok(self.nodes[idx].is_binary())
    }

    /// Walk every live node: the cache first, then whatever lives only in
    /// the file (uncached mapped slots in disk mode, evicted snapshot slots
    /// in RAM mode). The callback returns false to stop early.
    pub(crate) fn scan_all(&self, mut f: impl FnMut(&Node) -> bool) {
        for node in &self.nodes {
            if !f(node) {
                return;
            }
        }
        match self.mode {
            StoreMode::Disk { .. } => {
                let Some(data_file) = self.file.as_ref() else {
                    return;
                };
                let Ok(cap) = data_file.slot_capacity() else {
                    return;
                };
                for slot in 0..self.next_local_id.saturating_sub(1).min(cap) {
                    let Some(bytes) = data_file.slot_bytes(slot) else {
                        break;
                    };
                    if let Ok(node) = Node::decode(bytes) {
                        if self.cache_idx_of(node.id).is_some() {
                            continue;
                        }
                        if !f(&node) {
                            return;
                        }
                    }
                }
            }
            StoreMode::Ram => {
                if self.evicted.is_empty() {
                    return;
                }
                let Some(data_file) = self.file.as_ref() else {
                    return;
                };
                let mut buf = [0u8; RECORD_SIZE];
                for slot in 0..self.saved_slots {
                    if data_file.read_slot(slot, &mut buf).is_err() {
                        break;
                    }
                    if let Ok(node) = Node::decode(&buf) {
                        if self.evicted.get(&local_id(node.id)) != Some(&node.id) {
                            continue;
                        }
                        if !f(&node) {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// First live node matching name and type exactly, if any.
    pub(crate) fn find_exact(&self, name: &str, kind: NodeType) -> Option<NodeId> {
        let mut found = None;
        self.scan_all(|node| {
            if node.kind == kind && node.name() == name {
                found = Some(node.id);
                false
            } else {
                true
            }
        });
        found
    }

    /// All nodes of a type, up to `max`. Linear over the cache, plus the
    /// mapped region in disk mode (de-duplicated against the cache).
    pub fn find_by_type(&self, kind: NodeType, max: usize) -> Vec<NodeId> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        self.scan_all(|node| {
            if node.kind == kind {
                out.push(node.id);
            }
            out.len() < max
        });
        out
    }

    /// Build the prefix index if a mutation invalidated it (or it was never
    /// built). One O(n) pass over the full store.
    pub fn build_prefix_index(&mut self) {
        if self.prefix.is_built() {
            return;
        }
        let mut records: Vec<(NodeId, String)> = Vec::with_capacity(self.nodes.len());
        self.scan_all(|node| {
            records.push((node.id, node.name().to_owned()));
            true
        });
        self.prefix
            .build(records.iter().map(|(id, name)| (*id, name.as_str())));
        debug!(
            prefixes = self.prefix.prefix_count(),
            ids = self.prefix.total_ids(),
            "prefix index built"
        );
    }

    /// Incrementally index one node, for callers managing the index by hand.
    pub fn add_node_to_prefix_index(&mut self, id: NodeId, name: &str) {
        let cache_len = self.nodes.len();
        self.prefix.add_node(id, name, cache_len);
    }

    /// Find nodes by name or prefix. When `query` is itself a known semantic
    /// prefix the whole bucket is returned without touching a single record;
    /// otherwise bucket candidates get a substring check, and names with no
    /// usable prefix fall back to a linear scan.
    pub fn find_by_name(&mut self, query: &str, max: usize) -> Vec<NodeId> {
        self.find_by_name_filtered(query, &NameFilters::default(), max)
    }

    pub fn find_by_name_filtered(
        &mut self,
        query: &str,
        filters: &NameFilters,
        max: usize,
    ) -> Vec<NodeId> {
        if query.is_empty() || max == 0 {
            return Vec::new();
        }
        self.build_prefix_index();
        self.find_by_name_prebuilt(query, filters, max)
    }

    /// The same query without (re)building the index: used by seqlock
    /// readers, which can't mutate. A stale index degrades to the linear
    /// path.
    pub(crate) fn find_by_name_prebuilt(
        &self,
        query: &str,
        filters: &NameFilters,
        max: usize,
    ) -> Vec<NodeId> {
        if query.is_empty() || max == 0 {
            return Vec::new();
        }
        let unfiltered = filters.min_confidence.is_none()
            && filters.min_timestamp.is_none()
            && filters.max_timestamp.is_none();

        if self.prefix.is_built() {
            // Pure-prefix fast path.
            if let Some(bucket) = self.prefix.bucket(query) {
                let ids: Vec<NodeId> = bucket.to_vec();
                let mut out = Vec::new();
                for id in ids {
                    if unfiltered {
                        if self.contains(id) {
                            out.push(id);
                        }
                    } else if let Ok(node) = self.read_copy(id) {
                        if filters.accept(&node) {
                            out.push(id);
                        }
                    }
                    if out.len() >= max {
                        break;
                    }
                }
                return out;
            }
            if let Some(candidates) = self.prefix.candidates(query) {
                let ids: Vec<NodeId> = candidates.to_vec();
                let mut out = Vec::new();
                for id in ids {
                    if let Ok(node) = self.read_copy(id) {
                        if node.name().contains(query) && filters.accept(&node) {
                            out.push(id);
                        }
                    }
                    if out.len() >= max {
                        break;
                    }
                }
                return out;
            }
        }

        // Linear fallback over the cache.
        let mut out = Vec::new();
        for node in &self.nodes {
            if node.name().contains(query) && filters.accept(node) {
                out.push(node.id);
                if out.len() >= max {
                    break;
                }
            }
        }
        out
    }

    /// Check every prefix bucket against the live store. Mismatches trigger
    /// a rebuild. Returns how many stale entries were found.
    pub fn validate_prefix_indexes(&mut self) -> u32 {
        self.build_prefix_index();
        let mut stale = 0u32;
        for (prefix, ids) in self.prefix.buckets() {
            for &id in ids {
                match self.read_copy(id) {
                    Ok(node) if node.name().starts_with(prefix) => {}
                    _ => stale += 1,
                }
            }
        }
        if stale > 0 {
            debug!(stale, "prefix index stale; rebuilding");
            self.prefix.invalidate();
            self.build_prefix_index();
        }
        stale
    }

    /// Iterate the cached slots as owned copies, with their positions.
    pub fn iter_slots(&self) -> impl Iterator<Item = (usize, Node)> + '_ {
        self.nodes.iter().cloned().enumerate()
    }

    /// Ask the kernel to start faulting in a node's record and its
    /// children's records. Only meaningful in disk mode.
    pub fn prefetch_related(&mut self, id: NodeId) -> Result<()> {
        if !self.is_disk_mode() {
            return Ok(());
        }
        let children = self
            .child_index
            .get(&id)
            .map(|c| c.to_vec())
            .unwrap_or_default();
        let Some(slot) = self.disk_slot_of(id) else {
            return Err(LatticeError::InvalidNode);
        };
        let data_file = self.file.as_ref().expect("disk mode always has a file");
        data_file.prefetch(slot_offset(slot), RECORD_SIZE as u64);
        for child in children {
            let direct = local_id(child).saturating_sub(1);
            data_file.prefetch(slot_offset(direct), RECORD_SIZE as u64);
        }
        Ok(())
    }
}
