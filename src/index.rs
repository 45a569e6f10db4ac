//! The two index layers that sit beside the node array.
//!
//! The reverse index is a dense `local_id -> slot` array giving O(1) lookup
//! for cached nodes. An entry of 0 is ambiguous with "slot 0", so a hit is
//! never trusted on its own: callers must confirm the candidate slot still
//! holds the id they asked for. The array grows independently of the record
//! array and is capped at 10x the configured cache size, which keeps a single
//! pathological local id from ballooning the allocation.
//!
//! The prefix index maps semantic name prefixes (the leading segment up to
//! and including the first `_` or `:`) to id lists. It is built lazily on
//! first query, updated incrementally while the cache is small, and
//! invalidated wholesale once the cache is large enough that per-add updates
//! stop paying for themselves. Four hardcoded buckets survive from earlier
//! versions of the format and are kept populated alongside the dynamic map.

use std::collections::HashMap;

use smartstring::alias::String as SmartString;

use crate::record::NodeId;

/// Reverse index growth is bounded at this multiple of the cache size.
pub const REVERSE_INDEX_CAP_FACTOR: usize = 10;

/// Caches at or above this many records stop doing incremental prefix
/// updates and rebuild on the next query instead.
pub const INCREMENTAL_PREFIX_LIMIT: usize = 10_000;

#[derive(Debug, Default)]
pub struct ReverseIndex {
    slots: Vec<u32>,
    max_local_id: u32,
}

impl ReverseIndex {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            slots: Vec::new(),
            max_local_id: (max_nodes * REVERSE_INDEX_CAP_FACTOR) as u32,
        }
    }

    /// Raise the cap when the cache grows. Never shrinks.
    pub fn set_cache_size(&mut self, max_nodes: usize) {
        let cap = (max_nodes.saturating_mul(REVERSE_INDEX_CAP_FACTOR)).min(u32::MAX as usize) as u32;
        self.max_local_id = self.max_local_id.max(cap);
    }

    /// Record that `local_id` currently lives at `slot`. Ids beyond the cap
    /// are not indexed; lookups for them fall back to a linear scan.
    pub fn set(&mut self, local_id: u32, slot: usize) {
        if local_id == 0 || local_id > self.max_local_id {
            return;
        }
        let idx = local_id as usize;
        if self.slots.len() <= idx {
            self.slots.resize(idx + 1, 0);
        }
        self.slots[idx] = slot as u32;
    }

    pub fn clear_entry(&mut self, local_id: u32) {
        let idx = local_id as usize;
        if idx < self.slots.len() {
            self.slots[idx] = 0;
        }
    }

    /// The candidate slot for `local_id`. A return of 0 either means slot 0
    /// or "not indexed"; the caller must verify the slot's id either way.
    pub fn get(&self, local_id: u32) -> usize {
        self.slots.get(local_id as usize).copied().unwrap_or(0) as usize
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }
}

/// Extract the semantic prefix of a name: everything up to and including the
/// earliest `_` or `:`. Returns None for names with no separator.
pub fn semantic_prefix(name: &str) -> Option<&str> {
    let pos = name.find(['_', ':'])?;
    Some(&name[..=pos])
}

/// Chunk records are named `C:<parent>:<index>:<total>` and chunk parents
/// carry a `C:` prefix. They are resolved by id or file order during
/// reassembly, never by prefix query, so the prefix index skips them.
fn indexable(name: &str) -> Option<&str> {
    let prefix = semantic_prefix(name)?;
    if prefix == "C:" {
        None
    } else {
        Some(prefix)
    }
}

const LEGACY_PREFIXES: [&str; 4] = ["ISA_", "MATERIAL_", "LEARNING_", "PERFORMANCE_"];

#[derive(Debug, Default)]
pub struct PrefixIndex {
    built: bool,
    dynamic: HashMap<SmartString, Vec<NodeId>>,
    // Hardcoded legacy buckets, in LEGACY_PREFIXES order.
    legacy: [Vec<NodeId>; 4],
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn invalidate(&mut self) {
        self.built = false;
        self.dynamic.clear();
        for bucket in &mut self.legacy {
            bucket.clear();
        }
    }

    /// Rebuild from a full walk over live records. The caller supplies every
    /// (id, name) pair, cached and disk-only alike, in insertion order.
    pub fn build<'a>(&mut self, records: impl Iterator<Item = (NodeId, &'a str)>) {
        self.invalidate();
        for (id, name) in records {
            self.insert(id, name);
        }
        self.built = true;
    }

    /// Incrementally index one new node. `cache_len` decides the policy:
    /// small caches update in place, large ones invalidate and let the next
    /// query rebuild.
    pub fn add_node(&mut self, id: NodeId, name: &str, cache_len: usize) {
        if !self.built {
            return;
        }
        if cache_len < INCREMENTAL_PREFIX_LIMIT {
            self.insert(id, name);
        } else {
            self.invalidate();
        }
    }

    pub fn remove_node(&mut self, id: NodeId, name: &str) {
        if !self.built {
            return;
        }
        if let Some(prefix) = indexable(name) {
            if let Some(bucket) = self.dynamic.get_mut(prefix) {
                bucket.retain(|&x| x != id);
            }
            if let Some(i) = LEGACY_PREFIXES.iter().position(|&p| p == prefix) {
                self.legacy[i].retain(|&x| x != id);
            }
        }
    }

    fn insert(&mut self, id: NodeId, name: &str) {
        let Some(prefix) = indexable(name) else {
            return;
        };
        self.dynamic.entry(SmartString::from(prefix)).or_default().push(id);
        if let Some(i) = LEGACY_PREFIXES.iter().position(|&p| p == prefix) {
            self.legacy[i].push(id);
        }
    }

    /// The id list for an exact known prefix. This is the pure-prefix query
    /// fast path: when the query string is itself a prefix, the bucket is the
    /// whole answer.
    pub fn bucket(&self, prefix: &str) -> Option<&[NodeId]> {
        if let Some(ids) = self.dynamic.get(prefix) {
            return Some(ids);
        }
        LEGACY_PREFIXES
            .iter()
            .position(|&p| p == prefix)
            .map(|i| self.legacy[i].as_slice())
    }

    /// Candidate ids for an arbitrary query: the bucket of the query's own
    /// semantic prefix, if one exists.
    pub fn candidates(&self, query: &str) -> Option<&[NodeId]> {
        self.bucket(indexable(query)?)
    }

    /// Every dynamic bucket, for validation sweeps.
    pub fn buckets(&self) -> impl Iterator<Item = (&str, &[NodeId])> {
        self.dynamic.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn prefix_count(&self) -> usize {
        self.dynamic.len()
    }

    pub fn total_ids(&self) -> usize {
        self.dynamic.values().map(|v| v.len()).sum()
    }
}
