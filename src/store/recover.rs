//! Replaying the write-ahead log into a freshly opened store.
//!
//! Replay is idempotent by construction: adds whose (name, type) pair is
//! already live are silently accepted as duplicates, updates for unknown
//! nodes are skipped, and a checkpointed log replays nothing at all because
//! [`crate::wal::read_log`] filters entries at or below the checkpoint.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::error::{LatticeError, Result};
use crate::record::{local_id, Node, NodeId, NodeType, DATA_SIZE};
use crate::wal::{self, WalRecord};

use super::{now_micros, Lattice, StoreMode};

impl Lattice {
    /// Apply every uncheckpointed WAL entry to this store. Returns the
    /// number of entries applied. Missing log file is not an error; there is
    /// just nothing to do.
    pub fn recover_from_wal(&mut self) -> Result<u32> {
        let wal_path = self.wal_file_path();
        let Some(recovery) = wal::read_log(&wal_path)? else {
            return Ok(0);
        };
        if recovery.records.is_empty() {
            return Ok(0);
        }

        // Replay must not append to the log it is replaying.
        let saved_wal = self.wal.take();
        let result = self.apply_records(recovery.records);
        self.wal = saved_wal;

        let applied = result?;
        self.prefix.invalidate();
        if applied > 0 {
            self.dirty = true;
        }
        info!(applied, truncated = recovery.truncated, "wal replay complete");
        Ok(applied)
    }

    fn apply_records(&mut self, records: Vec<WalRecord>) -> Result<u32> {
        // (name, type) pairs already live, for duplicate suppression.
        let mut seen: HashSet<(String, u32)> = HashSet::new();
        self.scan_all(|node| {
            seen.insert((node.name().to_owned(), node.kind as u32));
            true
        });

        let mut applied = 0u32;
        for record in records {
            match record {
                WalRecord::AddNode {
                    node_id,
                    kind,
                    name,
                    data,
                    parent_id,
                } => {
                    if seen.contains(&(name.clone(), kind as u32)) || self.contains(node_id) {
                        // Duplicate of something already present. Accepted
                        // silently.
                        continue;
                    }
                    self.insert_replayed(node_id, kind, &name, &data, parent_id)?;
                    seen.insert((name, kind as u32));
                    applied += 1;
                }
                WalRecord::UpdateNode { node_id, data } => match self.locate_mut(node_id) {
                    Ok(idx) => {
                        // The logged bytes are the data region as written
                        // (envelope or terminated text); copying them back
                        // re-applies whichever it was.
                        let raw = self.nodes[idx].raw_data_mut();
                        raw.fill(0);
                        let n = data.len().min(DATA_SIZE);
                        raw[..n].copy_from_slice(&data[..n]);
                        self.nodes[idx].timestamp = now_micros();
                        self.write_back(idx)?;
                        applied += 1;
                    }
                    Err(_) => {
                        debug!(node_id, "update for unknown node skipped");
                    }
                },
                WalRecord::DeleteNode { node_id } => {
                    if self.contains(node_id) {
                        self.delete_inner(node_id)?;
                        applied += 1;
                    }
                }
                WalRecord::AddChild {
                    parent_id,
                    child_id,
                } => {
                    self.attach_child(parent_id, child_id);
                    applied += 1;
                }
                WalRecord::Checkpoint => {}
            }
        }
        Ok(applied)
    }

    /// Insert a node replayed from the log, preserving its original id. The
    /// admission gate is not consulted: these nodes were admitted when they
    /// were first written.
    fn insert_replayed(
        &mut self,
        node_id: NodeId,
        kind: NodeType,
        name: &str,
        data: &[u8],
        parent_id: NodeId,
    ) -> Result<()> {
        let local = local_id(node_id);
        if local == 0 {
            return Err(LatticeError::InvalidNode);
        }
        if let StoreMode::Disk { total_file_nodes } = self.mode {
            if local > total_file_nodes {
                warn!(node_id, "replayed node is past disk capacity; skipped");
                return Ok(());
            }
        }
        self.make_room()?;

        let mut node = Node::new(node_id, kind, name, parent_id, now_micros());
        {
            let raw = node.raw_data_mut();
            let n = data.len().min(DATA_SIZE);
            raw[..n].copy_from_slice(&data[..n]);
        }

        if self.is_disk_mode() {
            let data_file = self.file.as_mut().expect("disk mode always has a file");
            let slot = data_file
                .slot_bytes_mut(local - 1)
                .ok_or(LatticeError::CapacityExhausted)?;
            node.encode(slot);
        }

        self.push_cache(node);
        self.live_count += 1;
        self.next_local_id = self.next_local_id.max(local + 1);

        if parent_id != 0 {
            self.attach_child(parent_id, node_id);
        }
        Ok(())
    }
}
