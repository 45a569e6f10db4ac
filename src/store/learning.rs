//! Helpers for the two payload shapes the learning plugins store. The store
//! core treats the 128 byte payload region as opaque bytes; these methods
//! are the one place that knows the field layouts.

use std::ops::Range;

use crate::error::{LatticeError, Result};
use crate::record::{NodeId, NodeType, PAYLOAD_SIZE};

use super::{now_micros, Lattice};

// Performance payload fields.
const PF_PATTERN_HASH: Range<usize> = 0..8;
const PF_DURATION_US: Range<usize> = 8..16;
const PF_SCORE: Range<usize> = 16..24;
const PF_SUCCESS: usize = 24;
const PF_USES: Range<usize> = 28..32;

// Learning pattern payload fields.
const LP_SUCCESS_COUNT: Range<usize> = 0..4;
const LP_FAILURE_COUNT: Range<usize> = 4..8;
const LP_SUCCESS_RATE: Range<usize> = 8..16;
const LP_GENERATION: Range<usize> = 16..20;

/// Patterns need this many samples before evolution considers them.
const EVOLVE_MIN_SAMPLES: u32 = 5;
const EVOLVE_PROMOTE_RATE: f64 = 0.8;
const EVOLVE_DEMOTE_RATE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceRecord {
    pub pattern_hash: u64,
    pub duration_us: u64,
    pub score: f64,
    pub success: bool,
    pub uses: u32,
}

impl PerformanceRecord {
    pub fn decode(payload: &[u8; PAYLOAD_SIZE]) -> PerformanceRecord {
        PerformanceRecord {
            pattern_hash: u64::from_le_bytes(payload[PF_PATTERN_HASH].try_into().unwrap()),
            duration_us: u64::from_le_bytes(payload[PF_DURATION_US].try_into().unwrap()),
            score: f64::from_le_bytes(payload[PF_SCORE].try_into().unwrap()),
            success: payload[PF_SUCCESS] != 0,
            uses: u32::from_le_bytes(payload[PF_USES].try_into().unwrap()),
        }
    }

    fn encode(&self, payload: &mut [u8; PAYLOAD_SIZE]) {
        payload[PF_PATTERN_HASH].copy_from_slice(&self.pattern_hash.to_le_bytes());
        payload[PF_DURATION_US].copy_from_slice(&self.duration_us.to_le_bytes());
        payload[PF_SCORE].copy_from_slice(&self.score.to_le_bytes());
        payload[PF_SUCCESS] = self.success as u8;
        payload[PF_USES].copy_from_slice(&self.uses.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternStats {
    pub success_count: u32,
    pub failure_count: u32,
    pub success_rate: f64,
    pub generation: u32,
}

impl PatternStats {
    pub fn decode(payload: &[u8; PAYLOAD_SIZE]) -> PatternStats {
        PatternStats {
            success_count: u32::from_le_bytes(payload[LP_SUCCESS_COUNT].try_into().unwrap()),
            failure_count: u32::from_le_bytes(payload[LP_FAILURE_COUNT].try_into().unwrap()),
            success_rate: f64::from_le_bytes(payload[LP_SUCCESS_RATE].try_into().unwrap()),
            generation: u32::from_le_bytes(payload[LP_GENERATION].try_into().unwrap()),
        }
    }

    fn encode(&self, payload: &mut [u8; PAYLOAD_SIZE]) {
        payload[LP_SUCCESS_COUNT].copy_from_slice(&self.success_count.to_le_bytes());
        payload[LP_FAILURE_COUNT].copy_from_slice(&self.failure_count.to_le_bytes());
        payload[LP_SUCCESS_RATE].copy_from_slice(&self.success_rate.to_le_bytes());
        payload[LP_GENERATION].copy_from_slice(&self.generation.to_le_bytes());
    }

    pub fn samples(&self) -> u32 {
        self.success_count + self.failure_count
    }
}

impl Lattice {
    /// Record one performance observation as a `Performance` node.
    pub fn store_performance(
        &mut self,
        name: &str,
        record: PerformanceRecord,
        parent_id: NodeId,
    ) -> Result<NodeId> {
        let id = self.add(NodeType::Performance, name, "", parent_id)?;
        let idx = self.locate_mut(id)?;
        record.encode(self.nodes[idx].payload_mut());
        let r = self.write_back(idx);
        self.note_err(r)?;
        Ok(id)
    }

    /// The highest scoring performance node whose name starts with `prefix`.
    pub fn get_best_performance(&self, prefix: &str) -> Option<(NodeId, PerformanceRecord)> {
        let mut best: Option<(NodeId, PerformanceRecord)> = None;
        self.scan_all(|node| {
            if node.kind == NodeType::Performance && node.name().starts_with(prefix) {
                let record = PerformanceRecord::decode(node.payload());
                let better = match &best {
                    Some((_, current)) => record.score > current.score,
                    None => true,
                };
                if better {
                    best = Some((node.id, record));
                }
            }
            true
        });
        best
    }

    /// Store a learnable pattern as a `Learning` node with zeroed stats.
    pub fn store_pattern(
        &mut self,
        name: &str,
        pattern_text: &str,
        parent_id: NodeId,
    ) -> Result<NodeId> {
        self.add(NodeType::Learning, name, pattern_text, parent_id)
    }

    /// Record one outcome for a pattern and refresh its success rate.
    pub fn update_success_rate(&mut self, id: NodeId, success: bool) -> Result<PatternStats> {
        let r = self.update_success_rate_inner(id, success);
        self.note_err(r)
    }

    fn update_success_rate_inner(&mut self, id: NodeId, success: bool) -> Result<PatternStats> {
        let idx = self.locate_mut(id)?;
        if self.nodes[idx].kind != NodeType::Learning {
            return Err(LatticeError::InvalidNode);
        }
        let mut stats = PatternStats::decode(self.nodes[idx].payload());
        if success {
            stats.success_count += 1;
        } else {
            stats.failure_count += 1;
        }
        stats.success_rate = stats.success_count as f64 / stats.samples() as f64;
        stats.encode(self.nodes[idx].payload_mut());
        self.nodes[idx].timestamp = now_micros();
        self.write_back(idx)?;
        self.dirty = true;
        Ok(stats)
    }

    /// Adjust a node's confidence by `delta`, clamped to [0, 1]. Returns the
    /// new value.
    pub fn update_confidence(&mut self, id: NodeId, delta: f64) -> Result<f64> {
        let r = (|| {
            let idx = self.locate_mut(id)?;
            let new = (self.nodes[idx].confidence + delta).clamp(0.0, 1.0);
            self.nodes[idx].confidence = new;
            self.nodes[idx].timestamp = now_micros();
            self.write_back(idx)?;
            self.dirty = true;
            Ok(new)
        })();
        self.note_err(r)
    }

    /// Patterns that have survived at least one evolution pass and hold a
    /// success rate of `min_rate` or better.
    pub fn get_evolved_patterns(&self, min_rate: f64, max: usize) -> Vec<NodeId> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        self.scan_all(|node| {
            if node.kind == NodeType::Learning {
                let stats = PatternStats::decode(node.payload());
                if stats.generation >= 1 && stats.success_rate >= min_rate {
                    out.push(node.id);
                }
            }
            out.len() < max
        });
        out
    }

    /// One evolution pass over every pattern: promote the reliable ones
    /// (bump generation and confidence), decay the failing ones. Returns the
    /// number promoted.
    pub fn evolve_patterns(&mut self) -> Result<u32> {
        let ids = self.find_by_type(NodeType::Learning, usize::MAX);
        let mut promoted = 0u32;

        for id in ids {
            let idx = match self.locate_mut(id) {
                Ok(idx) => idx,
                Err(_) => continue,
            };
            let mut stats = PatternStats::decode(self.nodes[idx].payload());
            if stats.samples() < EVOLVE_MIN_SAMPLES {
                continue;
            }
            if stats.success_rate >= EVOLVE_PROMOTE_RATE {
                stats.generation += 1;
                stats.encode(self.nodes[idx].payload_mut());
                self.nodes[idx].confidence = (self.nodes[idx].confidence + 0.05).min(1.0);
                self.write_back(idx)?;
                promoted += 1;
            } else if stats.success_rate < EVOLVE_DEMOTE_RATE {
                self.nodes[idx].confidence *= 0.9;
                self.write_back(idx)?;
            }
        }
        if promoted > 0 {
            self.dirty = true;
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_codecs_roundtrip() {
        let mut payload = [0u8; PAYLOAD_SIZE];

        let perf = PerformanceRecord {
            pattern_hash: 0xABCD,
            duration_us: 1500,
            score: 0.75,
            success: true,
            uses: 3,
        };
        perf.encode(&mut payload);
        assert_eq!(PerformanceRecord::decode(&payload), perf);

        let mut payload = [0u8; PAYLOAD_SIZE];
        let stats = PatternStats {
            success_count: 8,
            failure_count: 2,
            success_rate: 0.8,
            generation: 1,
        };
        stats.encode(&mut payload);
        assert_eq!(PatternStats::decode(&payload), stats);
        assert_eq!(PatternStats::decode(&payload).samples(), 10);
    }
}
