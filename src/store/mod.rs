//! The node store itself. See the crate docs for the big picture.
//!
//! A lattice runs in one of two modes:
//!
//! - **RAM mode**: the cache arrays are the canonical store. `save` writes an
//!   atomic snapshot (`<path>.tmp` + rename) and nodes evicted from the cache
//!   are read back from the last snapshot with positioned reads.
//! - **Disk mode**: the file is pre-allocated and mapped shared; the mapping
//!   is canonical and record slot `local_id - 1` is the node's permanent
//!   address. The cache arrays hold decoded copies of the working set.
//!
//! Three parallel arrays make up the cache: the records themselves, an id
//! map (so index verification doesn't touch the record), and per-slot access
//! counters for eviction. The arrays grow together and the invariant
//! "cache position == slot index in the reverse index" is maintained by
//! every shift.

mod chunk;
pub(crate) mod file;
mod learning;
mod load;
mod mutate;
mod query;
mod recover;

pub use chunk::{ChunkMeta, CHUNK_PAYLOAD};
pub use learning::{PatternStats, PerformanceRecord};
pub use query::NameFilters;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use smallvec::SmallVec;
use tracing::{info, warn};

use crate::env;
use crate::error::{LatticeError, Result};
use crate::index::{PrefixIndex, ReverseIndex};
use crate::license::LicenseState;
use crate::record::{local_id, FileHeader, Node, NodeId, RECORD_SIZE};
use crate::wal::{Wal, WalOptions};
use file::DataFile;

/// Default RAM cache capacity, in records.
pub const DEFAULT_MAX_RAM_NODES: usize = 10_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum StoreMode {
    Ram,
    Disk { total_file_nodes: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct LatticeOptions {
    /// RAM cache capacity. 0 means [`DEFAULT_MAX_RAM_NODES`].
    pub max_ram_nodes: usize,
    /// High 32 bits of every id this writer assigns.
    pub device_id: u32,
    /// Overrides `SYNRIX_LICENSE_KEY`.
    pub license_key: Option<String>,
    /// Overrides the per-machine license counter directory (normally under
    /// the user's cache directory).
    pub counter_dir: Option<PathBuf>,
    /// Save after every N successful mutations. None disables auto-save.
    pub save_every: Option<u32>,
}

#[derive(Debug)]
pub struct Lattice {
    path: PathBuf,
    device_id: u32,
    mode: StoreMode,

    // The cache arrays. Always the same length.
    nodes: Vec<Node>,
    node_id_map: Vec<NodeId>,
    last_access: Vec<u64>,
    access_clock: u64,

    /// Cache capacity before the next growth (RAM mode) or eviction (disk
    /// mode) kicks in.
    max_nodes: usize,

    next_local_id: u32,
    /// Live records in the whole store, cached or not.
    live_count: u32,

    pub(crate) rev: ReverseIndex,
    pub(crate) prefix: PrefixIndex,

    /// Disk mode only: parent id -> child ids, rebuilt in one pass on open.
    child_index: HashMap<NodeId, SmallVec<[NodeId; 4]>>,

    /// RAM mode only: nodes evicted from the cache, still present in the
    /// last snapshot. local id -> full id. Snapshot saves carry these
    /// forward; deletes and cache reloads drop them.
    evicted: HashMap<u32, NodeId>,
    /// Record slots written by the last snapshot (RAM mode read-back bound).
    saved_slots: u32,

    /// Disk mode only: local id -> actual slot, for records compaction moved
    /// off their `local_id - 1` home. Filled lazily by scans.
    slot_overrides: HashMap<u32, u32>,

    file: Option<DataFile>,
    wal: Option<Wal>,
    pub(crate) license: LicenseState,

    dirty: bool,
    save_every: Option<u32>,
    ops_since_save: u32,
    last_error: Option<LatticeError>,
    corrupt_slots_on_load: u32,
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl Lattice {
    /// Open (or create) a RAM mode store. A missing file yields an empty
    /// store with `next_local_id == 1`.
    pub fn init(path: &Path, max_ram_nodes: usize, device_id: u32) -> Result<Lattice> {
        Self::init_with_options(
            path,
            LatticeOptions {
                max_ram_nodes,
                device_id,
                ..Default::default()
            },
        )
    }

    pub fn init_with_options(path: &Path, options: LatticeOptions) -> Result<Lattice> {
        let mut lattice = Self::empty(path, &options, StoreMode::Ram)?;

        let (data_file, header) = DataFile::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                LatticeError::InvalidMagic
            } else {
                LatticeError::from(e)
            }
        })?;
        lattice.file = Some(data_file);

        if let Some(header) = header {
            lattice.load_ram(header)?;
        }

        if lattice.live_count > 0 {
            lattice.license.register(lattice.live_count as u64)?;
        }
        if env::verbose() {
            info!(
                path = %path.display(),
                nodes = lattice.live_count,
                next_local_id = lattice.next_local_id,
                "lattice opened (ram mode)"
            );
        }
        Ok(lattice)
    }

    /// Open (or create) a disk mode store pre-allocated for
    /// `total_file_nodes` records. The file is mapped shared and writes
    /// mutate the mapping directly.
    pub fn init_disk_mode(
        path: &Path,
        max_ram_nodes: usize,
        device_id: u32,
        total_file_nodes: u32,
    ) -> Result<Lattice> {
        if total_file_nodes == 0 {
            return Err(LatticeError::NullInput);
        }
        let options = LatticeOptions {
            max_ram_nodes,
            device_id,
            ..Default::default()
        };
        let mut lattice = Self::empty(path, &options, StoreMode::Disk { total_file_nodes })?;

        let (mut data_file, header) = DataFile::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                LatticeError::InvalidMagic
            } else {
                LatticeError::from(e)
            }
        })?;

        let is_new = header.is_none();
        if is_new {
            data_file.write_header(&FileHeader {
                node_count: 0,
                next_local_id: 1,
                nodes_to_load: 0,
            })?;
        }
        // The mapping covers the full pre-allocated capacity, or the larger
        // of that and whatever an existing file already holds.
        let existing = data_file.slot_capacity()?;
        data_file.map_for_slots(total_file_nodes.max(existing))?;
        lattice.file = Some(data_file);

        if let Some(header) = header {
            lattice.open_disk(header)?;
        }

        if lattice.live_count > 0 {
            lattice.license.register(lattice.live_count as u64)?;
        }
        if env::verbose() {
            info!(
                path = %path.display(),
                nodes = lattice.live_count,
                capacity = total_file_nodes,
                "lattice opened (disk mode)"
            );
        }
        Ok(lattice)
    }

    fn empty(path: &Path, options: &LatticeOptions, mode: StoreMode) -> Result<Lattice> {
        if path.as_os_str().is_empty() || path.file_name().is_none() {
            return Err(LatticeError::InvalidPath);
        }
        let max_nodes = if options.max_ram_nodes == 0 {
            DEFAULT_MAX_RAM_NODES
        } else {
            options.max_ram_nodes
        };

        let mut license = LicenseState::new(options.license_key.as_deref());
        if let Some(dir) = &options.counter_dir {
            license.set_counter_dir(dir);
        }

        Ok(Lattice {
            path: path.to_path_buf(),
            device_id: options.device_id,
            mode,
            nodes: Vec::new(),
            node_id_map: Vec::new(),
            last_access: Vec::new(),
            access_clock: 0,
            max_nodes,
            next_local_id: 1,
            live_count: 0,
            rev: ReverseIndex::new(max_nodes),
            prefix: PrefixIndex::new(),
            child_index: HashMap::new(),
            evicted: HashMap::new(),
            saved_slots: 0,
            slot_overrides: HashMap::new(),
            file: None,
            wal: None,
            license,
            dirty: false,
            save_every: options.save_every,
            ops_since_save: 0,
            last_error: None,
            corrupt_slots_on_load: 0,
        })
    }

    // *** Accessors ***

    pub fn node_count(&self) -> u32 {
        self.live_count
    }

    pub fn next_local_id(&self) -> u32 {
        self.next_local_id
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn is_disk_mode(&self) -> bool {
        matches!(self.mode, StoreMode::Disk { .. })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The most recent mutation failure, for callers that observe sentinel
    /// returns through a wrapping layer.
    pub fn last_error(&self) -> Option<LatticeError> {
        self.last_error
    }

    /// Slots the load-time validator had to skip. Non-zero suggests running
    /// [`Lattice::compact_file`].
    pub fn corrupt_slots_on_load(&self) -> u32 {
        self.corrupt_slots_on_load
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn note_err<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = Some(*e);
        }
        result
    }

    // *** Persistence configuration ***

    /// Save after every `save_every` successful mutations. None disables.
    pub fn configure_persistence(&mut self, save_every: Option<u32>) {
        self.save_every = save_every;
        self.ops_since_save = 0;
    }

    pub(crate) fn maybe_autosave(&mut self) -> Result<()> {
        let Some(every) = self.save_every else {
            return Ok(());
        };
        self.ops_since_save += 1;
        if self.ops_since_save >= every {
            self.save()?;
        }
        Ok(())
    }

    // *** Licensing passthroughs ***

    pub fn set_license_key(&mut self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(LatticeError::NullInput);
        }
        self.license.set_key(key);
        Ok(())
    }

    /// Apply the `{limit, unlimited}` result of external license
    /// verification.
    pub fn apply_license(&mut self, info: crate::license::LicenseInfo) {
        self.license.apply_verified(info);
    }

    pub fn disable_evaluation_mode(&mut self) -> Result<()> {
        self.license.disable_evaluation_mode()
    }

    pub fn set_free_tier_limit(&mut self, limit: u32) {
        self.license.free_tier_limit = limit;
    }

    pub fn license_state(&mut self) -> &mut LicenseState {
        &mut self.license
    }

    // *** WAL control ***

    pub fn enable_wal(&mut self, options: WalOptions) -> Result<()> {
        if self.wal.is_some() {
            return Ok(());
        }
        // Replay anything a previous process left behind before we start
        // appending after it.
        self.recover_from_wal()?;
        let wal_path = self.wal_file_path();
        self.wal = Some(Wal::open(&wal_path, options)?);
        Ok(())
    }

    pub fn disable_wal(&mut self) {
        // Wal::drop stops the flusher and drains the buffer.
        self.wal = None;
    }

    pub fn wal_enabled(&self) -> bool {
        self.wal.is_some()
    }

    pub(crate) fn wal_file_path(&self) -> PathBuf {
        let mut p = self.path.as_os_str().to_owned();
        p.push(".wal");
        PathBuf::from(p)
    }

    /// Push buffered WAL entries to disk and wait.
    pub fn flush(&mut self) -> Result<u64> {
        match &self.wal {
            Some(wal) => wal.flush(),
            None => Err(LatticeError::WalNotEnabled),
        }
    }

    /// Wait for the WAL durability watermark to reach `sequence`. Returns
    /// the watermark actually reached.
    pub fn flush_wait(&mut self, sequence: u64) -> Result<u64> {
        match &self.wal {
            Some(wal) => wal.flush_wait(sequence),
            None => Err(LatticeError::WalNotEnabled),
        }
    }

    /// Flush, save the data file, then shrink the log. After this returns,
    /// replay of the log is a no-op.
    pub fn checkpoint(&mut self) -> Result<u64> {
        let Some(wal) = &self.wal else {
            return Err(LatticeError::WalNotEnabled);
        };
        let target = wal.sequence();
        let reached = wal.flush_wait(target)?;
        if reached < target {
            return Err(LatticeError::Io(std::io::ErrorKind::TimedOut));
        }

        self.save()?;
        self.wal
            .as_mut()
            .expect("wal checked above")
            .checkpoint()
    }

    // *** Cache management ***

    pub(crate) fn touch(&mut self, idx: usize) {
        self.access_clock += 1;
        self.last_access[idx] = self.access_clock;
    }

    /// Append a node to the cache arrays and index it. The caller has
    /// already made room.
    pub(crate) fn push_cache(&mut self, node: Node) -> usize {
        debug_assert!(self.nodes.len() < self.max_nodes);
        let idx = self.nodes.len();
        self.access_clock += 1;
        self.node_id_map.push(node.id);
        self.last_access.push(self.access_clock);
        self.rev.set(local_id(node.id), idx);
        self.nodes.push(node);
        idx
    }

    /// Remove cache slot `idx`, shifting successors down and repairing their
    /// reverse index entries so "index == cache position" keeps holding.
    pub(crate) fn remove_cache_slot(&mut self, idx: usize) -> Node {
        let node = self.nodes.remove(idx);
        self.node_id_map.remove(idx);
        self.last_access.remove(idx);
        self.rev.clear_entry(local_id(node.id));
        for i in idx..self.nodes.len() {
            self.rev.set(local_id(self.node_id_map[i]), i);
        }
        node
    }

    /// Make room for one more cached node. RAM mode grows the arrays by
    /// doubling; disk mode evicts, since the mapping holds the canonical
    /// copy anyway.
    pub(crate) fn make_room(&mut self) -> Result<()> {
        if self.nodes.len() < self.max_nodes {
            return Ok(());
        }
        match self.mode {
            StoreMode::Ram => self.grow_ram(),
            StoreMode::Disk { .. } => {
                self.evict_oldest(1)?;
                Ok(())
            }
        }
    }

    fn grow_ram(&mut self) -> Result<()> {
        let new_max = self.max_nodes.checked_mul(2).ok_or(LatticeError::OutOfMemory)?;
        self.nodes.try_reserve(new_max - self.nodes.len()).map_err(|_| LatticeError::OutOfMemory)?;
        self.node_id_map
            .try_reserve(new_max - self.node_id_map.len())
            .map_err(|_| LatticeError::OutOfMemory)?;
        self.last_access
            .try_reserve(new_max - self.last_access.len())
            .map_err(|_| LatticeError::OutOfMemory)?;
        self.max_nodes = new_max;
        self.rev.set_cache_size(new_max);
        if env::verbose() {
            info!(max_nodes = new_max, "ram cache grown");
        }
        Ok(())
    }

    /// Evict the `n` least recently used nodes from the cache. In RAM mode a
    /// dirty store is saved first so the victims stay reachable through the
    /// snapshot; in disk mode the mapping already holds them.
    pub fn evict_oldest(&mut self, n: usize) -> Result<usize> {
        if matches!(self.mode, StoreMode::Ram) && self.dirty {
            self.save()?;
        }

        let mut evicted = 0;
        for _ in 0..n {
            let Some(idx) = self
                .last_access
                .iter()
                .enumerate()
                .min_by_key(|(_, &t)| t)
                .map(|(i, _)| i)
            else {
                break;
            };
            let node = self.remove_cache_slot(idx);
            if matches!(self.mode, StoreMode::Ram) {
                self.evicted.insert(local_id(node.id), node.id);
            }
            evicted += 1;
        }
        Ok(evicted)
    }

    // *** Stats ***

    /// Log a one-line summary of store health. Useful while streaming large
    /// imports.
    pub fn print_streaming_stats(&self) {
        use humansize::{format_size, DECIMAL};

        let file_bytes = self
            .file
            .as_ref()
            .and_then(|f| f.len().ok())
            .unwrap_or(0);
        let cache_bytes = self.nodes.len() * RECORD_SIZE;
        let wal_buffered = self.wal.as_ref().map(|w| w.buffered_entries()).unwrap_or(0);
        let mode = if self.is_disk_mode() { "disk" } else { "ram" };

        info!(
            mode,
            live = self.live_count,
            cached = self.nodes.len(),
            next_local_id = self.next_local_id,
            file = %format_size(file_bytes, DECIMAL),
            cache = %format_size(cache_bytes as u64, DECIMAL),
            prefixes = self.prefix.prefix_count(),
            wal_buffered,
            dirty = self.dirty,
            "lattice stats"
        );
    }

    // *** Teardown ***

    /// Orderly shutdown: stop the WAL flusher, save if dirty, sync and close
    /// the file, drop the indices. Prefer this over plain drop when you want
    /// the errors.
    pub fn cleanup(mut self) -> Result<()> {
        self.disable_wal();
        if self.dirty {
            self.save()?;
        }
        if let Some(mut file) = self.file.take() {
            file.sync()?;
        }
        self.nodes = Vec::new();
        self.node_id_map = Vec::new();
        self.last_access = Vec::new();
        self.child_index = HashMap::new();
        self.rev.reset();
        self.prefix.invalidate();
        Ok(())
    }
}

impl Drop for Lattice {
    fn drop(&mut self) {
        // Best effort version of cleanup() for the plain-drop path. The WAL
        // and data file flush themselves in their own Drop impls.
        if self.dirty && self.file.is_some() {
            if let Err(e) = self.save() {
                warn!(error = %e, "final save failed during drop");
            }
        }
    }
}
