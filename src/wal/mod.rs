//! The write-ahead log. Mutations append here before the data file is
//! updated durably, so a crash between saves replays cleanly on the next
//! open.
//!
//! Design notes:
//!
//! The log is append-only with a fixed header at offset 0 (the "state
//! ledger") tracking four watermarks: the highest assigned sequence, the
//! checkpoint sequence (everything at or below it is already in the data
//! file), the commit count, and the byte offset of the end of valid data.
//! Because the file may be pre-allocated and full of garbage, every append
//! also zeroes the next record header slot; recovery stops at the first
//! zeroed header (the sentinel) even if the ledger is stale.
//!
//! Appends go to an in-memory buffer and a background flusher turns the
//! buffer into one write + fsync. The flusher copies the buffer contents
//! *while holding the mutex* and does the I/O outside it; an earlier
//! revision handed the live buffer to the flusher and produced a nasty
//! interleaving when a producer appended mid-write. Waiters block on a
//! condition variable gated by the flushed-sequence watermark.

pub mod encoding;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bumpalo::Bump;
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::env;
use crate::error::{LatticeError, Result};
use crate::record::{NodeId, NodeType};
use crate::store::file::{read_exact_at, write_all_at, write_barrier};

pub use encoding::{WalHeader, WalOp, WalRecord};
use encoding::{
    RecordHeader, MAX_PAYLOAD, MAX_SEQUENCE_JUMP, RECORD_HEADER_SIZE, WAL_HEADER_SIZE,
};

pub const DEFAULT_MIN_BATCH: u64 = 1_000;
pub const DEFAULT_MAX_BATCH: u64 = 100_000;

/// Batch sizing reacts to the write rate once per second.
const ADJUST_INTERVAL: Duration = Duration::from_secs(1);
const RATE_GROW_THRESHOLD: f64 = 10_000.0;
const RATE_SHRINK_THRESHOLD: f64 = 1_000.0;

#[derive(Debug, Clone)]
pub struct WalOptions {
    /// When false, every append is written and fsynced inline.
    pub batching: bool,
    pub min_batch: u64,
    pub max_batch: u64,
    /// Upper bound on how long `flush_wait` blocks before giving up and
    /// reporting the watermark it reached.
    pub flush_wait_timeout: Duration,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            batching: true,
            min_batch: DEFAULT_MIN_BATCH,
            max_batch: DEFAULT_MAX_BATCH,
            flush_wait_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct WalState {
    header: WalHeader,
    /// Encoded records waiting for the flusher.
    buf: Vec<u8>,
    buffered_entries: u64,
    flushed_sequence: u64,
    flush_requested: bool,
    shutdown: bool,
    batch_size: u64,
    min_batch: u64,
    max_batch: u64,
    window_ops: u64,
    last_adjust: Instant,
    /// First I/O failure seen by the flusher. Poisons flush_wait.
    io_failed: Option<io::ErrorKind>,
}

#[derive(Debug)]
struct WalShared {
    state: Mutex<WalState>,
    /// Producer -> flusher: work available or flush requested.
    work_cv: Condvar,
    /// Flusher -> waiters: the flushed watermark moved.
    done_cv: Condvar,
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    shared: Arc<WalShared>,
    flusher: Option<JoinHandle<()>>,
    options: WalOptions,
}

impl Wal {
    /// Open (or create) the log at `path` and start the background flusher
    /// if batching is enabled. Callers are expected to have already replayed
    /// the log via [`read_log`]; opening does not replay.
    pub fn open(path: &Path, options: WalOptions) -> Result<Wal> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(LatticeError::from)?;

        let len = file.metadata().map_err(LatticeError::from)?.len();
        let header = if len >= WAL_HEADER_SIZE as u64 {
            let mut buf = [0u8; WAL_HEADER_SIZE];
            read_exact_at(&file, &mut buf, 0).map_err(LatticeError::from)?;
            WalHeader::decode(&buf).ok_or(LatticeError::WalCorruption)?
        } else {
            let header = WalHeader::default();
            write_all_at(&file, &header.encode(), 0).map_err(LatticeError::from)?;
            // Seed the first sentinel.
            write_all_at(&file, &[0u8; RECORD_HEADER_SIZE], WAL_HEADER_SIZE as u64)
                .map_err(LatticeError::from)?;
            file.sync_all().map_err(LatticeError::from)?;
            header
        };

        let state = WalState {
            header,
            buf: Vec::new(),
            buffered_entries: 0,
            flushed_sequence: header.sequence,
            flush_requested: false,
            shutdown: false,
            batch_size: options.min_batch,
            min_batch: options.min_batch,
            max_batch: options.max_batch,
            window_ops: 0,
            last_adjust: Instant::now(),
            io_failed: None,
        };
        let shared = Arc::new(WalShared {
            state: Mutex::new(state),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let flusher = if options.batching {
            let shared = Arc::clone(&shared);
            let file = file.try_clone().map_err(LatticeError::from)?;
            Some(
                std::thread::Builder::new()
                    .name("synrix-wal-flush".into())
                    .spawn(move || flusher_loop(shared, file))
                    .map_err(LatticeError::from)?,
            )
        } else {
            None
        };

        if env::wal_verbose() {
            debug!(path = %path.display(), seq = header.sequence,
                checkpoint = header.checkpoint_sequence, "wal opened");
        }

        Ok(Wal {
            path: path.to_path_buf(),
            file,
            shared,
            flusher,
            options,
        })
    }

    /// Sequence of the most recently appended record.
    pub fn sequence(&self) -> u64 {
        self.shared.state.lock().header.sequence
    }

    pub fn flushed_sequence(&self) -> u64 {
        self.shared.state.lock().flushed_sequence
    }

    pub fn buffered_entries(&self) -> u64 {
        self.shared.state.lock().buffered_entries
    }

    fn append_record(&self, op: WalOp, node_id: NodeId, payload: &[u8]) -> Result<u64> {
        assert!(payload.len() <= MAX_PAYLOAD as usize);

        let mut state = self.shared.state.lock();
        let sequence = state.header.sequence + 1;
        state.header.sequence = sequence;

        let header = RecordHeader {
            sequence,
            op,
            node_id,
            data_size: payload.len() as u32,
        };
        state.buf.extend_from_slice(&header.encode());
        state.buf.extend_from_slice(payload);
        state.buffered_entries += 1;
        state.window_ops += 1;

        if env::wal_verbose() {
            debug!(seq = sequence, op = ?op, node_id, size = payload.len(), "wal append");
        }

        if self.options.batching {
            if state.buffered_entries >= state.batch_size {
                self.shared.work_cv.notify_one();
            }
            Ok(sequence)
        } else {
            // Synchronous mode: this thread does the flush inline.
            let result = flush_locked(&mut state, &self.file);
            drop(state);
            result.map_err(LatticeError::from)?;
            Ok(sequence)
        }
    }

    pub fn append_add_node(
        &self,
        node_id: NodeId,
        kind: NodeType,
        name: &str,
        data: &[u8],
        parent_id: NodeId,
    ) -> Result<u64> {
        let bump = Bump::new();
        let mut payload = bumpalo::collections::Vec::with_capacity_in(data.len() + 96, &bump);
        encoding::encode_add_node(&mut payload, kind, name, data, parent_id);
        self.append_record(WalOp::AddNode, node_id, &payload)
    }

    pub fn append_update_node(&self, node_id: NodeId, data: &[u8]) -> Result<u64> {
        self.append_record(WalOp::UpdateNode, node_id, data)
    }

    pub fn append_delete_node(&self, node_id: NodeId) -> Result<u64> {
        self.append_record(WalOp::DeleteNode, node_id, &[])
    }

    pub fn append_add_child(&self, parent_id: NodeId, child_id: NodeId) -> Result<u64> {
        let bump = Bump::new();
        let mut payload = bumpalo::collections::Vec::with_capacity_in(16, &bump);
        encoding::encode_add_child(&mut payload, parent_id, child_id);
        self.append_record(WalOp::AddChild, parent_id, &payload)
    }

    /// Push everything buffered to disk and wait for it.
    pub fn flush(&self) -> Result<u64> {
        let target = self.shared.state.lock().header.sequence;
        self.flush_wait(target)
    }

    /// Block until the durable watermark reaches `sequence`, or the timeout
    /// passes. Returns the watermark actually reached; the caller compares
    /// it against what they asked for.
    pub fn flush_wait(&self, sequence: u64) -> Result<u64> {
        let mut state = self.shared.state.lock();

        if !self.options.batching {
            return Ok(state.flushed_sequence);
        }

        let deadline = Instant::now() + self.options.flush_wait_timeout;
        while state.flushed_sequence < sequence {
            if let Some(kind) = state.io_failed {
                return Err(LatticeError::Io(kind));
            }
            state.flush_requested = true;
            self.shared.work_cv.notify_one();
            if self
                .shared
                .done_cv
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                warn!(
                    wanted = sequence,
                    reached = state.flushed_sequence,
                    "flush_wait timed out"
                );
                break;
            }
        }
        Ok(state.flushed_sequence)
    }

    /// Record a checkpoint: everything up to the current sequence is now in
    /// the data file, so the log shrinks back to just its header. The caller
    /// must have saved the data file between `flush` and this call.
    pub fn checkpoint(&mut self) -> Result<u64> {
        let target = self.shared.state.lock().header.sequence;
        let reached = self.flush_wait(target)?;
        if reached < target {
            return Err(LatticeError::Io(io::ErrorKind::TimedOut));
        }

        let mut state = self.shared.state.lock();
        state.header.checkpoint_sequence = target;
        state.header.commit_count = 0;
        state.header.last_valid_offset = WAL_HEADER_SIZE as u64;
        let bytes = state.header.encode();

        write_all_at(&self.file, &bytes, 0).map_err(LatticeError::from)?;
        self.file.sync_data().map_err(LatticeError::from)?;
        self.file
            .set_len(WAL_HEADER_SIZE as u64)
            .map_err(LatticeError::from)?;
        // Fresh sentinel for the next append.
        write_all_at(&self.file, &[0u8; RECORD_HEADER_SIZE], WAL_HEADER_SIZE as u64)
            .map_err(LatticeError::from)?;
        self.file.sync_data().map_err(LatticeError::from)?;
        state.flushed_sequence = target;
        drop(state);

        if env::wal_verbose() {
            debug!(checkpoint = target, "wal checkpoint");
        }
        Ok(target)
    }

    pub fn wal_path(&self) -> &Path {
        &self.path
    }

    /// Stop the flusher, flushing anything still buffered.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.flusher.take() {
            {
                let mut state = self.shared.state.lock();
                state.shutdown = true;
                self.shared.work_cv.notify_one();
            }
            if handle.join().is_err() {
                error!("wal flusher thread panicked");
            }
        }
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drain the buffer: one data write, a sentinel, an fsync, then the ledger
/// update. Used by the synchronous (non-batched) append path, with the state
/// lock held.
fn flush_locked(state: &mut WalState, file: &File) -> io::Result<()> {
    if state.buffered_entries == 0 {
        return Ok(());
    }
    let batch = std::mem::take(&mut state.buf);
    let entries = std::mem::take(&mut state.buffered_entries);
    let start = state.header.last_valid_offset;

    write_batch(file, &batch, start)?;

    state.header.commit_count += entries;
    state.header.last_valid_offset = start + batch.len() as u64;
    write_all_at(file, &state.header.encode(), 0)?;
    file.sync_data()?;
    state.flushed_sequence = state.header.sequence;
    Ok(())
}

fn write_batch(file: &File, batch: &[u8], start: u64) -> io::Result<()> {
    write_all_at(file, batch, start)?;
    // Neutralise pre-allocated garbage after the new tail.
    write_all_at(file, &[0u8; RECORD_HEADER_SIZE], start + batch.len() as u64)?;
    // The records must hit the platter before the ledger claims them. The
    // full fsync happens after the ledger rewrite.
    write_barrier(file)
}

fn flusher_loop(shared: Arc<WalShared>, file: File) {
    loop {
        let mut state = shared.state.lock();

        loop {
            maybe_adjust_batch_size(&mut state);
            let work = state.flush_requested
                || state.shutdown
                || state.buffered_entries >= state.batch_size;
            if work {
                break;
            }
            shared
                .work_cv
                .wait_until(&mut state, Instant::now() + ADJUST_INTERVAL);
        }

        if state.buffered_entries == 0 {
            state.flush_requested = false;
            // Wake any flush_wait callers so they re-check the watermark.
            shared.done_cv.notify_all();
            if state.shutdown {
                return;
            }
            continue;
        }

        // Copy the buffer out under the mutex, then do the I/O without it.
        let batch = std::mem::take(&mut state.buf);
        let entries = std::mem::take(&mut state.buffered_entries);
        let start = state.header.last_valid_offset;
        let staged_sequence = state.header.sequence;
        state.flush_requested = false;
        drop(state);

        let write_result = write_batch(&file, &batch, start);

        let mut state = shared.state.lock();
        match write_result {
            Ok(()) => {
                state.header.commit_count += entries;
                state.header.last_valid_offset = start + batch.len() as u64;
                let header_result = write_all_at(&file, &state.header.encode(), 0)
                    .and_then(|_| file.sync_data());
                match header_result {
                    Ok(()) => {
                        state.flushed_sequence = staged_sequence;
                        if env::wal_verbose() {
                            debug!(entries, through = staged_sequence, "wal batch flushed");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "wal header rewrite failed");
                        state.io_failed = Some(e.kind());
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "wal batch write failed");
                state.io_failed = Some(e.kind());
            }
        }
        shared.done_cv.notify_all();

        if state.shutdown && state.buffered_entries == 0 {
            return;
        }
    }
}

fn maybe_adjust_batch_size(state: &mut WalState) {
    let elapsed = state.last_adjust.elapsed();
    if elapsed < ADJUST_INTERVAL {
        return;
    }
    let rate = state.window_ops as f64 / elapsed.as_secs_f64();
    let old = state.batch_size;
    if rate > RATE_GROW_THRESHOLD {
        state.batch_size = (state.batch_size * 120 / 100).min(state.max_batch);
    } else if rate < RATE_SHRINK_THRESHOLD {
        state.batch_size = (state.batch_size * 80 / 100).max(state.min_batch);
    }
    if state.batch_size != old && env::wal_verbose() {
        debug!(rate, old, new = state.batch_size, "wal batch size adjusted");
    }
    state.window_ops = 0;
    state.last_adjust = Instant::now();
}

// *** Recovery ***

/// Everything recovery learned from one walk over the log.
#[derive(Debug)]
pub struct Recovery {
    pub header: WalHeader,
    pub records: Vec<WalRecord>,
    /// True when a suspicious tail was cut off.
    pub truncated: bool,
}

/// Walk the log at `path` and decode every entry past the checkpoint.
///
/// The walk stops at the first sentinel. Entries that look like garbage (a
/// payload over [`MAX_PAYLOAD`], a sequence jumping more than
/// [`MAX_SEQUENCE_JUMP`] past the ledger, a payload that doesn't parse)
/// truncate the log at that point: the good prefix is kept, a backup of the
/// original file is left beside it, and the ledger is rewritten.
///
/// Returns None when no log file exists.
pub fn read_log(path: &Path) -> Result<Option<Recovery>> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata().map_err(LatticeError::from)?.len();
    if len < WAL_HEADER_SIZE as u64 {
        return Ok(Some(Recovery {
            header: WalHeader::default(),
            records: Vec::new(),
            truncated: false,
        }));
    }

    let mut header_buf = [0u8; WAL_HEADER_SIZE];
    read_exact_at(&file, &mut header_buf, 0).map_err(LatticeError::from)?;
    let mut header = WalHeader::decode(&header_buf).ok_or(LatticeError::WalCorruption)?;

    // SAFETY: read-only map, and nothing else writes this file while the
    // store holds it (single writer by contract).
    let map = unsafe { Mmap::map(&file).map_err(LatticeError::from)? };
    let end = (len.min(header.last_valid_offset)) as usize;

    let mut records = Vec::new();
    let mut pos = WAL_HEADER_SIZE;
    let mut truncate_at = None;

    while pos + RECORD_HEADER_SIZE <= end {
        let rec_header = match RecordHeader::decode(&map[pos..pos + RECORD_HEADER_SIZE]) {
            Ok(Some(h)) => h,
            // Sentinel: clean end of log.
            Ok(None) => break,
            Err(()) => {
                truncate_at = Some(pos);
                break;
            }
        };

        if rec_header.data_size > MAX_PAYLOAD
            || rec_header.sequence > header.sequence + MAX_SEQUENCE_JUMP
        {
            truncate_at = Some(pos);
            break;
        }

        let payload_start = pos + RECORD_HEADER_SIZE;
        let payload_end = payload_start + rec_header.data_size as usize;
        if payload_end > end {
            truncate_at = Some(pos);
            break;
        }

        if rec_header.sequence <= header.checkpoint_sequence {
            // Already applied to the data file.
            pos = payload_end;
            continue;
        }

        match encoding::parse_record(&rec_header, &map[payload_start..payload_end]) {
            Some(WalRecord::Checkpoint) => {}
            Some(record) => records.push(record),
            None => {
                truncate_at = Some(pos);
                break;
            }
        }
        pos = payload_end;
    }

    drop(map);

    let truncated = if let Some(cut) = truncate_at {
        warn!(
            offset = cut,
            "wal has a corrupt tail; truncating (backup saved)"
        );
        let mut backup = path.as_os_str().to_owned();
        backup.push(".backup");
        if let Err(e) = fs::copy(path, Path::new(&backup)) {
            warn!(error = %e, "could not back up corrupt wal");
        }
        file.set_len(cut as u64).map_err(LatticeError::from)?;
        header.last_valid_offset = cut as u64;
        write_all_at(&file, &header.encode(), 0).map_err(LatticeError::from)?;
        write_all_at(&file, &[0u8; RECORD_HEADER_SIZE], cut as u64)
            .map_err(LatticeError::from)?;
        file.sync_data().map_err(LatticeError::from)?;
        true
    } else {
        false
    };

    Ok(Some(Recovery {
        header,
        records,
        truncated,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn wal_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("store.lat.wal")
    }

    #[test]
    fn append_flush_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        let mut wal = Wal::open(&path, WalOptions::default()).unwrap();
        wal.append_add_node(5, NodeType::Primitive, "ISA_A", b"x\0", 0).unwrap();
        wal.append_update_node(5, b"y\0").unwrap();
        wal.append_delete_node(5).unwrap();
        let seq = wal.append_add_child(1, 2).unwrap();
        assert_eq!(seq, 4);

        let reached = wal.flush().unwrap();
        assert_eq!(reached, 4);
        wal.shutdown();
        drop(wal);

        let rec = read_log(&path).unwrap().unwrap();
        assert!(!rec.truncated);
        assert_eq!(rec.header.sequence, 4);
        assert_eq!(rec.header.commit_count, 4);
        assert_eq!(rec.records.len(), 4);
        assert!(matches!(rec.records[0], WalRecord::AddNode { node_id: 5, .. }));
        assert!(matches!(rec.records[3], WalRecord::AddChild { parent_id: 1, child_id: 2 }));
    }

    #[test]
    fn synchronous_mode_is_durable_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        let options = WalOptions { batching: false, ..Default::default() };
        let wal = Wal::open(&path, options).unwrap();
        wal.append_add_node(1, NodeType::Primitive, "A_", b"\0", 0).unwrap();
        assert_eq!(wal.flushed_sequence(), 1);
        drop(wal);

        let rec = read_log(&path).unwrap().unwrap();
        assert_eq!(rec.records.len(), 1);
    }

    #[test]
    fn checkpoint_truncates_and_replay_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        let mut wal = Wal::open(&path, WalOptions::default()).unwrap();
        for i in 0..10u64 {
            wal.append_add_node(i + 1, NodeType::Primitive, "N_", b"\0", 0).unwrap();
        }
        wal.checkpoint().unwrap();
        wal.shutdown();
        drop(wal);

        let rec = read_log(&path).unwrap().unwrap();
        assert_eq!(rec.header.checkpoint_sequence, 10);
        assert!(rec.records.is_empty());

        // Appends after a checkpoint pick up the sequence where it left off.
        let wal = Wal::open(&path, WalOptions::default()).unwrap();
        let seq = wal.append_delete_node(3).unwrap();
        assert_eq!(seq, 11);
        wal.flush().unwrap();
        drop(wal);

        let rec = read_log(&path).unwrap().unwrap();
        assert_eq!(rec.records.len(), 1);
    }

    #[test]
    fn corrupt_tail_is_truncated_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        let mut wal = Wal::open(&path, WalOptions::default()).unwrap();
        wal.append_add_node(1, NodeType::Primitive, "A_", b"x\0", 0).unwrap();
        wal.append_add_node(2, NodeType::Primitive, "B_", b"y\0", 0).unwrap();
        wal.flush().unwrap();
        wal.shutdown();
        drop(wal);

        let rec = read_log(&path).unwrap().unwrap();
        assert_eq!(rec.records.len(), 2);

        // Stomp the second record's opcode. Both records have the same size:
        // header + (1 + 4 + 2 + 4 + 2 + 8) payload bytes.
        let first_len = RECORD_HEADER_SIZE + 1 + 4 + 2 + 4 + 2 + 8;
        let second = WAL_HEADER_SIZE + first_len;
        let mut bytes = fs::read(&path).unwrap();
        bytes[second + 8] = 0xEE;
        fs::write(&path, &bytes).unwrap();

        let rec = read_log(&path).unwrap().unwrap();
        assert!(rec.truncated);
        assert_eq!(rec.records.len(), 1);
        let mut backup = path.as_os_str().to_owned();
        backup.push(".backup");
        assert!(Path::new(&backup).exists());

        // A second walk sees a clean (already truncated) log.
        let rec = read_log(&path).unwrap().unwrap();
        assert!(!rec.truncated);
        assert_eq!(rec.records.len(), 1);
    }

    #[test]
    fn oversized_payload_field_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(&dir);

        let mut wal = Wal::open(&path, WalOptions::default()).unwrap();
        wal.append_add_node(1, NodeType::Primitive, "A_", b"\0", 0).unwrap();
        wal.flush().unwrap();
        wal.shutdown();
        drop(wal);

        let rec_before = read_log(&path).unwrap().unwrap();
        let valid_end = rec_before.header.last_valid_offset;

        // Forge a header claiming a 2 MB payload right after the good record
        // and extend the ledger over it.
        let forged = RecordHeader {
            sequence: 2,
            op: WalOp::UpdateNode,
            node_id: 1,
            data_size: 2 * 1024 * 1024,
        };
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        write_all_at(&file, &forged.encode(), valid_end).unwrap();
        let mut header = rec_before.header;
        header.sequence = 2;
        header.last_valid_offset = valid_end + (RECORD_HEADER_SIZE as u64) + 2 * 1024 * 1024;
        write_all_at(&file, &header.encode(), 0).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let rec = read_log(&path).unwrap().unwrap();
        assert!(rec.truncated);
        assert_eq!(rec.records.len(), 1);
    }
}
