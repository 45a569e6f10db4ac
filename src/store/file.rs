//! Ordinarily I'd just make direct calls to the std::fs API, but the data
//! file needs a handful of things std doesn't give us in one place: positioned
//! reads and writes, a shared writable mapping, streaming access hints, and an
//! atomic-replace that also works on platforms which refuse to rename over a
//! mapped, open file. This module wraps all of that behind one handle.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::env;
use crate::record::{slot_offset, FileHeader, FILE_HEADER_SIZE, RECORD_SIZE};

/// Prefetch a window this large ...
const PREFETCH_WINDOW: u64 = 32 * 1024 * 1024;
/// ... every this many writes.
const PREFETCH_EVERY: u32 = 5000;

pub fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.write_all_at(data, offset)
    }
    #[cfg(not(unix))]
    {
        let mut f = file;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)
    }
}

pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        file.read_exact_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        let mut f = file;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf)
    }
}

/// Enforce write ordering. fsync is very slow on apple hardware (probably
/// because it isn't cheating), but apple platforms expose F_BARRIERFSYNC
/// which gives us the ordering we need without the full cost. std has no
/// wrapper for it, so we go through libc.
pub fn write_barrier(file: &File) -> io::Result<()> {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos"))]
    {
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_BARRIERFSYNC) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "tvos", target_os = "watchos")))]
    file.sync_data()
}

#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    writes_since_hint: u32,
}

impl DataFile {
    /// Open or create the data file. Returns the parsed header for existing
    /// non-empty files, or None for a fresh one. A non-empty file without the
    /// magic number is reported as `InvalidData` so the caller can refuse to
    /// clobber whatever it actually is.
    pub fn open(path: &Path) -> io::Result<(DataFile, Option<FileHeader>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let header = if len >= FILE_HEADER_SIZE as u64 {
            let mut buf = [0u8; FILE_HEADER_SIZE];
            read_exact_at(&file, &mut buf, 0)?;
            match FileHeader::decode(&buf) {
                Some(h) => Some(h),
                None => return Err(io::Error::new(ErrorKind::InvalidData, "bad magic")),
            }
        } else {
            None
        };

        Ok((
            DataFile {
                path: path.to_path_buf(),
                file,
                map: None,
                writes_since_hint: 0,
            },
            header,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    pub fn write_header(&mut self, header: &FileHeader) -> io::Result<()> {
        let bytes = header.encode();
        if let Some(map) = &mut self.map {
            map[..FILE_HEADER_SIZE].copy_from_slice(&bytes);
        } else {
            write_all_at(&self.file, &bytes, 0)?;
        }
        Ok(())
    }

    /// Grow the file to hold `slots` records (plus header) and establish the
    /// shared writable mapping used in disk mode.
    pub fn map_for_slots(&mut self, slots: u32) -> io::Result<()> {
        let want = slot_offset(slots);
        let len = self.len()?;
        if len < want {
            self.file.set_len(want)?;
        }
        // SAFETY: single writer by contract. The mapping stays valid until we
        // drop it ourselves (see replace_with), and the file is never
        // truncated below the mapped length while mapped.
        let map = unsafe { MmapMut::map_mut(&self.file)? };
        self.map = Some(map);
        self.advise_sequential();
        Ok(())
    }

    /// The mapped bytes of record slot `index`, if a mapping exists and the
    /// slot is inside it.
    pub fn slot_bytes(&self, index: u32) -> Option<&[u8]> {
        let map = self.map.as_ref()?;
        let start = slot_offset(index) as usize;
        let end = start + RECORD_SIZE;
        if end > map.len() {
            return None;
        }
        Some(&map[start..end])
    }

    pub fn slot_bytes_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        let map = self.map.as_mut()?;
        let start = slot_offset(index) as usize;
        let end = start + RECORD_SIZE;
        if end > map.len() {
            return None;
        }
        Some(&mut map[start..end])
    }

    /// How many whole record slots the current file length can hold.
    pub fn slot_capacity(&self) -> io::Result<u32> {
        let len = self.len()?;
        Ok((len.saturating_sub(FILE_HEADER_SIZE as u64) / RECORD_SIZE as u64) as u32)
    }

    /// Positioned read of one record slot, for RAM mode cache misses. Reads
    /// through the file descriptor, not the mapping.
    pub fn read_slot(&self, index: u32, buf: &mut [u8; RECORD_SIZE]) -> io::Result<()> {
        read_exact_at(&self.file, buf, slot_offset(index))
    }

    pub fn advise_sequential(&self) {
        #[cfg(target_os = "linux")]
        {
            let len = self.len().unwrap_or(0) as libc::off_t;
            unsafe {
                libc::posix_fadvise(self.file.as_raw_fd(), 0, len, libc::POSIX_FADV_SEQUENTIAL);
            }
        }
    }

    /// Streaming write pattern hint: every [`PREFETCH_EVERY`] writes, ask the
    /// kernel to start faulting in the next window so the write path doesn't
    /// stall on major page faults.
    pub fn note_write(&mut self, next_slot: u32) {
        self.writes_since_hint += 1;
        if self.writes_since_hint < PREFETCH_EVERY {
            return;
        }
        self.writes_since_hint = 0;
        self.prefetch(slot_offset(next_slot), PREFETCH_WINDOW);
    }

    pub fn prefetch(&self, offset: u64, len: u64) {
        #[cfg(target_os = "linux")]
        {
            let file_len = self.len().unwrap_or(0);
            if offset >= file_len {
                return;
            }
            let len = len.min(file_len - offset);
            if let Some(map) = &self.map {
                let start = offset as usize;
                let end = (offset + len) as usize;
                if end <= map.len() {
                    unsafe {
                        libc::madvise(
                            map.as_ptr().add(start) as *mut libc::c_void,
                            end - start,
                            libc::MADV_WILLNEED,
                        );
                    }
                }
            } else {
                unsafe {
                    libc::posix_fadvise(
                        self.file.as_raw_fd(),
                        offset as libc::off_t,
                        len as libc::off_t,
                        libc::POSIX_FADV_WILLNEED,
                    );
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (offset, len);
        }
    }

    pub fn sync(&mut self) -> io::Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        self.file.sync_data()
    }

    /// Atomically replace this file's contents with the finished snapshot at
    /// `tmp_path`.
    ///
    /// On POSIX a plain rename over the open file is fine: our descriptor
    /// keeps referring to the old inode until we reopen. Platforms with
    /// rename-over-open-handle restrictions need the long way around:
    /// flush, unmap, close, replace, reopen, remap.
    pub fn replace_with(&mut self, tmp_path: &Path) -> io::Result<()> {
        let had_map = self.map.is_some();

        #[cfg(unix)]
        {
            fs::rename(tmp_path, &self.path)?;
            self.reopen(had_map)
        }

        #[cfg(not(unix))]
        {
            if let Some(map) = &self.map {
                map.flush()?;
            }
            self.file.sync_data()?;
            self.map = None;
            // File has no explicit close; swap a handle to the snapshot in
            // so the old descriptor on the destination actually drops before
            // the rename.
            let placeholder = File::open(tmp_path)?;
            drop(std::mem::replace(&mut self.file, placeholder));
            fs::rename(tmp_path, &self.path)?;
            self.reopen(had_map)
        }
    }

    fn reopen(&mut self, remap: bool) -> io::Result<()> {
        self.map = None;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        if remap {
            // SAFETY: same single-writer contract as map_for_slots.
            let map = unsafe { MmapMut::map_mut(&self.file)? };
            self.map = Some(map);
        }
        if env::verbose() {
            debug!(path = %self.path.display(), "reopened data file after snapshot replace");
        }
        Ok(())
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(error = %e, "final data file sync failed");
        }
    }
}

/// Write a complete snapshot to `<path>.tmp` and return the temp path. The
/// caller passes a writer closure so this function owns the
/// create-write-fsync protocol and nothing else.
pub fn write_snapshot(
    path: &Path,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<PathBuf> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    write(&mut file)?;
    file.sync_all()?;
    Ok(tmp)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::FILE_MAGIC;
    use std::io::Write;

    #[test]
    fn open_create_and_header_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.lat");

        let (mut df, header) = DataFile::open(&path).unwrap();
        assert!(header.is_none());

        let h = FileHeader { node_count: 3, next_local_id: 4, nodes_to_load: 3 };
        df.write_header(&h).unwrap();
        df.sync().unwrap();
        drop(df);

        let (_df, header) = DataFile::open(&path).unwrap();
        assert_eq!(header, Some(h));
    }

    #[test]
    fn bad_magic_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notours.bin");
        fs::write(&path, b"this is not a lattice file at all").unwrap();

        let err = DataFile::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn mapped_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.lat");

        let (mut df, _) = DataFile::open(&path).unwrap();
        df.map_for_slots(10).unwrap();
        assert_eq!(df.slot_capacity().unwrap(), 10);

        df.slot_bytes_mut(3).unwrap()[0] = 0xAB;
        assert_eq!(df.slot_bytes(3).unwrap()[0], 0xAB);
        assert!(df.slot_bytes(10).is_none());

        // The positioned read path sees mapped writes once flushed.
        df.sync().unwrap();
        let mut buf = [0u8; RECORD_SIZE];
        df.read_slot(3, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn snapshot_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.lat");

        let (mut df, _) = DataFile::open(&path).unwrap();
        let h = FileHeader { node_count: 0, next_local_id: 1, nodes_to_load: 0 };
        df.write_header(&h).unwrap();
        df.sync().unwrap();

        let new_header = FileHeader { node_count: 7, next_local_id: 8, nodes_to_load: 7 };
        let tmp = write_snapshot(&path, |f| {
            f.write_all(&new_header.encode())?;
            Ok(())
        })
        .unwrap();
        df.replace_with(&tmp).unwrap();

        let mut buf = [0u8; FILE_HEADER_SIZE];
        read_exact_at(&df.file, &mut buf, 0).unwrap();
        let read_back = FileHeader::decode(&buf).unwrap();
        assert_eq!(read_back, new_header);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), FILE_MAGIC);
    }
}
