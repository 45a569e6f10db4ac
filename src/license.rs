//! The admission gate: a per-machine node counter that enforces the free
//! tier cap across every process sharing the machine.
//!
//! The counter lives in a tiny text file (two decimal lines, `total` then
//! `limit`) under the user's cache directory, keyed by a hash of the license
//! key so different keys get different counters. Every access is bracketed by
//! an exclusive advisory lock, which makes increment-and-rewrite atomic with
//! respect to other processes. A missing or garbled file is treated as
//! `{total: 0, limit: <caller's limit>}` rather than an error; the gate
//! should never brick a store over a corrupt counter.
//!
//! Ed25519 signature checking happens outside this crate. We only consume the
//! parsed result: a `{limit, unlimited}` pair, plus the raw 6 byte payload
//! layout for callers that verify signatures themselves.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use lazy_static::lazy_static;
use tracing::warn;

use crate::env;
use crate::error::{LatticeError, Result};

/// Default admission cap while no license has been applied.
pub const DEFAULT_FREE_TIER_LIMIT: u32 = 25_000;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the key bytes. This only has to be stable and well spread
/// enough to name counter files, so a cryptographic hash would be overkill.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The parsed license result the core consumes. Produced by the embedding
/// application after it has verified the signature.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LicenseInfo {
    pub limit: u32,
    pub unlimited: bool,
}

/// Tier table: 0 -> 100k, 1 -> 1M, 2 -> 10M, 3 -> 50M, 4 -> unlimited.
/// Unknown tiers are invalid.
pub fn tier_limit(tier: u8) -> Result<LicenseInfo> {
    let info = match tier {
        0 => LicenseInfo { limit: 100_000, unlimited: false },
        1 => LicenseInfo { limit: 1_000_000, unlimited: false },
        2 => LicenseInfo { limit: 10_000_000, unlimited: false },
        3 => LicenseInfo { limit: 50_000_000, unlimited: false },
        4 => LicenseInfo { limit: 0, unlimited: true },
        _ => return Err(LatticeError::LicenseInvalid),
    };
    Ok(info)
}

/// The 6 byte license payload that precedes the signature:
/// `version: u8 | tier: u8 | expiry: u32 LE` (unix seconds).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LicensePayload {
    pub version: u8,
    pub tier: u8,
    pub expiry: u32,
}

pub const LICENSE_PAYLOAD_SIZE: usize = 6;

/// Decode a payload the caller has already signature-verified.
pub fn decode_payload(bytes: &[u8]) -> Result<LicensePayload> {
    if bytes.len() < LICENSE_PAYLOAD_SIZE {
        return Err(LatticeError::LicenseInvalid);
    }
    Ok(LicensePayload {
        version: bytes[0],
        tier: bytes[1],
        expiry: u32::from_le_bytes(bytes[2..6].try_into().unwrap()),
    })
}

lazy_static! {
    static ref COUNTER_DIR: Option<PathBuf> = counter_dir();
}

#[cfg(windows)]
fn counter_dir() -> Option<PathBuf> {
    let base = std::env::var_os("LOCALAPPDATA")?;
    Some(PathBuf::from(base).join("Synrix").join("license_usage"))
}

#[cfg(not(windows))]
fn counter_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".synrix").join("license_usage"))
}

fn lock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        file.lock()
    }
}

fn unlock(file: &File) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file.unlock();
    }
}

/// Parse the two decimal lines. Anything unexpected degrades to
/// `{0, fallback_limit}`.
fn parse_counter(contents: &str, fallback_limit: u64) -> (u64, u64) {
    let mut lines = contents.lines();
    let total = lines.next().and_then(|l| l.trim().parse::<u64>().ok());
    let limit = lines.next().and_then(|l| l.trim().parse::<u64>().ok());
    match (total, limit) {
        (Some(t), Some(l)) => (t, l),
        _ => (0, fallback_limit),
    }
}

fn rewrite_counter(file: &mut File, total: u64, limit: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    write!(file, "{}\n{}\n", total, limit)?;
    file.flush()
}

/// The counter filename for a key: 16 hex digits of the lowercased key's
/// FNV-1a hash.
pub fn counter_file_name(key: &str) -> String {
    format!("{:016x}.dat", fnv1a_64(key.to_lowercase().as_bytes()))
}

/// In-process license and tier state for one lattice, plus the handle to the
/// machine-wide counter file.
#[derive(Debug)]
pub struct LicenseState {
    key: String,
    counter_path: Option<PathBuf>,
    pub evaluation_mode: bool,
    pub free_tier_limit: u32,
    pub license_verified_unlimited: bool,
}

impl LicenseState {
    /// `key` defaults to `SYNRIX_LICENSE_KEY`, then the literal `"free"`.
    pub fn new(key: Option<&str>) -> Self {
        let key = key
            .map(str::to_owned)
            .or_else(env::license_key)
            .unwrap_or_else(|| "free".to_owned());
        Self::with_key(key)
    }

    fn with_key(key: String) -> Self {
        let counter_path = COUNTER_DIR
            .as_ref()
            .map(|dir| dir.join(counter_file_name(&key)));
        if counter_path.is_none() {
            warn!("no home or appdata directory found; license counter disabled");
        }
        Self {
            key,
            counter_path,
            evaluation_mode: true,
            free_tier_limit: DEFAULT_FREE_TIER_LIMIT,
            license_verified_unlimited: false,
        }
    }

    /// Re-key the counter after `set_license_key`.
    pub fn set_key(&mut self, key: &str) {
        let dir = self
            .counter_path
            .as_ref()
            .and_then(|p| p.parent().map(|d| d.to_path_buf()));
        self.key = key.to_owned();
        self.counter_path = dir.map(|d| d.join(counter_file_name(key)));
    }

    /// Apply an externally verified license result.
    pub fn apply_verified(&mut self, info: LicenseInfo) {
        if info.unlimited {
            self.evaluation_mode = false;
            self.free_tier_limit = 0;
            self.license_verified_unlimited = true;
        } else {
            self.free_tier_limit = info.limit;
        }
    }

    /// Only succeeds once an unlimited license has been verified.
    pub fn disable_evaluation_mode(&mut self) -> Result<()> {
        if !self.license_verified_unlimited {
            return Err(LatticeError::LicenseInvalid);
        }
        self.evaluation_mode = false;
        Ok(())
    }

    fn open_counter(&self) -> Result<Option<File>> {
        let Some(path) = &self.counter_path else {
            return Ok(None);
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(LatticeError::from)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(LatticeError::from)?;
        Ok(Some(file))
    }

    /// Sum a freshly loaded store's node count into the machine-wide total.
    /// Called once per `init`.
    pub fn register(&self, count: u64) -> Result<()> {
        if self.license_verified_unlimited {
            return Ok(());
        }
        let Some(mut file) = self.open_counter()? else {
            return Ok(());
        };
        lock_exclusive(&file)?;
        let result = (|| {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let (total, limit) = parse_counter(&contents, self.free_tier_limit as u64);
            rewrite_counter(&mut file, total + count, limit)
        })();
        unlock(&file);
        result.map_err(LatticeError::from)
    }

    /// The hard gate on every add path. Takes the lock, rereads the counter,
    /// rejects at the stored limit, otherwise increments and rewrites.
    pub fn admit_one(&self) -> Result<()> {
        if self.license_verified_unlimited || !self.evaluation_mode {
            return Ok(());
        }
        let Some(mut file) = self.open_counter()? else {
            return Ok(());
        };
        lock_exclusive(&file)?;
        let result = (|| -> io::Result<Result<()>> {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let (total, limit) = parse_counter(&contents, self.free_tier_limit as u64);
            if total >= limit {
                return Ok(Err(LatticeError::FreeTierLimit));
            }
            rewrite_counter(&mut file, total + 1, limit)?;
            Ok(Ok(()))
        })();
        unlock(&file);
        match result {
            Ok(inner) => inner,
            Err(e) => Err(LatticeError::from(e)),
        }
    }

    /// Point the counter at a different directory. Embedders that relocate
    /// their cache use this; so do tests.
    pub fn set_counter_dir(&mut self, dir: &std::path::Path) {
        self.counter_path = Some(dir.join(counter_file_name(&self.key)));
    }

    pub fn counter_path(&self) -> Option<&std::path::Path> {
        self.counter_path.as_deref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fnv_matches_reference_vectors() {
        // Standard FNV-1a 64 test vectors.
        assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn tier_table() {
        assert_eq!(tier_limit(0).unwrap(), LicenseInfo { limit: 100_000, unlimited: false });
        assert_eq!(tier_limit(3).unwrap(), LicenseInfo { limit: 50_000_000, unlimited: false });
        assert!(tier_limit(4).unwrap().unlimited);
        assert_eq!(tier_limit(9), Err(LatticeError::LicenseInvalid));
    }

    #[test]
    fn payload_decode() {
        let bytes = [1u8, 2, 0x78, 0x56, 0x34, 0x12];
        let p = decode_payload(&bytes).unwrap();
        assert_eq!(p.version, 1);
        assert_eq!(p.tier, 2);
        assert_eq!(p.expiry, 0x12345678);

        assert_eq!(decode_payload(&[1, 2]), Err(LatticeError::LicenseInvalid));
    }

    #[test]
    fn garbled_counter_degrades_to_zero() {
        assert_eq!(parse_counter("5\n10\n", 99), (5, 10));
        assert_eq!(parse_counter("garbage", 99), (0, 99));
        assert_eq!(parse_counter("", 99), (0, 99));
        assert_eq!(parse_counter("7\n", 99), (0, 99));
    }

    #[test]
    fn unlimited_license_disables_gating() {
        let mut state = LicenseState::new(Some("test-key"));
        assert!(state.evaluation_mode);
        assert!(state.disable_evaluation_mode().is_err());

        state.apply_verified(LicenseInfo { limit: 0, unlimited: true });
        assert!(!state.evaluation_mode);
        assert_eq!(state.free_tier_limit, 0);
        assert!(state.disable_evaluation_mode().is_ok());
        assert!(state.admit_one().is_ok());
    }
}
