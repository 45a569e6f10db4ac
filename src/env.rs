//! Environment knobs. These are read once on first use and cached, so toggling
//! them mid-process has no effect.

use lazy_static::lazy_static;

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}

lazy_static! {
    static ref VERBOSE: bool = env_flag("SYNRIX_VERBOSE");
    static ref WAL_VERBOSE: bool = env_flag("SYNRIX_WAL_VERBOSE");
}

/// True when `SYNRIX_VERBOSE` is set to a non-empty, non-"0" value.
pub fn verbose() -> bool {
    *VERBOSE
}

/// True when `SYNRIX_WAL_VERBOSE` is set to a non-empty, non-"0" value.
pub fn wal_verbose() -> bool {
    *WAL_VERBOSE
}

/// The license key from `SYNRIX_LICENSE_KEY`, if any. The key is opaque to
/// this crate. We only ever hash it to derive the usage counter filename.
pub fn license_key() -> Option<String> {
    std::env::var("SYNRIX_LICENSE_KEY").ok().filter(|k| !k.is_empty())
}
