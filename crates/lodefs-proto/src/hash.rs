//! Directory name hashing.
//!
//! Edges sort by a 64-bit hash of their name; the hash function is recorded
//! per directory so it can evolve without rehashing existing directories.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::LodeError;

/// Name hash function of a directory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashMode {
    /// xxh3 truncated to its low 63 bits.
    Xxh3_63 = 1,
}

impl HashMode {
    pub fn from_u8(x: u8) -> Result<HashMode, LodeError> {
        match x {
            1 => Ok(HashMode::Xxh3_63),
            _ => Err(LodeError::BadEncoding),
        }
    }
}

/// Hashes an edge name under the directory's hash mode.
pub fn name_hash(mode: HashMode, name: &[u8]) -> u64 {
    match mode {
        HashMode::Xxh3_63 => xxh3_64(name) & ((1 << 63) - 1),
    }
}
