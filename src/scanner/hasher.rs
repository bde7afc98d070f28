//! File hashing.
//!
//! # Overview
//!
//! Two digests are computed:
//!
//! - **Quick hash**: XXH64 of the first `N` bytes, combined with XXH64 of the
//!   last `N` bytes (only when the file is longer than `2N`) and the file size.
//!   Cheap, not collision resistant, used as a prefilter.
//! - **Full hash**: BLAKE3 over the whole file, streamed in 64 KiB chunks so
//!   a cancellation request is noticed between chunks.
//!
//! Only local files can be hashed; remote locations yield
//! [`HashError::Unsupported`].

use std::fs::File;
use std::hash::Hasher as _;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use twox_hash::XxHash64;

use super::{HashError, Location};
use crate::tasks::CancelToken;

/// Chunk size used when streaming a full hash.
pub const FULL_HASH_CHUNK: usize = 64 * 1024;

/// BLAKE3 digest of a whole file.
pub type FullHash = [u8; 32];

/// Computes quick and full hashes with a fixed quick-hash chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hasher {
    quick_chunk: usize,
}

impl Hasher {
    /// Create a hasher reading `quick_chunk` bytes from each end of a file.
    #[must_use]
    pub fn new(quick_chunk: usize) -> Self {
        Self { quick_chunk }
    }

    /// Bytes read from each end for the quick hash.
    #[must_use]
    pub fn quick_chunk(&self) -> usize {
        self.quick_chunk
    }

    /// Quick hash of a file of known `size`.
    ///
    /// # Errors
    ///
    /// Returns a [`HashError`] if the file cannot be opened or read, or if
    /// the location is remote.
    pub fn quick_hash(&self, location: &Location, size: u64) -> Result<u64, HashError> {
        let path = local_path(location)?;
        let mut file = File::open(path).map_err(|e| HashError::from_io(location, e))?;
        let chunk = self.quick_chunk as u64;

        let mut buffer = Vec::with_capacity(self.quick_chunk);
        (&mut file)
            .take(chunk)
            .read_to_end(&mut buffer)
            .map_err(|e| HashError::from_io(location, e))?;
        let mut combined = xxh64(&buffer, 0);

        if chunk > 0 && size > 2 * chunk {
            buffer.clear();
            file.seek(SeekFrom::Start(size - chunk))
                .map_err(|e| HashError::from_io(location, e))?;
            file.take(chunk)
                .read_to_end(&mut buffer)
                .map_err(|e| HashError::from_io(location, e))?;
            combined ^= xxh64(&buffer, 1).rotate_left(17);
        }

        Ok(combined ^ size)
    }

    /// Full BLAKE3 hash of a file.
    ///
    /// `cancel` is polled between chunks.
    ///
    /// # Errors
    ///
    /// Returns [`HashError::Cancelled`] if cancellation was requested, or
    /// another [`HashError`] if the file cannot be read.
    pub fn full_hash(
        &self,
        location: &Location,
        cancel: Option<&CancelToken>,
    ) -> Result<FullHash, HashError> {
        let path = local_path(location)?;
        let mut file = File::open(path).map_err(|e| HashError::from_io(location, e))?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; FULL_HASH_CHUNK];

        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(HashError::Cancelled);
            }
            let read = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(HashError::from_io(location, e)),
            };
            hasher.update(&buffer[..read]);
        }

        Ok(*hasher.finalize().as_bytes())
    }
}

fn local_path(location: &Location) -> Result<&Path, HashError> {
    location
        .as_path()
        .ok_or_else(|| HashError::Unsupported(location.clone()))
}

fn xxh64(data: &[u8], seed: u64) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(data);
    hasher.finish()
}

/// Hash as a lowercase hexadecimal string.
#[must_use]
pub fn hash_to_hex(hash: &FullHash) -> String {
    use std::fmt::Write;

    hash.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}
