//! Content hashing helpers.
//!
//! The authoritative content hash carried in an [`Entry`](crate::Entry)
//! is Blake2b-256. MD5 appears only as the hex form field of a file
//! upload, where the receiver uses it for a cheap short-circuit check.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use md5::Md5;

type Blake2b256 = Blake2b<U32>;

/// Byte width of the authoritative content hash.
pub const CONTENT_HASH_LEN: usize = 32;

/// Blake2b-256 of an in-memory buffer.
pub fn content_hash(bytes: &[u8]) -> Vec<u8> {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hasher.finalize().to_vec()
}

/// Blake2b-256 of a file on disk, streamed in 64 KiB blocks.
pub fn content_hash_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Blake2b256::new();
    let mut block = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// MD5 hex digest of a file, used as the `HASH` upload form field.
pub fn upload_digest(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Md5::new();
    let mut block = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// MD5 hex digest of an in-memory buffer.
pub fn upload_digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
