//! Content digests.

use md5::{Digest as _, Md5};
use sha2::Sha256;

/// Lowercase hex MD5 of `data`. Pack and index filenames are derived from
/// this, so the casing and encoding are part of the on-disk format.
pub fn md5_hex(data: impl AsRef<[u8]>) -> String {
    to_hex(&Md5::digest(data.as_ref()))
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    to_hex(&Sha256::digest(data.as_ref()))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
