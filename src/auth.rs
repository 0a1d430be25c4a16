//! Passphrase hashing for add-on authorship.
//!
//! Each add-on stores a random salt and the salted digest of its
//! passphrase; the cleartext is never written to disk. Legacy metadata
//! carrying a cleartext `passphrase` attribute is migrated on load.

use rand::RngCore;

use crate::digest::sha256_hex;

const SALT_BYTES: usize = 16;

/// Generates a fresh `(salt, hash)` pair for a passphrase.
pub fn generate_hash(passphrase: &str) -> (String, String) {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let salt: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let hash = hash_with_salt(&salt, passphrase);
    (salt, hash)
}

/// Recomputes the digest for a stored salt and compares.
pub fn verify_passphrase(passphrase: &str, salt: &str, hash: &str) -> bool {
    !salt.is_empty() && !hash.is_empty() && hash_with_salt(salt, passphrase) == hash
}

fn hash_with_salt(salt: &str, passphrase: &str) -> String {
    sha256_hex(format!("{salt}{passphrase}"))
}
