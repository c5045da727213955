//! Join-secret hashing.
//!
//! Session join secrets never travel in the clear: both roles hash the
//! configured passphrase and only the hashes are compared.

use sha2::{Digest, Sha256};

/// Hash a session passphrase to its lowercase hex digest.
///
/// An empty passphrase is valid (open session) and hashes like any other
/// string, so the comparison on the host stays uniform.
pub fn hash_secret(passphrase: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passphrase.as_bytes());
    hex::encode(hasher.finalize())
}
