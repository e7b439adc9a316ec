//! Commit-reveal digests

use crate::types::{AccountId, Digest, Name, Salt};
use sha3::{Digest as _, Keccak256};

/// Keccak-256 over `committer || canonical name || salt`, each fixed at 32 bytes.
///
/// The committer is part of the preimage so a revealed `(name, salt)` pair cannot be
/// replayed by another account.
pub fn commitment_hash(committer: &AccountId, name: &Name, salt: &Salt) -> Digest {
    let mut hasher = Keccak256::new();
    hasher.update(committer.as_bytes());
    hasher.update(name.canonical().as_bytes());
    hasher.update(salt.as_bytes());
    Digest(hasher.finalize().into())
}

pub fn verify_commitment(
    expected: &Digest,
    committer: &AccountId,
    name: &Name,
    salt: &Salt,
) -> bool {
    !expected.is_empty() && commitment_hash(committer, name, salt) == *expected
}
