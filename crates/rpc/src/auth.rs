//! Request signatures for mutating API calls.
//!
//! Account ids double as ed25519 verifying keys. A client signs
//! `SHA-256(domain_tag || account || nonce || fields)` where the tag names the
//! operation, so a signature produced for one operation can never be replayed
//! against another. The nonce is the account's next ledger nonce and is consumed
//! by the server, so each signed body is accepted at most once.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use vanity_name_registry::{AccountId, Amount, Digest, Name, Salt};

pub const COMMIT_TAG: &[u8] = b"VANITY_COMMIT";
pub const REVEAL_TAG: &[u8] = b"VANITY_REVEAL";
pub const RENEW_TAG: &[u8] = b"VANITY_RENEW";
pub const RELEASE_TAG: &[u8] = b"VANITY_RELEASE";
pub const FORWARD_TAG: &[u8] = b"VANITY_FORWARD";
pub const WITHDRAW_TAG: &[u8] = b"VANITY_WITHDRAW";

pub const SIGNATURE_BYTES: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("request signature is required")]
    MissingSignature,
    #[error("signature must be a {SIGNATURE_BYTES}-byte hex string")]
    MalformedSignature,
    #[error("account {0} is not a valid ed25519 key")]
    InvalidAccountKey(AccountId),
    #[error("signature does not match account {0}")]
    BadSignature(AccountId),
}

/// Digest an operation tag and its fields.
pub fn signing_digest(tag: &[u8], fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    for field in fields {
        hasher.update(field);
    }
    hasher.finalize().into()
}

pub fn commit_digest(committer: &AccountId, nonce: u64, commitment: &Digest) -> [u8; 32] {
    signing_digest(
        COMMIT_TAG,
        &[committer.as_bytes(), &nonce.to_be_bytes(), commitment.as_bytes()],
    )
}

pub fn reveal_digest(
    committer: &AccountId,
    nonce: u64,
    name: &Name,
    salt: &Salt,
    paid: Amount,
) -> [u8; 32] {
    signing_digest(
        REVEAL_TAG,
        &[
            committer.as_bytes(),
            &nonce.to_be_bytes(),
            name.canonical().as_bytes(),
            salt.as_bytes(),
            &paid.to_be_bytes(),
        ],
    )
}

pub fn renew_digest(caller: &AccountId, nonce: u64, name: &Name) -> [u8; 32] {
    signing_digest(
        RENEW_TAG,
        &[caller.as_bytes(), &nonce.to_be_bytes(), name.canonical().as_bytes()],
    )
}

pub fn release_digest(caller: &AccountId, nonce: u64, name: &Name) -> [u8; 32] {
    signing_digest(
        RELEASE_TAG,
        &[caller.as_bytes(), &nonce.to_be_bytes(), name.canonical().as_bytes()],
    )
}

pub fn forward_digest(
    caller: &AccountId,
    nonce: u64,
    name: &Name,
    value: Amount,
    paid: Amount,
    payload: &[u8],
) -> [u8; 32] {
    signing_digest(
        FORWARD_TAG,
        &[
            caller.as_bytes(),
            &nonce.to_be_bytes(),
            name.canonical().as_bytes(),
            &value.to_be_bytes(),
            &paid.to_be_bytes(),
            payload,
        ],
    )
}

pub fn withdraw_digest(account: &AccountId, nonce: u64) -> [u8; 32] {
    signing_digest(WITHDRAW_TAG, &[account.as_bytes(), &nonce.to_be_bytes()])
}

/// Account id corresponding to a signing key.
pub fn account_of(key: &SigningKey) -> AccountId {
    AccountId::new(key.verifying_key().to_bytes())
}

/// Hex signature over `digest`, as sent in request bodies.
pub fn sign_digest(key: &SigningKey, digest: &[u8; 32]) -> String {
    hex::encode(key.sign(digest).to_bytes())
}

/// Check that `signature` (hex) was produced by `account` over `digest`.
pub fn verify_signature(
    account: &AccountId,
    digest: &[u8; 32],
    signature: Option<&str>,
) -> Result<(), AuthError> {
    let signature = signature.ok_or(AuthError::MissingSignature)?;
    let normalized = signature
        .strip_prefix("0x")
        .or_else(|| signature.strip_prefix("0X"))
        .unwrap_or(signature)
        .trim();
    let mut bytes = [0u8; SIGNATURE_BYTES];
    hex::decode_to_slice(normalized, &mut bytes).map_err(|_| AuthError::MalformedSignature)?;

    let key = VerifyingKey::from_bytes(account.as_bytes())
        .map_err(|_| AuthError::InvalidAccountKey(*account))?;
    key.verify(digest, &Signature::from_bytes(&bytes))
        .map_err(|_| AuthError::BadSignature(*account))
}
