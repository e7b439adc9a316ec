//! Types for the name registry

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width in bytes of the fixed name encoding.
pub const NAME_BYTES: usize = 32;
/// Number of raw bytes in an account identifier.
pub const ACCOUNT_BYTES: usize = 32;
/// Expected string length of an encoded account (prefix + 64 hex chars).
pub const ACCOUNT_STRING_LENGTH: usize = 1 + ACCOUNT_BYTES * 2;

/// Token amount in the registry's smallest unit.
pub type Amount = u128;
/// Seconds since the UNIX epoch.
pub type Timestamp = u64;

/// Errors that can occur when parsing fixed-width identifiers from text.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseIdError {
    #[error("account must be {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("payload is not valid hexadecimal")]
    InvalidHex,
}

/// 32-byte account identifier (an ed25519 verifying key on the API surface).
///
/// Text form is `i` followed by 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(pub [u8; ACCOUNT_BYTES]);

impl AccountId {
    /// Sentinel stored in place of an owner when nothing owns a record.
    pub const UNOWNED: AccountId = AccountId([0u8; ACCOUNT_BYTES]);

    pub fn new(bytes: [u8; ACCOUNT_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ACCOUNT_BYTES] {
        &self.0
    }

    pub fn is_unowned(&self) -> bool {
        *self == Self::UNOWNED
    }

    /// Encode into the human readable `i<hex>` form.
    pub fn encode(&self) -> String {
        let mut encoded = String::with_capacity(ACCOUNT_STRING_LENGTH);
        encoded.push('i');
        encoded.push_str(&hex::encode(self.0));
        encoded
    }

    /// Decode the `i<hex>` form. Bare or `0x`-prefixed hex is accepted as well.
    pub fn decode(value: &str) -> Result<Self, ParseIdError> {
        let value = value.trim();
        let payload = if value.len() == ACCOUNT_STRING_LENGTH && value.starts_with('i') {
            &value[1..]
        } else {
            value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value)
        };
        decode_fixed_hex(payload, ACCOUNT_STRING_LENGTH).map(Self)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.encode())
    }
}

impl From<[u8; ACCOUNT_BYTES]> for AccountId {
    fn from(value: [u8; ACCOUNT_BYTES]) -> Self {
        Self(value)
    }
}

impl From<AccountId> for String {
    fn from(value: AccountId) -> Self {
        value.encode()
    }
}

impl TryFrom<String> for AccountId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

fn decode_fixed_hex(payload: &str, reported_len: usize) -> Result<[u8; 32], ParseIdError> {
    if payload.len() != 64 {
        return Err(ParseIdError::InvalidLength {
            expected: reported_len,
            actual: payload.len(),
        });
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(payload, &mut out).map_err(|_| ParseIdError::InvalidHex)?;
    Ok(out)
}

macro_rules! hex_bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(value: &str) -> Result<Self, ParseIdError> {
                let value = value.trim();
                let payload = value
                    .strip_prefix("0x")
                    .or_else(|| value.strip_prefix("0X"))
                    .unwrap_or(value);
                decode_fixed_hex(payload, 64).map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_hex()
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseIdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::from_hex(&value)
            }
        }
    };
}

hex_bytes32!(
    /// Commitment digest produced by [`crate::commitment_hash`].
    Digest
);

hex_bytes32!(
    /// Secret mixed into a commitment so the name cannot be guessed from the digest.
    Salt
);

impl Digest {
    /// Sentinel meaning "no commitment".
    pub const EMPTY: Digest = Digest([0u8; 32]);

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

/// Fixed-width name encoding.
///
/// A zero byte terminates the name; everything from the first zero onward is padding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(pub [u8; NAME_BYTES]);

impl Name {
    pub fn from_bytes(bytes: [u8; NAME_BYTES]) -> Self {
        Self(bytes)
    }

    /// Copy a string into the fixed-width encoding.
    ///
    /// Fails only when the string does not fit. Character validation is separate, see
    /// [`crate::is_valid_name`].
    pub fn parse(value: &str) -> crate::Result<Self> {
        let raw = value.as_bytes();
        if raw.len() > NAME_BYTES {
            return Err(crate::RegistryError::InvalidName {
                name: value.to_string(),
                reason: format!("encoded name is {} bytes, limit is {NAME_BYTES}", raw.len()),
            });
        }
        let mut bytes = [0u8; NAME_BYTES];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NAME_BYTES] {
        &self.0
    }

    /// Bytes before the terminator.
    pub fn visible(&self) -> &[u8] {
        &self.0[..crate::name_length(self)]
    }

    /// Same name with every byte after the first terminator zeroed.
    pub fn canonical(&self) -> Self {
        let len = crate::name_length(self);
        let mut bytes = [0u8; NAME_BYTES];
        bytes[..len].copy_from_slice(&self.0[..len]);
        Self(bytes)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.visible()))
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", String::from_utf8_lossy(self.visible()))
    }
}

impl From<Name> for String {
    fn from(value: Name) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Name {
    type Error = crate::RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl std::str::FromStr for Name {
    type Err = crate::RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Outstanding commit-phase entry for one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommitment {
    pub commitment: Digest,
    pub earliest_reveal_time: Timestamp,
}

/// A registered name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: Name,
    pub owner: AccountId,
    pub expiration: Timestamp,
    pub amount_locked: Amount,
}

impl Registration {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiration
    }
}

/// Per-account balances and name history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLedger {
    /// Sum of `amount_locked` over the account's live registrations.
    pub total_locked: Amount,
    /// Released funds awaiting [`crate::NameRegistry::withdraw`].
    pub free_balance: Amount,
    /// Names ever attributed to the account, in first-registration order.
    ///
    /// Entries are not removed on release or expiry; use
    /// [`crate::NameRegistry::owns`] for live membership.
    pub owned_names: Vec<Name>,
    /// Next request nonce the account must sign with.
    #[serde(default)]
    pub nonce: u64,
}

impl AccountLedger {
    /// True for a ledger that carries nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        self.total_locked == 0
            && self.free_balance == 0
            && self.owned_names.is_empty()
            && self.nonce == 0
    }
}

/// Result of a successful reveal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    pub registration: Registration,
    /// Payment in excess of the price, returned to the committer.
    pub refund: Amount,
}

/// A value-bearing call addressed to a name's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedCall {
    pub from: AccountId,
    pub to: AccountId,
    pub name: Name,
    pub value: Amount,
    #[serde(with = "hex_payload")]
    pub payload: Vec<u8>,
}

/// Result of a successful forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardReceipt {
    pub name: Name,
    pub recipient: AccountId,
    pub value: Amount,
    #[serde(with = "hex_payload")]
    pub output: Vec<u8>,
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub registrations: usize,
    pub pending_commitments: usize,
    pub total_locked: Amount,
    pub total_withdrawable: Amount,
    pub total_forwarded: Amount,
}

/// Complete registry state, used for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub pending: Vec<(AccountId, PendingCommitment)>,
    pub registrations: Vec<Registration>,
    pub ledgers: Vec<(AccountId, AccountLedger)>,
    #[serde(default)]
    pub total_forwarded: Amount,
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(value.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
