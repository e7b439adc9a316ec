//! Error types for the name registry

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No pending commitment for account {account}")]
    NoPendingCommitment { account: String },

    #[error("Commitment delay not elapsed: reveal allowed at {earliest}, now {now}")]
    DelayNotElapsed { earliest: u64, now: u64 },

    #[error("Revealed name and salt do not match the pending commitment")]
    CommitmentMismatch,

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Name already registered: {name}")]
    NameAlreadyRegistered { name: String },

    #[error("Insufficient payment: required {required}, paid {paid}")]
    InsufficientPayment { required: u128, paid: u128 },

    #[error("Account {account} does not own {name}")]
    NotOwner { name: String, account: String },

    #[error("Renewal window for {name} is closed: opens at {opens_at}, expires at {expires_at}")]
    RenewalWindowClosed {
        name: String,
        opens_at: u64,
        expires_at: u64,
    },

    #[error("Name not registered: {name}")]
    NameNotRegistered { name: String },

    #[error("Name expired: {name}")]
    NameExpired { name: String },

    #[error("Payment mismatch: forwarded value {value}, paid {paid}")]
    PaymentMismatch { value: u128, paid: u128 },

    #[error("Forwarding to {name} failed: {reason}")]
    ForwardingFailed { name: String, reason: String },

    #[error("Recipient of {name} changed while the forwarded call was in flight")]
    RecipientChanged { name: String },

    #[error("Invalid caller: the unowned sentinel cannot act on the registry")]
    InvalidCaller,

    #[error("Invalid registry configuration: {0}")]
    InvalidConfig(String),

    #[error("Stale or reused nonce for {account}: expected {expected}, got {found}")]
    InvalidNonce {
        account: String,
        expected: u64,
        found: u64,
    },

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
