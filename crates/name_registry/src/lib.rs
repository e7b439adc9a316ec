//! Vanity Name Registry
//!
//! Accounts claim short human-readable names through a commit-reveal exchange:
//! commit to `keccak(account || name || salt)`, wait out the reveal delay, then
//! reveal with payment. Names are priced by length, renewed by their owner inside
//! a window before expiry, and released into a withdrawable balance. A registered
//! name can be used as a stable address for forwarding value-bearing calls.

pub mod clock;
pub mod commitment;
pub mod config;
pub mod errors;
pub mod forwarding;
pub mod name;
pub mod pricing;
pub mod registry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use commitment::{commitment_hash, verify_commitment};
pub use config::RegistryConfig;
pub use errors::*;
pub use forwarding::{
    CallForwarder, ForwardError, InboxForwarder, NoopForwarder, DEFAULT_INBOX_CAPACITY,
};
pub use name::{is_valid_name, name_length, validate_name};
pub use pricing::{FeeSchedule, PriceTier};
pub use registry::NameRegistry;
pub use types::*;
