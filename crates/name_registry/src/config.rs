//! Registry parameters fixed at construction

use crate::errors::*;
use crate::types::{Amount, NAME_BYTES};
use serde::{Deserialize, Serialize};

const DAY: u64 = 24 * 3600;

/// Registry parameters. All periods are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Lifetime of a fresh registration
    pub registration_period: u64,
    /// Minimum wait between commit and reveal
    pub required_delay: u64,
    /// Width of the renewal window before expiry, and the extension granted by a renewal
    pub renewal_period: u64,
    pub min_name_length: usize,
    pub max_name_length: usize,
    /// Floor price, charged for names of `min_fee_length` and longer
    pub min_fee: Amount,
    /// Price of the shortest allowed name
    pub max_fee: Amount,
    pub min_fee_length: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registration_period: 365 * DAY,
            required_delay: 5 * 60,
            renewal_period: 30 * DAY,
            min_name_length: 3,
            max_name_length: NAME_BYTES,
            min_fee: 100_000,
            max_fee: 1_000_000,
            min_fee_length: 10,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RegistryError::InvalidConfig(msg));

        if self.min_name_length == 0 {
            return invalid("min_name_length must be at least 1".into());
        }
        if self.max_name_length > NAME_BYTES {
            return invalid(format!(
                "max_name_length {} exceeds the {NAME_BYTES}-byte encoding",
                self.max_name_length
            ));
        }
        if self.min_name_length > self.max_name_length {
            return invalid(format!(
                "min_name_length {} exceeds max_name_length {}",
                self.min_name_length, self.max_name_length
            ));
        }
        if self.min_fee > self.max_fee {
            return invalid(format!(
                "min_fee {} exceeds max_fee {}",
                self.min_fee, self.max_fee
            ));
        }
        if self.registration_period == 0 || self.renewal_period == 0 {
            return invalid("registration and renewal periods must be non-zero".into());
        }
        if self.renewal_period > self.registration_period {
            return invalid(format!(
                "renewal_period {} exceeds registration_period {}",
                self.renewal_period, self.registration_period
            ));
        }

        // The last stepped length must still price at or above the floor.
        let last_stepped = self.min_fee_length.min(self.max_name_length + 1);
        if last_stepped > self.min_name_length {
            let divisor = (last_stepped - self.min_name_length) as Amount;
            if self.max_fee / divisor < self.min_fee {
                return invalid(format!(
                    "max_fee / {divisor} falls below min_fee; raise max_fee or lower min_fee_length"
                ));
            }
        }

        Ok(())
    }
}
