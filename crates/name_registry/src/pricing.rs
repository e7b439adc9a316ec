//! Length-based name pricing
//!
//! Names shorter than `min_fee_length` pay a stepped price that falls as the name grows:
//! `max_fee / (length - min_name_length + 1)`. Longer names pay the flat `min_fee`.

use crate::config::RegistryConfig;
use crate::errors::*;
use crate::name::name_length;
use crate::types::{Amount, Name};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub min_name_length: usize,
    pub max_name_length: usize,
    pub min_fee: Amount,
    pub max_fee: Amount,
    pub min_fee_length: usize,
}

/// One row of the published price table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub length: usize,
    pub price: Amount,
}

impl FeeSchedule {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            min_name_length: config.min_name_length,
            max_name_length: config.max_name_length,
            min_fee: config.min_fee,
            max_fee: config.max_fee,
            min_fee_length: config.min_fee_length,
        }
    }

    /// Price of `name`, based on its length only.
    pub fn price_of(&self, name: &Name) -> Result<Amount> {
        let length = name_length(name);
        self.price_for_length(length)
            .ok_or_else(|| RegistryError::InvalidName {
                name: name.to_string(),
                reason: format!(
                    "length {length} outside [{}, {}]",
                    self.min_name_length, self.max_name_length
                ),
            })
    }

    /// Price for a bare length, `None` when the length is out of range.
    pub fn price_for_length(&self, length: usize) -> Option<Amount> {
        if length < self.min_name_length || length > self.max_name_length {
            return None;
        }
        if length < self.min_fee_length {
            let step = (length - self.min_name_length + 1) as Amount;
            Some(self.max_fee / step)
        } else {
            Some(self.min_fee)
        }
    }

    /// Prices for every allowed length, shortest first.
    pub fn table(&self) -> Vec<PriceTier> {
        (self.min_name_length..=self.max_name_length)
            .filter_map(|length| {
                self.price_for_length(length)
                    .map(|price| PriceTier { length, price })
            })
            .collect()
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}
