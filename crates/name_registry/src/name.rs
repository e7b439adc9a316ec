//! Name length and character validation over the fixed-width encoding

use crate::config::RegistryConfig;
use crate::errors::*;
use crate::types::Name;

/// Position of the first zero byte, or the full width when there is none.
pub fn name_length(name: &Name) -> usize {
    name.as_bytes()
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(name.as_bytes().len())
}

/// True iff every byte is the terminator or a lowercase ASCII letter.
pub fn is_valid_name(name: &Name) -> bool {
    name.as_bytes()
        .iter()
        .all(|b| *b == 0 || b.is_ascii_lowercase())
}

/// Character and length validation against the configured bounds.
pub fn validate_name(name: &Name, config: &RegistryConfig) -> Result<()> {
    if !is_valid_name(name) {
        return Err(RegistryError::InvalidName {
            name: name.to_string(),
            reason: "only lowercase letters a-z are allowed".to_string(),
        });
    }
    check_length(name, config)
}

pub(crate) fn check_length(name: &Name, config: &RegistryConfig) -> Result<()> {
    let length = name_length(name);
    if length < config.min_name_length || length > config.max_name_length {
        return Err(RegistryError::InvalidName {
            name: name.to_string(),
            reason: format!(
                "length {length} outside [{}, {}]",
                config.min_name_length, config.max_name_length
            ),
        });
    }
    Ok(())
}
