//! Validator: a pure range check and percentage derivation, kept as a free
//! function per spec.md §4.3 ("the Validator is pure") rather than an
//! object with state.

use crate::config::ValidationConfig;
use crate::error::{Result, SilodError};

/// Returns the derived percentage for `raw` if it falls within
/// `[min_value, max_value]`, else a range-descriptive error. Percentage
/// rounds toward zero (floor), per spec.md §9's resolved Open Question:
/// out-of-range values are rejected here, before the division, so the
/// floor assumption always holds for values that reach the divide.
pub fn validate(raw: u16, range: &ValidationConfig) -> Result<u8> {
    if raw < range.min_value || raw > range.max_value {
        return Err(SilodError::validation(raw, range.min_value, range.max_value));
    }
    if range.max_value == 0 {
        return Ok(0);
    }
    let percent = (raw as u64 * 100) / range.max_value as u64;
    Ok(percent.min(100) as u8)
}
