//! Key layout in the coordination store
//!
//! ```text
//! pool/{pool}/usage              -> decimal usage counter
//! pool/{pool}/slot/{slot}        -> owner token
//! owner/{owner}/{pool}/{slot}    -> "active"
//! ```

use crate::types::{CoordinatorError, Result};

pub const POOL_ROOT: &str = "pool/";
pub const OWNER_ROOT: &str = "owner/";

/// Value stored under the per-owner index
pub const OWNER_INDEX_VALUE: &str = "active";

const SEPARATOR: char = '/';

/// Reject segments that would break the key layout
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CoordinatorError::InvalidName(format!("{kind} must not be empty")));
    }
    if value.contains(SEPARATOR) {
        return Err(CoordinatorError::InvalidName(format!(
            "{kind} '{value}' must not contain '{SEPARATOR}'"
        )));
    }
    Ok(())
}

pub fn usage_key(pool: &str) -> String {
    format!("{POOL_ROOT}{pool}/usage")
}

pub fn slot_prefix(pool: &str) -> String {
    format!("{POOL_ROOT}{pool}/slot/")
}

pub fn slot_key(pool: &str, slot: &str) -> String {
    format!("{}{}", slot_prefix(pool), slot)
}

pub fn owner_prefix(owner: &str) -> String {
    format!("{OWNER_ROOT}{owner}/")
}

pub fn owner_index_key(owner: &str, pool: &str, slot: &str) -> String {
    format!("{}{}/{}", owner_prefix(owner), pool, slot)
}

/// Split `pool/{pool}/slot/{slot}` into `(pool, slot)`
pub fn parse_slot_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(POOL_ROOT)?;
    let (pool, rest) = rest.split_once(SEPARATOR)?;
    let slot = rest.strip_prefix("slot/")?;
    if pool.is_empty() || slot.is_empty() || slot.contains(SEPARATOR) {
        return None;
    }
    Some((pool, slot))
}

/// Split `owner/{owner}/{pool}/{slot}` into `(pool, slot)` for a known owner
pub fn parse_owner_index_key<'a>(owner: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(OWNER_ROOT)?.strip_prefix(owner)?;
    let rest = rest.strip_prefix(SEPARATOR)?;
    let (pool, slot) = rest.split_once(SEPARATOR)?;
    if pool.is_empty() || slot.is_empty() || slot.contains(SEPARATOR) {
        return None;
    }
    Some((pool, slot))
}
