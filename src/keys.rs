use once_cell::sync::Lazy;
use regex::Regex;

use crate::{codes, AppError, AppResult};

/// Prefix under which legacy, owner-agnostic objects live.
pub const LEGACY_PREFIX: &str = "receipts/";
/// Prefix under which owner-scoped objects live.
pub const SCOPED_PREFIX: &str = "users/";

static LEGACY_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^receipts/([^/]+)/.+$").expect("legacy key regex"));
static SCOPED_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^users/([^/]+)/receipts/([^/]+)/.+$").expect("scoped key regex"));

/// True when `key` follows the legacy `receipts/{item_id}/...` convention.
pub fn is_legacy_key(key: &str) -> bool {
    LEGACY_KEY.is_match(key)
}

/// True when `key` follows the scoped `users/{owner_id}/receipts/{item_id}/...`
/// convention.
pub fn is_scoped_key(key: &str) -> bool {
    SCOPED_KEY.is_match(key)
}

/// Maps a legacy key into the owner-scoped convention. Deterministic: the same
/// `(old_key, owner_id)` pair always yields the same scoped key, which is what
/// makes re-runs and resume-after-crash idempotent.
pub fn to_scoped_key(old_key: &str, owner_id: &str) -> AppResult<String> {
    if owner_id.is_empty() || owner_id.contains('/') {
        return Err(AppError::new(codes::MALFORMED_KEY, "Invalid owner id.")
            .with_context("owner_id", owner_id.to_string()));
    }
    if !is_legacy_key(old_key) {
        return Err(AppError::new(
            codes::MALFORMED_KEY,
            "Key does not match the legacy receipts convention.",
        )
        .with_context("key", old_key.to_string()));
    }
    Ok(format!("{SCOPED_PREFIX}{owner_id}/{old_key}"))
}

/// Extracts the item id segment from a legacy key.
pub fn item_id_from_legacy_key(key: &str) -> AppResult<String> {
    let captures = LEGACY_KEY.captures(key).ok_or_else(|| {
        AppError::new(
            codes::MALFORMED_KEY,
            "Key does not match the legacy receipts convention.",
        )
        .with_context("key", key.to_string())
    })?;
    Ok(captures[1].to_string())
}

/// Extracts the owner id from a scoped key; used both for access checks and to
/// recognize already-migrated objects during discovery.
pub fn owner_id_from_scoped_key(key: &str) -> AppResult<String> {
    let captures = SCOPED_KEY.captures(key).ok_or_else(|| {
        AppError::new(
            codes::MALFORMED_KEY,
            "Key does not match the scoped convention.",
        )
        .with_context("key", key.to_string())
    })?;
    Ok(captures[1].to_string())
}
