//! Content hash over a subscription's identity and filters
//!
//! The hash gates writes in the desired-state service: an upsert whose
//! hash matches the stored `filtersHashsum` is a no-op.

use serde_json::Value;

/// Length of a hex-encoded hashsum
pub const HASHSUM_HEX_LEN: usize = 32;

/// Normalize filters to their stored form.
///
/// Strings pass through unchanged; any other JSON value is stored as its
/// compact JSON encoding.
pub fn normalize_filters(filters: &[Value]) -> Vec<String> {
    filters
        .iter()
        .map(|filter| match filter {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

/// Compute the hashsum for a subscription.
///
/// MD5 over the JSON array `[service, queue, [filters...]]`, lowercase
/// hex. JSON string escaping keeps the fields apart whatever characters
/// they contain. The logical namespace is not hashed.
pub fn compute_hashsum(service: &str, queue: &str, filters: &[String]) -> String {
    // Strings always serialize
    let canonical = serde_json::to_string(&(service, queue, filters)).unwrap_or_default();
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// Whether a string looks like a hashsum produced by [`compute_hashsum`]
pub fn is_valid_hashsum(value: &str) -> bool {
    value.len() == HASHSUM_HEX_LEN && value.chars().all(|c| c.is_ascii_hexdigit())
}
