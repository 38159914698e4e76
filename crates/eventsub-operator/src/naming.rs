//! Deterministic names for subscription resources and broker queues

/// Prefix of every broker queue owned by the operator
pub const QUEUE_PREFIX: &str = "v4:eventsubscription";

/// Suffix of every broker queue owned by the operator
pub const QUEUE_SUFFIX: &str = "queue";

/// Broker queue name for a subscription.
///
/// `v4:eventsubscription:<namespace>:<service>:<queue>:queue`, every
/// identifier kebab-normalized.
pub fn queue_name(namespace: &str, service: &str, queue: &str) -> String {
    [
        QUEUE_PREFIX.to_string(),
        to_kebab_case(namespace),
        to_kebab_case(service),
        to_kebab_case(queue),
        QUEUE_SUFFIX.to_string(),
    ]
    .join(":")
}

/// Kubernetes object name for a subscription: `<service>-<queue>`
pub fn resource_name(service: &str, queue: &str) -> String {
    format!("{}-{}", to_kebab_case(service), to_kebab_case(queue))
}

/// Convert a string to kebab-case.
///
/// Handles PascalCase, camelCase, and any run of non-alphanumeric
/// characters as a single delimiter. Never emits a leading or trailing `-`.
pub fn to_kebab_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 10);
    let mut prev_was_upper = false;
    let mut prev_was_delimiter = true;

    for c in s.chars() {
        if !c.is_alphanumeric() {
            if !result.is_empty() && !result.ends_with('-') {
                result.push('-');
            }
            prev_was_delimiter = true;
            prev_was_upper = false;
        } else if c.is_uppercase() {
            if !result.is_empty() && !prev_was_delimiter && !prev_was_upper {
                result.push('-');
            }
            result.extend(c.to_lowercase());
            prev_was_upper = true;
            prev_was_delimiter = false;
        } else {
            result.push(c);
            prev_was_upper = false;
            prev_was_delimiter = false;
        }
    }

    if result.ends_with('-') {
        result.pop();
    }
    result
}
