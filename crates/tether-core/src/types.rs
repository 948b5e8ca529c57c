use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Separator placed between a queue name and its uniqueness suffix.
pub const SUFFIX_SEPARATOR: char = '_';

/// Length of the uniqueness suffix: a UUIDv7 in simple (hyphen-less) form.
pub const SUFFIX_LEN: usize = 32;

/// Marker appended to the keys of pre-created continuation triggers.
pub const CONTINUATION_MARKER: &str = "-trigger";

/// Stable identifier of a schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey(pub String);

impl JobKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier of a single trigger.
///
/// Keys generated by this crate follow `<queue>_<suffix>`, and continuation
/// placeholders follow `<queue>_<suffix>-trigger`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey(pub String);

impl TriggerKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fresh key for a trigger on `queue`: `<queue>_<suffix>`.
    pub fn generate(queue: &str) -> Self {
        Self(format!("{queue}{SUFFIX_SEPARATOR}{}", unique_suffix()))
    }

    /// Fresh key for an inert continuation placeholder: `<queue>_<suffix>-trigger`.
    pub fn continuation(queue: &str) -> Self {
        Self(format!(
            "{queue}{SUFFIX_SEPARATOR}{}{CONTINUATION_MARKER}",
            unique_suffix()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The logical-job prefix this key was generated from.
    pub fn logical_prefix(&self) -> &str {
        logical_prefix(&self.0)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TriggerKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TriggerKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// New uniqueness suffix. UUIDv7 keeps generated keys time-sortable.
pub fn unique_suffix() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Strip the uniqueness suffix (and continuation marker) from a trigger name.
///
/// This is the single place that knows the suffix length. Names that do not
/// end in `_<32 hex chars>` are returned unchanged, so hand-written keys act
/// as their own group.
pub fn logical_prefix(name: &str) -> &str {
    let base = name.strip_suffix(CONTINUATION_MARKER).unwrap_or(name);
    let Some(split) = base.len().checked_sub(SUFFIX_LEN + 1) else {
        return base;
    };
    if !base.is_char_boundary(split) {
        return base;
    }
    let (prefix, tail) = base.split_at(split);
    match tail.strip_prefix(SUFFIX_SEPARATOR) {
        Some(suffix) if suffix.bytes().all(|b| b.is_ascii_hexdigit()) => prefix,
        _ => base,
    }
}

/// Queue names become key prefixes, so they must be non-empty and free of
/// whitespace.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() {
        return Err(CoreError::InvalidKey("queue name is empty".to_string()));
    }
    if queue.chars().any(char::is_whitespace) {
        return Err(CoreError::InvalidKey(format!(
            "queue name contains whitespace: {queue:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_fixed_suffix() {
        let key = TriggerKey::generate("emails");
        assert_eq!(key.as_str().len(), "emails".len() + 1 + SUFFIX_LEN);
        assert!(key.as_str().starts_with("emails_"));
    }

    #[test]
    fn prefix_strips_generated_suffix() {
        let key = TriggerKey::generate("emails");
        assert_eq!(key.logical_prefix(), "emails");
    }

    #[test]
    fn prefix_strips_continuation_marker_too() {
        let key = TriggerKey::continuation("reports_daily");
        assert!(key.as_str().ends_with(CONTINUATION_MARKER));
        assert_eq!(key.logical_prefix(), "reports_daily");
    }

    #[test]
    fn two_keys_for_same_queue_share_prefix() {
        let a = TriggerKey::generate("sync");
        let b = TriggerKey::generate("sync");
        assert_ne!(a, b);
        assert_eq!(a.logical_prefix(), b.logical_prefix());
    }

    #[test]
    fn hand_written_key_is_its_own_prefix() {
        assert_eq!(logical_prefix("nightly-backup"), "nightly-backup");
        assert_eq!(logical_prefix("x_short"), "x_short");
    }

    #[test]
    fn non_hex_suffix_is_not_stripped() {
        let name = format!("queue_{}", "z".repeat(SUFFIX_LEN));
        assert_eq!(logical_prefix(&name), name);
    }

    #[test]
    fn multibyte_names_do_not_panic() {
        let name = "é".repeat(SUFFIX_LEN);
        assert_eq!(logical_prefix(&name), name);
    }

    #[test]
    fn queue_name_validation() {
        assert!(validate_queue_name("emails").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("two words").is_err());
    }
}
