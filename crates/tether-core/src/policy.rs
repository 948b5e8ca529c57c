use serde::{Deserialize, Serialize};

/// Attempt ceiling plus delay table, shared by execution retry and
/// concurrency rescheduling.
///
/// `max_attempts` has no serde default: a policy without a ceiling is a
/// wiring mistake and must fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Number of reschedules allowed before the failure is surfaced.
    pub max_attempts: u32,
    /// Delay in seconds per zero-based attempt. Empty means `2^attempt`.
    #[serde(default)]
    pub delays: Vec<u64>,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, delays: impl Into<Vec<u64>>) -> Self {
        Self {
            max_attempts,
            delays: delays.into(),
        }
    }

    /// Policy with no delay table, i.e. pure exponential backoff.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::new(max_attempts, Vec::new())
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_default_to_empty() {
        let p: BackoffPolicy = serde_json::from_str(r#"{"max_attempts":4}"#).unwrap();
        assert_eq!(p, BackoffPolicy::exponential(4));
    }

    #[test]
    fn missing_ceiling_fails_to_decode() {
        let r = serde_json::from_str::<BackoffPolicy>(r#"{"delays":[1,2]}"#);
        assert!(r.is_err());
    }

    #[test]
    fn exhaustion_is_inclusive_of_ceiling() {
        let p = BackoffPolicy::new(2, vec![1, 1]);
        assert!(!p.is_exhausted(1));
        assert!(p.is_exhausted(2));
    }
}
