//! Typed access to the trigger metadata map.
//!
//! The map is the only state this layer persists, and it is untyped. Every
//! key tether reads or writes is declared here as a [`MetaKey`] with its
//! value type; nothing else in the crate touches raw map entries.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use tether_core::{logical_prefix, BackoffPolicy, TriggerKey};
use tether_scheduler::{MetadataMap, Trigger};

use crate::error::{HooksError, Result};
use crate::types::{CompletionCondition, ContinuationLink};

/// A metadata key bound to the type stored under it.
pub struct MetaKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> MetaKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

pub const RETRY_COUNT: MetaKey<u32> = MetaKey::new("tether.retry.count");
pub const RETRY_POLICY: MetaKey<BackoffPolicy> = MetaKey::new("tether.retry.policy");
pub const CONCURRENCY_COUNT: MetaKey<u32> = MetaKey::new("tether.concurrency.count");
pub const CONCURRENCY_POLICY: MetaKey<BackoffPolicy> = MetaKey::new("tether.concurrency.policy");
/// Explicit logical-job group; preferred over the key prefix.
pub const GROUP: MetaKey<String> = MetaKey::new("tether.group");
pub const CONTINUATION_CHILD: MetaKey<TriggerKey> = MetaKey::new("tether.continuation.child");
pub const CONTINUATION_CONDITION: MetaKey<CompletionCondition> =
    MetaKey::new("tether.continuation.condition");
pub const CONTINUATION_PRIORITY: MetaKey<i32> = MetaKey::new("tether.continuation.priority");
/// First trigger of the chain a cleanup job removes.
pub const CLEANUP_START: MetaKey<TriggerKey> = MetaKey::new("tether.cleanup.start");

/// Typed reads and writes over [`MetadataMap`].
pub trait MetadataExt {
    /// `None` when the key is absent or null; an error when it holds a value
    /// of the wrong shape.
    fn read<T: DeserializeOwned>(&self, key: &MetaKey<T>) -> Result<Option<T>>;

    fn write<T: Serialize>(&mut self, key: &MetaKey<T>, value: &T) -> Result<()>;

    fn has<T>(&self, key: &MetaKey<T>) -> bool;
}

impl MetadataExt for MetadataMap {
    fn read<T: DeserializeOwned>(&self, key: &MetaKey<T>) -> Result<Option<T>> {
        match self.get(key.name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|source| HooksError::Codec {
                    key: key.name,
                    source,
                }),
        }
    }

    fn write<T: Serialize>(&mut self, key: &MetaKey<T>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| HooksError::Codec {
            key: key.name,
            source,
        })?;
        self.insert(key.name, value);
        Ok(())
    }

    fn has<T>(&self, key: &MetaKey<T>) -> bool {
        self.contains_key(key.name)
    }
}

/// Read the continuation link, if any.
///
/// A child key without a condition is a configuration error.
pub fn continuation(metadata: &MetadataMap) -> Result<Option<ContinuationLink>> {
    let Some(child) = metadata.read(&CONTINUATION_CHILD)? else {
        return Ok(None);
    };
    let condition = metadata.read(&CONTINUATION_CONDITION)?.ok_or_else(|| {
        HooksError::Config(format!("continuation to {child} has no completion condition"))
    })?;
    let priority = metadata.read(&CONTINUATION_PRIORITY)?;
    Ok(Some(ContinuationLink {
        child,
        condition,
        priority,
    }))
}

pub fn write_continuation(metadata: &mut MetadataMap, link: &ContinuationLink) -> Result<()> {
    metadata.write(&CONTINUATION_CHILD, &link.child)?;
    metadata.write(&CONTINUATION_CONDITION, &link.condition)?;
    if let Some(priority) = link.priority {
        metadata.write(&CONTINUATION_PRIORITY, &priority)?;
    }
    Ok(())
}

/// Logical-job group of `trigger`: the explicit group when set, otherwise
/// the key with its uniqueness suffix stripped.
pub fn group_of(trigger: &Trigger) -> Result<String> {
    Ok(match trigger.metadata.read(&GROUP)? {
        Some(group) => group,
        None => logical_prefix(trigger.key.as_str()).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn absent_and_null_read_as_none() {
        let mut m = MetadataMap::new();
        assert_eq!(m.read(&RETRY_COUNT).unwrap(), None);
        m.insert(RETRY_COUNT.name(), Value::Null);
        assert_eq!(m.read(&RETRY_COUNT).unwrap(), None);
    }

    #[test]
    fn written_values_read_back_typed() {
        let mut m = MetadataMap::new();
        let policy = BackoffPolicy::new(3, vec![1, 2, 5]);
        m.write(&RETRY_POLICY, &policy).unwrap();
        m.write(&RETRY_COUNT, &2).unwrap();
        assert_eq!(m.read(&RETRY_POLICY).unwrap(), Some(policy));
        assert_eq!(m.read(&RETRY_COUNT).unwrap(), Some(2));
        assert_eq!(m.get("tether.retry.count"), Some(&json!(2)));
    }

    #[test]
    fn wrong_shape_is_a_configuration_error() {
        let mut m = MetadataMap::new();
        m.insert(RETRY_COUNT.name(), json!("three"));
        let err = m.read(&RETRY_COUNT).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("tether.retry.count"));
    }

    #[test]
    fn policy_without_ceiling_is_rejected() {
        let mut m = MetadataMap::new();
        m.insert(RETRY_POLICY.name(), json!({ "delays": [1, 2] }));
        assert!(m.read(&RETRY_POLICY).unwrap_err().is_configuration());
    }

    #[test]
    fn continuation_round_trips_through_map() {
        let mut m = MetadataMap::new();
        let link = ContinuationLink {
            child: TriggerKey::continuation("reports"),
            condition: CompletionCondition::OnFailure,
            priority: Some(4),
        };
        write_continuation(&mut m, &link).unwrap();
        assert_eq!(continuation(&m).unwrap(), Some(link));
    }

    #[test]
    fn child_without_condition_is_rejected() {
        let mut m = MetadataMap::new();
        m.write(&CONTINUATION_CHILD, &TriggerKey::from("c")).unwrap();
        assert!(continuation(&m).unwrap_err().is_configuration());
    }

    #[test]
    fn group_prefers_explicit_value() {
        let key = TriggerKey::generate("sync");
        let mut t = Trigger::new(key, "job".into(), Utc::now());
        assert_eq!(group_of(&t).unwrap(), "sync");

        t.metadata.write(&GROUP, &"tenant-7".to_string()).unwrap();
        assert_eq!(group_of(&t).unwrap(), "tenant-7");
    }
}
