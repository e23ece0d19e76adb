//! Engine properties shared between a test and the drivers it configures,
//! with scoped overrides.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

/// Row cap honored by drivers that support it.
pub const RESULT_LIMIT: &str = "result_limit";

/// Shared, cloneable property map. Clones see the same values.
#[derive(Debug, Clone, Default)]
pub struct EngineProperties {
    values: Arc<RwLock<BTreeMap<String, String>>>,
}

impl EngineProperties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// Parsed value; unparsable values read as absent.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.values.read().get(key).and_then(|v| v.parse().ok())
    }

    /// Set `key`, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.write().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.write().remove(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }
}

/// A set of overrides applied for the duration of one closure.
///
/// ```
/// use tck_harness::property::{EngineProperties, PropertyScope, RESULT_LIMIT};
///
/// let props = EngineProperties::new();
/// PropertyScope::new()
///     .with_property(RESULT_LIMIT, "3")
///     .execute(&props, || assert_eq!(props.get(RESULT_LIMIT).as_deref(), Some("3")));
/// assert_eq!(props.get(RESULT_LIMIT), None);
/// ```
#[derive(Debug, Default, Clone)]
pub struct PropertyScope {
    overrides: BTreeMap<String, String>,
}

impl PropertyScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Apply the overrides, run `f`, then restore the prior values even if
    /// `f` panics.
    pub fn execute<R>(&self, props: &EngineProperties, f: impl FnOnce() -> R) -> R {
        let _restore = self.apply(props);
        f()
    }

    /// Apply the overrides until the returned guard drops.
    #[must_use = "the overrides are reverted when the guard drops"]
    pub fn apply<'a>(&self, props: &'a EngineProperties) -> RestoreGuard<'a> {
        let saved = self
            .overrides
            .iter()
            .map(|(key, value)| {
                debug!(key = %key, value = %value, "engine property override");
                (key.clone(), props.set(key.clone(), value.clone()))
            })
            .collect();
        RestoreGuard { props, saved }
    }
}

/// Restores overridden properties on drop.
#[derive(Debug)]
pub struct RestoreGuard<'a> {
    props: &'a EngineProperties,
    saved: Vec<(String, Option<String>)>,
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain(..).rev() {
            match previous {
                Some(value) => {
                    self.props.set(key, value);
                }
                None => {
                    self.props.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn overrides_are_restored() {
        let props = EngineProperties::new();
        props.set("keep", "1");
        props.set(RESULT_LIMIT, "100");
        let seen = PropertyScope::new()
            .with_property(RESULT_LIMIT, "5")
            .with_property("fresh", "yes")
            .execute(&props, || (props.get_parsed::<usize>(RESULT_LIMIT), props.get("fresh")));
        assert_eq!(seen, (Some(5), Some("yes".to_owned())));
        assert_eq!(props.get(RESULT_LIMIT).as_deref(), Some("100"));
        assert_eq!(props.get("fresh"), None);
        assert_eq!(props.get("keep").as_deref(), Some("1"));
    }

    #[test]
    fn restored_after_panic() {
        let props = EngineProperties::new();
        let scope = PropertyScope::new().with_property(RESULT_LIMIT, "1");
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _: () = scope.execute(&props, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(props.get(RESULT_LIMIT), None);
    }

    #[test]
    fn clones_share_values() {
        let props = EngineProperties::new();
        let other = props.clone();
        other.set("k", "v");
        assert_eq!(props.snapshot().get("k").map(String::as_str), Some("v"));
        assert_eq!(props.get_parsed::<u32>("k"), None);
    }
}
