//! Scalar input properties of a task

use super::{DifferenceReporter, StateComponent};
use crate::fingerprint::{CacheKey, FingerprintBuilder, Value};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const PROPERTY_DIGEST_VERSION: &str = "property";

/// Digest of every declared input property, keyed by name.
///
/// Values are reduced to digests as soon as the state is captured. Two
/// property values are structurally equal exactly when their digests are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesState {
    digests: BTreeMap<String, CacheKey>,
}

impl PropertiesState {
    /// Evaluate and digest each property.
    ///
    /// File references inside values are made relative to `root`. A value
    /// that cannot be evaluated fails with [`Error::PropertyValue`]; a path
    /// outside the root keeps its own error.
    pub fn capture<'a, I>(properties: I, root: &Path) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut digests = BTreeMap::new();
        for (name, value) in properties {
            let mut builder = FingerprintBuilder::new(root, PROPERTY_DIGEST_VERSION);
            builder.absorb(value).map_err(|e| {
                if e.is_configuration() {
                    e
                } else {
                    Error::PropertyValue {
                        property: name.clone(),
                        message: e.to_string(),
                    }
                }
            })?;
            digests.insert(name.clone(), builder.finish());
        }
        Ok(Self { digests })
    }

    /// Property names and their digests, sorted by name
    #[must_use]
    pub fn digests(&self) -> &BTreeMap<String, CacheKey> {
        &self.digests
    }
}

impl StateComponent for PropertiesState {
    fn append_to_fingerprint(&self, builder: &mut FingerprintBuilder) -> Result<()> {
        builder.begin_map(self.digests.len());
        for (name, digest) in &self.digests {
            builder.absorb_str(name);
            builder.absorb_bytes(digest.as_bytes());
        }
        Ok(())
    }

    fn diff(&self, previous: &Self, reporter: &mut dyn DifferenceReporter) -> Result<bool> {
        for name in self.digests.keys() {
            if !previous.digests.contains_key(name)
                && !reporter.report(format!("input property '{name}' has been added"))
            {
                return Ok(false);
            }
        }
        for name in previous.digests.keys() {
            if !self.digests.contains_key(name)
                && !reporter.report(format!("input property '{name}' has been removed"))
            {
                return Ok(false);
            }
        }
        for (name, digest) in &self.digests {
            if let Some(before) = previous.digests.get(name)
                && before != digest
                && !reporter.report(format!("input property '{name}' has changed"))
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::LazyValue;
    use crate::state::BoundedReporter;

    fn capture(pairs: &[(&str, Value)]) -> PropertiesState {
        let map: BTreeMap<String, Value> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        PropertiesState::capture(&map, Path::new("/project")).unwrap()
    }

    #[test]
    fn structurally_equal_values_have_equal_digests() {
        let a = capture(&[("opts", Value::from(vec!["-O2", "-g"]))]);
        let b = capture(&[("opts", Value::from(vec!["-O2".to_string(), "-g".to_string()]))]);
        assert_eq!(a, b);
    }

    #[test]
    fn reports_added_and_removed_before_changed() {
        let previous = capture(&[
            ("kept", Value::I64(1)),
            ("changed", Value::from("old")),
            ("gone", Value::Bool(true)),
        ]);
        let current = capture(&[
            ("kept", Value::I64(1)),
            ("changed", Value::from("new")),
            ("fresh", Value::Null),
        ]);
        let mut reporter = BoundedReporter::unbounded();
        assert!(current.diff(&previous, &mut reporter).unwrap());
        assert_eq!(
            reporter.differences(),
            [
                "input property 'fresh' has been added",
                "input property 'gone' has been removed",
                "input property 'changed' has changed",
            ]
        );
    }

    #[test]
    fn stops_when_reporter_is_full() {
        let previous = capture(&[]);
        let current = capture(&[("a", Value::I64(1)), ("b", Value::I64(2))]);
        let mut reporter = BoundedReporter::new(1);
        assert!(!current.diff(&previous, &mut reporter).unwrap());
        assert_eq!(reporter.differences().len(), 1);
    }

    #[test]
    fn unreadable_value_is_a_property_error() {
        let mut map = BTreeMap::new();
        map.insert(
            "version".to_string(),
            Value::Lazy(LazyValue::new(|| Err(Error::configuration("no version file")))),
        );
        let err = PropertiesState::capture(&map, Path::new("/project")).unwrap_err();
        assert!(err.is_configuration());

        map.insert(
            "version".to_string(),
            Value::Lazy(LazyValue::new(|| Err(Error::store("unreachable")))),
        );
        let err = PropertiesState::capture(&map, Path::new("/project")).unwrap_err();
        assert!(matches!(err, Error::PropertyValue { ref property, .. } if property == "version"));
    }

    #[test]
    fn path_outside_root_is_kept() {
        let mut map = BTreeMap::new();
        map.insert("f".to_string(), Value::File("/elsewhere/x".into()));
        let err = PropertiesState::capture(&map, Path::new("/project")).unwrap_err();
        assert!(matches!(err, Error::PathOutsideRoot { .. }));
    }
}
