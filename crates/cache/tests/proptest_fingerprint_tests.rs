//! Property-based tests for cache key stability and sensitivity.
//!
//! These tests verify the behavioral contracts of task fingerprints:
//! - Determinism: the same declaration always produces the same cache key
//! - Sensitivity: changing any property value changes the cache key
//! - Order invariance: declaration order of properties doesn't matter
//! - Unambiguous framing: values that concatenate alike still differ

use buildstash_cache::{
    CacheKey, CachingFileStateProvider, ContentHash, FORMAT_VERSION, FingerprintBuilder,
    ProjectFileResolver, TaskDeclaration, TaskStateProvider, Value,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Helpers
// =============================================================================

const ROOT: &str = "/project";

fn key_for(properties: &[(String, i64)]) -> CacheKey {
    let mut task = TaskDeclaration::new(":compile", ContentHash::of_bytes(b"javac 21"));
    for (name, value) in properties {
        task.inputs.property(name.clone(), *value).unwrap();
    }
    task.outputs.dir("classes", "build/classes").unwrap();
    TaskStateProvider::new(
        ROOT,
        FORMAT_VERSION,
        Arc::new(ProjectFileResolver::new(ROOT)),
        Arc::new(CachingFileStateProvider::new()),
    )
    .capture(&task)
    .unwrap()
    .cache_key()
    .unwrap()
}

fn value_key(value: &Value) -> CacheKey {
    let mut builder = FingerprintBuilder::new(Path::new(ROOT), FORMAT_VERSION);
    builder.absorb(value).unwrap();
    builder.finish()
}

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate valid property names
fn property_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,12}".prop_map(String::from)
}

/// Generate a set of distinct properties
fn properties_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map(property_name_strategy(), any::<i64>(), 1..8)
}

// =============================================================================
// Property Tests: Determinism
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Contract: The same declaration always produces the same cache key
    #[test]
    fn cache_key_is_deterministic(properties in properties_strategy()) {
        let pairs: Vec<_> = properties.into_iter().collect();
        prop_assert_eq!(key_for(&pairs), key_for(&pairs));
    }

    /// Contract: The order properties are declared in doesn't affect the key
    #[test]
    fn property_declaration_order_is_irrelevant(properties in properties_strategy()) {
        let forward: Vec<_> = properties.into_iter().collect();
        let mut reversed = forward.clone();
        reversed.reverse();
        prop_assert_eq!(key_for(&forward), key_for(&reversed));
    }

    /// Contract: Sorted string collections ignore input order
    #[test]
    fn sorted_strings_ignore_order(items in prop::collection::vec("[a-z]{0,6}", 0..10)) {
        let mut shuffled = items.clone();
        shuffled.reverse();
        prop_assert_eq!(
            value_key(&Value::sorted_strings(items)),
            value_key(&Value::sorted_strings(shuffled))
        );
    }
}

// =============================================================================
// Property Tests: Sensitivity
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Contract: Changing one property value changes the key
    #[test]
    fn changing_a_property_changes_the_key(
        properties in properties_strategy(),
        index in any::<prop::sample::Index>(),
        delta in 1i64..1000,
    ) {
        let original: Vec<_> = properties.into_iter().collect();
        let mut changed = original.clone();
        let slot = index.index(changed.len());
        changed[slot].1 = changed[slot].1.wrapping_add(delta);
        prop_assert_ne!(key_for(&original), key_for(&changed));
    }

    /// Contract: Moving a split point between two strings changes the key
    #[test]
    fn string_boundaries_are_framed(text in "[a-z]{2,12}", split in 1usize..12) {
        let split = split.min(text.len() - 1);
        let a = Value::List(vec![text[..split].into(), text[split..].into()]);
        let b = Value::List(vec![text[..split - 1].into(), text[split - 1..].into()]);
        prop_assert_ne!(value_key(&a), value_key(&b));
    }

    /// Contract: Text and raw bytes with the same content are different values
    #[test]
    fn strings_and_bytes_differ(text in "[ -~]{0,24}") {
        prop_assert_ne!(
            value_key(&Value::Str(text.clone())),
            value_key(&Value::Bytes(text.into_bytes()))
        );
    }

    /// Contract: Integers of different widths are different values
    #[test]
    fn integer_widths_differ(v in any::<i32>()) {
        prop_assert_ne!(value_key(&Value::I32(v)), value_key(&Value::I64(i64::from(v))));
    }
}
