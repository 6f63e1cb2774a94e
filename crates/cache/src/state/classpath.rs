//! Identity of the code that implements a task

use super::{DifferenceReporter, StateComponent};
use crate::Result;
use crate::file_state::ContentHash;
use crate::fingerprint::FingerprintBuilder;
use serde::{Deserialize, Serialize};

const CLASSPATH_TAG: &str = "CLASSPATH_HASH";

/// Hash of a task's implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClasspathState {
    hash: ContentHash,
}

impl ClasspathState {
    /// Wrap an implementation hash
    #[must_use]
    pub fn new(hash: ContentHash) -> Self {
        Self { hash }
    }

    /// The implementation hash
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.hash
    }
}

impl StateComponent for ClasspathState {
    fn append_to_fingerprint(&self, builder: &mut FingerprintBuilder) -> Result<()> {
        builder.absorb_str(CLASSPATH_TAG);
        builder.absorb_bytes(self.hash.as_bytes());
        Ok(())
    }

    fn diff(&self, previous: &Self, reporter: &mut dyn DifferenceReporter) -> Result<bool> {
        if self.hash == previous.hash {
            return Ok(true);
        }
        Ok(reporter.report("has changed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BoundedReporter;

    #[test]
    fn equal_hashes_report_nothing() {
        let a = ClasspathState::new(ContentHash::of_bytes(b"impl"));
        let mut reporter = BoundedReporter::unbounded();
        assert!(a.diff(&a, &mut reporter).unwrap());
        assert!(reporter.is_empty());
    }

    #[test]
    fn different_hashes_report_once() {
        let a = ClasspathState::new(ContentHash::of_bytes(b"impl-1"));
        let b = ClasspathState::new(ContentHash::of_bytes(b"impl-2"));
        let mut reporter = BoundedReporter::unbounded();
        a.diff(&b, &mut reporter).unwrap();
        assert_eq!(reporter.differences(), ["has changed"]);
    }
}
