//! Collecting human readable differences between two states

/// Receives difference messages.
pub trait DifferenceReporter {
    /// Record one difference. Returns whether the caller should keep looking
    /// for more.
    fn report(&mut self, message: String) -> bool;
}

/// Keeps at most `max` messages and asks callers to stop once full.
#[derive(Debug, Clone, Default)]
pub struct BoundedReporter {
    max: usize,
    differences: Vec<String>,
}

impl BoundedReporter {
    /// Reporter that keeps up to `max` messages (at least one).
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            differences: Vec::new(),
        }
    }

    /// Reporter that keeps everything
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Messages collected so far
    #[must_use]
    pub fn differences(&self) -> &[String] {
        &self.differences
    }

    /// Take the collected messages
    #[must_use]
    pub fn into_differences(self) -> Vec<String> {
        self.differences
    }

    /// Whether nothing was reported
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    /// Whether the cap has been reached
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.differences.len() >= self.max
    }
}

impl DifferenceReporter for BoundedReporter {
    fn report(&mut self, message: String) -> bool {
        if !self.is_full() {
            tracing::trace!(difference = %message, "Recorded state difference");
            self.differences.push(message);
        }
        !self.is_full()
    }
}

/// Prepends a fixed prefix to every message and counts what passes through.
pub struct PrefixingReporter<'a> {
    prefix: String,
    inner: &'a mut dyn DifferenceReporter,
    reported: usize,
}

impl<'a> PrefixingReporter<'a> {
    /// Wrap `inner`, prefixing messages with `prefix`
    pub fn new(prefix: impl Into<String>, inner: &'a mut dyn DifferenceReporter) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
            reported: 0,
        }
    }

    /// How many messages went through this wrapper
    #[must_use]
    pub fn reported(&self) -> usize {
        self.reported
    }
}

impl DifferenceReporter for PrefixingReporter<'_> {
    fn report(&mut self, message: String) -> bool {
        self.reported += 1;
        self.inner.report(format!("{}{message}", self.prefix))
    }
}
