//! Failure classification and bounded error sampling.
//!
//! Every document that is not acknowledged is recorded under a
//! [`FailureClass`]. Counts are exact; only the number of retained samples
//! per class is capped, so a flood of identical failures stays cheap to carry
//! around while the totals remain trustworthy.

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Why a document was not indexed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureClass {
    /// Rejected by the index service with this status.
    Status(u16),
    /// The request carrying it never got a per-document answer.
    Transport,
    /// The row could not be turned into an action.
    Conversion,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(s) => write!(f, "{s}"),
            Self::Transport => f.write_str("transport"),
            Self::Conversion => f.write_str("conversion"),
        }
    }
}

impl Serialize for FailureClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorSample {
    pub doc_id: String,
    pub detail: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub count: u64,
    pub samples: Vec<ErrorSample>,
}

/// Failures grouped by class.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ErrorMap(BTreeMap<FailureClass, ErrorSummary>);

impl ErrorMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one failure, keeping its sample while the class has fewer than `cap`.
    pub fn record(&mut self, class: FailureClass, sample: ErrorSample, cap: usize) {
        let entry = self.0.entry(class).or_default();
        entry.count += 1;
        if entry.samples.len() < cap {
            entry.samples.push(sample);
        }
    }

    /// Fold `other` into `self`: counts add up, samples are appended up to `cap`.
    pub fn merge(&mut self, other: Self, cap: usize) {
        for (class, summary) in other.0 {
            let entry = self.0.entry(class).or_default();
            entry.count += summary.count;
            let room = cap.saturating_sub(entry.samples.len());
            entry.samples.extend(summary.samples.into_iter().take(room));
        }
    }

    #[must_use]
    pub fn get(&self, class: FailureClass) -> Option<&ErrorSummary> {
        self.0.get(&class)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Sum of counts over every class.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().map(|s| s.count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FailureClass, &ErrorSummary)> {
        self.0.iter()
    }
}
