//! Per-test outcome of loading a matrix.

use std::collections::BTreeMap;

use bucketing_rules::InvalidRuleError;
use chrono::{DateTime, Utc};

/// Why a test was rejected when its matrix was loaded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TestValidationError {
    #[error("Test has no buckets")]
    NoBuckets,

    #[error("Duplicate bucket value {0}")]
    DuplicateBucket(i32),

    #[error("Allocation {allocation} references undeclared bucket value {value}")]
    UnknownBucket { allocation: usize, value: i32 },

    #[error("Allocation {allocation} has a negative range length {length}")]
    NegativeLength { allocation: usize, length: f64 },

    #[error("Allocation {allocation} lengths sum to {total}, expected 1.0")]
    LengthSum { allocation: usize, total: f64 },

    #[error("Allocation {allocation} ends at {until} before it starts at {from}")]
    EmptyWindow {
        allocation: usize,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    },

    #[error("Test depends on unknown test '{0}'")]
    UnknownDependency(String),

    #[error("Test depends on itself")]
    SelfDependency,

    #[error("Rule references test '{0}' without declaring it in dependsOn")]
    UndeclaredDependency(String),

    #[error(transparent)]
    InvalidRule(#[from] InvalidRuleError),

    #[error("Test depends on invalid test '{0}'")]
    InvalidDependency(String),

    #[error("Test is part of a dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// Tests removed while loading a matrix, with the reason for each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    invalid: BTreeMap<String, TestValidationError>,
}

impl LoadResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn record_invalid(&mut self, test_name: impl Into<String>, error: TestValidationError) {
        self.invalid.insert(test_name.into(), error);
    }

    pub fn invalid_tests(&self) -> &BTreeMap<String, TestValidationError> {
        &self.invalid
    }

    pub fn is_invalid(&self, test_name: &str) -> bool {
        self.invalid.contains_key(test_name)
    }

    pub fn is_empty(&self) -> bool {
        self.invalid.is_empty()
    }

    pub fn len(&self) -> usize {
        self.invalid.len()
    }
}
