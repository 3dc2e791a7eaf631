//! Fixtures for building test matrices in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use bucketing::testing::{TestDefinitionBuilder, matrix};
//!
//! let tests = matrix([(
//!     "colorTest",
//!     TestDefinitionBuilder::user()
//!         .buckets(&[(0, "control"), (1, "blue")])
//!         .allocation(Some("${country == 'US'}"), &[(0, 0.5), (1, 0.5)])
//!         .build(),
//! )]);
//! ```

use std::collections::BTreeMap;

use bucketing_rules::ContextValue;
use chrono::{DateTime, Utc};

use crate::model::{Allocation, Audit, Range, TestBucket, TestDefinition, TestMatrix, TestType};

/// Audit version stamped on matrices built by [`matrix`].
pub const TEST_MATRIX_VERSION: &str = "1";

/// Builder for [`TestDefinition`].
#[derive(Debug, Clone)]
pub struct TestDefinitionBuilder {
    definition: TestDefinition,
}

impl TestDefinitionBuilder {
    pub fn new(test_type: TestType) -> Self {
        let mut definition = TestDefinition::new(test_type);
        definition.version = "1".to_string();
        Self { definition }
    }

    pub fn user() -> Self {
        Self::new(TestType::User)
    }

    pub fn random() -> Self {
        Self::new(TestType::Random)
    }

    /// Declare buckets as `(value, name)` pairs.
    pub fn buckets(mut self, buckets: &[(i32, &str)]) -> Self {
        self.definition
            .buckets
            .extend(buckets.iter().map(|&(value, name)| TestBucket::new(name, value)));
        self
    }

    pub fn rule(mut self, rule: &str) -> Self {
        self.definition.rule = Some(rule.to_string());
        self
    }

    /// Append an allocation with `(bucket value, length)` ranges.
    pub fn allocation(mut self, rule: Option<&str>, ranges: &[(i32, f64)]) -> Self {
        self.definition.allocations.push(Allocation {
            rule: rule.map(str::to_string),
            ranges: ranges.iter().map(|&(value, length)| Range::new(value, length)).collect(),
            ..Default::default()
        });
        self
    }

    /// Restrict the most recently added allocation to a date window.
    pub fn active(mut self, from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        if let Some(allocation) = self.definition.allocations.last_mut() {
            allocation.active_from = from;
            allocation.active_until = until;
        }
        self
    }

    pub fn depends_on(mut self, test_name: &str) -> Self {
        self.definition.depends_on.insert(test_name.to_string());
        self
    }

    pub fn constant(mut self, name: &str, value: impl Into<ContextValue>) -> Self {
        self.definition.constants.insert(name.to_string(), value.into());
        self
    }

    pub fn salt(mut self, salt: &str) -> Self {
        self.definition.salt = Some(salt.to_string());
        self
    }

    pub fn build(self) -> TestDefinition {
        self.definition
    }
}

impl From<TestDefinition> for TestDefinitionBuilder {
    fn from(definition: TestDefinition) -> Self {
        Self { definition }
    }
}

/// Matrix at version [`TEST_MATRIX_VERSION`] holding the given tests.
pub fn matrix<'a>(tests: impl IntoIterator<Item = (&'a str, TestDefinition)>) -> TestMatrix {
    let tests: BTreeMap<String, TestDefinition> = tests
        .into_iter()
        .map(|(name, definition)| (name.to_string(), definition))
        .collect();
    TestMatrix::new(
        Audit {
            version: TEST_MATRIX_VERSION.to_string(),
            updated_at_epoch: 0,
            updated_by: "tests".to_string(),
        },
        tests,
    )
}
