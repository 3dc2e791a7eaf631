//! Test matrix data model.
//!
//! A [`TestMatrix`] is one immutable snapshot of test definitions. Field names
//! serialize in camelCase to match the matrix documents produced by the
//! loading side.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use bucketing_rules::ContextValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WindowBounds;

/// Audit version carried by the empty engine.
pub const EMPTY_VERSION: &str = "-1";

// TestType

/// Kind of identifier a test buckets on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestType {
    User,
    Email,
    Page,
    Account,
    Company,
    Random,
}

impl TestType {
    pub const ALL: [TestType; 6] = [
        TestType::User,
        TestType::Email,
        TestType::Page,
        TestType::Account,
        TestType::Company,
        TestType::Random,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestType::User => "USER",
            TestType::Email => "EMAIL",
            TestType::Page => "PAGE",
            TestType::Account => "ACCOUNT",
            TestType::Company => "COMPANY",
            TestType::Random => "RANDOM",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown test type '{0}'")]
pub struct UnknownTestType(pub String);

impl FromStr for TestType {
    type Err = UnknownTestType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTestType(s.to_string()))
    }
}

// Audit

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub version: String,
    #[serde(default)]
    pub updated_at_epoch: i64,
    #[serde(default)]
    pub updated_by: String,
}

impl Audit {
    pub fn empty() -> Self {
        Self {
            version: EMPTY_VERSION.to_string(),
            updated_at_epoch: 0,
            updated_by: "nobody".to_string(),
        }
    }
}

// TestBucket

/// One outcome group of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBucket {
    pub name: String,
    pub value: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestBucket {
    pub fn new(name: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }
}

// Allocation

/// A slice of the unit interval assigned to one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub bucket_value: i32,
    pub length: f64,
}

impl Range {
    pub fn new(bucket_value: i32, length: f64) -> Self {
        Self {
            bucket_value,
            length,
        }
    }
}

/// Weighted bucket ranges, optionally guarded by a rule and a date window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub ranges: Vec<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_until: Option<DateTime<Utc>>,
}

impl Allocation {
    /// Whether `now` falls inside this allocation's date window.
    ///
    /// `active_from` is always inclusive; `active_until` is exclusive under
    /// [`WindowBounds::HalfOpen`] and inclusive under [`WindowBounds::Inclusive`].
    pub fn is_active(&self, now: DateTime<Utc>, bounds: WindowBounds) -> bool {
        if let Some(from) = self.active_from
            && now < from
        {
            return false;
        }
        match (self.active_until, bounds) {
            (Some(until), WindowBounds::HalfOpen) => now < until,
            (Some(until), WindowBounds::Inclusive) => now <= until,
            (None, _) => true,
        }
    }

    /// Sum of all range lengths; 1.0 for a well-formed allocation.
    pub fn total_length(&self) -> f64 {
        self.ranges.iter().map(|r| r.length).sum()
    }
}

// TestDefinition

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub test_type: TestType,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default)]
    pub buckets: Vec<TestBucket>,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constants: BTreeMap<String, ContextValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestDefinition {
    pub fn new(test_type: TestType) -> Self {
        Self {
            test_type,
            version: String::new(),
            rule: None,
            buckets: Vec::new(),
            allocations: Vec::new(),
            depends_on: BTreeSet::new(),
            salt: None,
            constants: BTreeMap::new(),
            description: None,
        }
    }

    pub fn is_random(&self) -> bool {
        self.test_type == TestType::Random
    }

    /// Declared bucket with the given value.
    pub fn bucket(&self, value: i32) -> Option<&TestBucket> {
        self.buckets.iter().find(|b| b.value == value)
    }

    /// Salt mixed into this test's hash. A leading `&` marks a salt shared
    /// verbatim with other tests and is not part of the hashed text.
    pub fn test_salt<'a>(&'a self, name: &'a str) -> &'a str {
        match self.salt.as_deref() {
            Some(salt) if !salt.is_empty() => salt.strip_prefix('&').unwrap_or(salt),
            _ => name,
        }
    }
}

// TestMatrix

/// One immutable, versioned set of test definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMatrix {
    pub audit: Audit,
    #[serde(default)]
    pub tests: BTreeMap<String, TestDefinition>,
}

impl TestMatrix {
    pub fn new(audit: Audit, tests: BTreeMap<String, TestDefinition>) -> Self {
        Self { audit, tests }
    }

    pub fn empty() -> Self {
        Self {
            audit: Audit::empty(),
            tests: BTreeMap::new(),
        }
    }

    /// Copy of this matrix keeping only the named tests.
    pub fn filtered<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let tests = names
            .iter()
            .filter_map(|name| {
                self.tests
                    .get_key_value(name.as_ref())
                    .map(|(k, v)| (k.clone(), v.clone()))
            })
            .collect();
        Self {
            audit: self.audit.clone(),
            tests,
        }
    }
}
