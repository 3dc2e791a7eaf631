use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::model::{Allocation, TestBucket, TestDefinition};

/// Buckets assigned to one request.
///
/// `buckets` and `allocations` are keyed by test name in sorted order. The
/// definitions map is shared with the engine that produced the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResult {
    matrix_version: String,
    buckets: BTreeMap<String, TestBucket>,
    allocations: BTreeMap<String, Allocation>,
    #[serde(skip)]
    test_definitions: Arc<BTreeMap<String, TestDefinition>>,
}

impl AssignmentResult {
    pub fn new(
        matrix_version: impl Into<String>,
        buckets: BTreeMap<String, TestBucket>,
        allocations: BTreeMap<String, Allocation>,
        test_definitions: Arc<BTreeMap<String, TestDefinition>>,
    ) -> Self {
        Self {
            matrix_version: matrix_version.into(),
            buckets,
            allocations,
            test_definitions,
        }
    }

    pub fn matrix_version(&self) -> &str {
        &self.matrix_version
    }

    pub fn buckets(&self) -> &BTreeMap<String, TestBucket> {
        &self.buckets
    }

    pub fn allocations(&self) -> &BTreeMap<String, Allocation> {
        &self.allocations
    }

    pub fn test_definitions(&self) -> &BTreeMap<String, TestDefinition> {
        &self.test_definitions
    }

    pub fn bucket(&self, test_name: &str) -> Option<&TestBucket> {
        self.buckets.get(test_name)
    }

    pub fn allocation(&self, test_name: &str) -> Option<&Allocation> {
        self.allocations.get(test_name)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
