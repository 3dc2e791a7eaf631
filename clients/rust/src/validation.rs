//! Load-time verification of test definitions.
//!
//! Runs before an engine is constructed. Invalid tests are dropped from the
//! matrix along with every test that depends on them, so one bad definition
//! never blocks the rest of a snapshot from loading.

use std::collections::{BTreeMap, BTreeSet};

use bucketing_rules::{FunctionRegistry, Layered, Rule, RuleContext, Scope};

use crate::dependencies;
use crate::load_result::{LoadResult, TestValidationError};
use crate::model::{TestDefinition, TestMatrix};

/// Allowed deviation of an allocation's length sum from 1.0.
pub const LENGTH_TOLERANCE: f64 = 1e-6;

/// Best-effort context available when a matrix is loaded.
#[derive(Debug, Clone, Default)]
pub struct ProvidedContext {
    context: RuleContext,
    absent_identifiers: BTreeSet<String>,
    evaluate: bool,
    functions: FunctionRegistry,
}

impl ProvidedContext {
    /// No context known: rules are only checked for syntax.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Evaluate rules against `context`. Identifiers in `absent_identifiers`
    /// are expected to be missing and do not fail verification.
    pub fn new(context: RuleContext, absent_identifiers: BTreeSet<String>) -> Self {
        Self {
            context,
            absent_identifiers,
            evaluate: true,
            functions: FunctionRegistry::default(),
        }
    }

    /// Resolve rule functions against `functions` instead of the built-ins.
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn context(&self) -> &RuleContext {
        &self.context
    }

    pub fn absent_identifiers(&self) -> &BTreeSet<String> {
        &self.absent_identifiers
    }

    pub fn should_evaluate(&self) -> bool {
        self.evaluate
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }
}

/// Verify one test definition against the rest of the matrix.
pub fn verify_test(
    name: &str,
    definition: &TestDefinition,
    all_tests: &BTreeMap<String, TestDefinition>,
    provided: &ProvidedContext,
) -> Result<(), TestValidationError> {
    verify_buckets(definition)?;
    verify_allocations(definition)?;

    for dep in &definition.depends_on {
        if dep == name {
            return Err(TestValidationError::SelfDependency);
        }
        if !all_tests.contains_key(dep) {
            return Err(TestValidationError::UnknownDependency(dep.clone()));
        }
    }

    let rules = definition
        .rule
        .iter()
        .chain(definition.allocations.iter().filter_map(|a| a.rule.as_ref()))
        .filter(|rule| !bucketing_rules::is_blank(rule));

    let mut absent = provided.absent_identifiers.clone();
    absent.extend(definition.depends_on.iter().cloned());
    let layers: Vec<&dyn Scope> = vec![&provided.context, &definition.constants];
    let scope = Layered::new(layers);

    for rule in rules {
        let compiled = Rule::parse_with(rule, &provided.functions)?;
        if let Some(undeclared) = compiled
            .identifiers()
            .into_iter()
            .find(|id| all_tests.contains_key(*id) && !definition.depends_on.contains(*id))
        {
            return Err(TestValidationError::UndeclaredDependency(undeclared.to_string()));
        }
        bucketing_rules::verify_with(
            rule,
            provided.evaluate,
            &scope,
            &absent,
            &provided.functions,
        )?;
    }
    Ok(())
}

fn verify_buckets(definition: &TestDefinition) -> Result<(), TestValidationError> {
    if definition.buckets.is_empty() {
        return Err(TestValidationError::NoBuckets);
    }
    let mut seen = BTreeSet::new();
    for bucket in &definition.buckets {
        if !seen.insert(bucket.value) {
            return Err(TestValidationError::DuplicateBucket(bucket.value));
        }
    }
    Ok(())
}

fn verify_allocations(definition: &TestDefinition) -> Result<(), TestValidationError> {
    for (index, allocation) in definition.allocations.iter().enumerate() {
        for range in &allocation.ranges {
            if definition.bucket(range.bucket_value).is_none() {
                return Err(TestValidationError::UnknownBucket {
                    allocation: index,
                    value: range.bucket_value,
                });
            }
            if range.length < 0.0 {
                return Err(TestValidationError::NegativeLength {
                    allocation: index,
                    length: range.length,
                });
            }
        }
        let total = allocation.total_length();
        if (total - 1.0).abs() > LENGTH_TOLERANCE {
            return Err(TestValidationError::LengthSum {
                allocation: index,
                total,
            });
        }
        if let (Some(from), Some(until)) = (allocation.active_from, allocation.active_until)
            && until < from
        {
            return Err(TestValidationError::EmptyWindow {
                allocation: index,
                from,
                until,
            });
        }
    }
    Ok(())
}

/// Verify every test, returning the matrix without invalid tests, tests that
/// depend on them, and tests caught in dependency cycles.
pub fn verify_matrix(matrix: &TestMatrix, provided: &ProvidedContext) -> (TestMatrix, LoadResult) {
    let mut result = LoadResult::empty();
    for (name, definition) in &matrix.tests {
        if let Err(error) = verify_test(name, definition, &matrix.tests, provided) {
            tracing::warn!(test = %name, %error, "dropping invalid test");
            result.record_invalid(name, error);
        }
    }

    let mut tests: BTreeMap<String, TestDefinition> = matrix
        .tests
        .iter()
        .filter(|(name, _)| !result.is_invalid(name))
        .map(|(name, definition)| (name.clone(), definition.clone()))
        .collect();
    remove_invalid_dependents(&mut tests, &mut result);

    while let Err(error) = dependencies::evaluation_order(&tests) {
        tracing::warn!(%error, "dropping tests in dependency cycle");
        for name in &error.cycle {
            if tests.remove(name).is_some() {
                result.record_invalid(name, TestValidationError::Cycle(error.cycle.clone()));
            }
        }
        remove_invalid_dependents(&mut tests, &mut result);
    }

    (TestMatrix::new(matrix.audit.clone(), tests), result)
}

fn remove_invalid_dependents(tests: &mut BTreeMap<String, TestDefinition>, result: &mut LoadResult) {
    loop {
        let broken: Vec<(String, String)> = tests
            .iter()
            .filter_map(|(name, definition)| {
                definition
                    .depends_on
                    .iter()
                    .find(|dep| result.is_invalid(dep))
                    .map(|dep| (name.clone(), dep.clone()))
            })
            .collect();
        if broken.is_empty() {
            return;
        }
        for (name, dep) in broken {
            tracing::warn!(test = %name, dependency = %dep, "dropping test with invalid dependency");
            tests.remove(&name);
            result.record_invalid(name, TestValidationError::InvalidDependency(dep));
        }
    }
}
