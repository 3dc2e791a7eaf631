//! Per-test bucket choosers.
//!
//! A chooser is built once per test definition when an engine is constructed.
//! [`TestChooser::Standard`] hashes the request identifier so the same
//! participant always lands in the same bucket; [`TestChooser::Random`]
//! ignores identifiers and draws a fresh position on every request.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{self, Write};

use bucketing_rules::{ContextValue, FunctionRegistry, Layered, Rule, RuleResult, Scope};
use chrono::{DateTime, Utc};
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::config::{EngineConfig, WindowBounds};
use crate::model::{Allocation, TestBucket, TestDefinition};

/// Width of the signed 32-bit hash range.
pub const INT_RANGE: i64 = i32::MAX as i64 - i32::MIN as i64;

/// Map `"{hash_salt}:{test_salt}:{identifier}"` to a position in `[0, 1)`.
///
/// SHA-1 digest, first four bytes as a big-endian `i32`, shifted to start at
/// zero and divided by the size of the range. Changing any step reshuffles
/// every live assignment.
pub fn hash_position(hash_salt: &str, test_salt: &str, identifier: &str) -> f64 {
    let mut hasher = Sha1::new();
    hasher.update(hash_salt.as_bytes());
    hasher.update(b":");
    hasher.update(test_salt.as_bytes());
    hasher.update(b":");
    hasher.update(identifier.as_bytes());
    let digest = hasher.finalize();

    let value = i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (value as i64 - i32::MIN as i64) as f64 / (INT_RANGE + 1) as f64
}

/// Source of positions in `[0, 1)` for random tests.
pub trait PositionSource {
    fn next_position(&mut self) -> f64;
}

impl<R: Rng> PositionSource for R {
    fn next_position(&mut self) -> f64 {
        self.gen_range(0.0..1.0)
    }
}

/// Exposes prior bucket assignments to rules as integer variables.
struct PriorBuckets<'a>(&'a BTreeMap<String, TestBucket>);

impl Scope for PriorBuckets<'_> {
    fn resolve(&self, name: &str) -> Option<Cow<'_, ContextValue>> {
        self.0
            .get(name)
            .map(|bucket| Cow::Owned(ContextValue::Int(bucket.value as i64)))
    }
}

/// The bucket and allocation a chooser settled on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Choice<'a> {
    pub bucket: &'a TestBucket,
    pub allocation: &'a Allocation,
}

struct CompiledAllocation {
    allocation: Allocation,
    // allocation rule, else the test rule; `None` matches everything
    rule: Option<Rule>,
}

/// Allocation walking shared by both chooser variants.
pub struct AllocationSelector {
    name: String,
    definition: TestDefinition,
    allocations: Vec<CompiledAllocation>,
    window_bounds: WindowBounds,
}

impl AllocationSelector {
    /// Compile every allocation's effective rule.
    pub fn new(
        name: impl Into<String>,
        definition: TestDefinition,
        window_bounds: WindowBounds,
        functions: &FunctionRegistry,
    ) -> RuleResult<Self> {
        let test_rule = definition.rule.as_deref();
        let allocations = definition
            .allocations
            .iter()
            .map(|allocation| {
                let text = allocation
                    .rule
                    .as_deref()
                    .filter(|rule| !bucketing_rules::is_blank(rule))
                    .or(test_rule);
                Ok(CompiledAllocation {
                    allocation: allocation.clone(),
                    rule: Rule::compile_with(text, functions)?,
                })
            })
            .collect::<RuleResult<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            definition,
            allocations,
            window_bounds,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &TestDefinition {
        &self.definition
    }

    /// First allocation active at `now` whose rule holds. Rule failures are
    /// logged and count as not matching.
    pub fn select(
        &self,
        context: &dyn Scope,
        prior: &BTreeMap<String, TestBucket>,
        now: DateTime<Utc>,
    ) -> Option<&Allocation> {
        let prior = PriorBuckets(prior);
        let constants = &self.definition.constants;
        let layers: Vec<&dyn Scope> = vec![&prior, context, constants];
        let scope = Layered::new(layers);

        self.allocations
            .iter()
            .filter(|compiled| compiled.allocation.is_active(now, self.window_bounds))
            .find(|compiled| match &compiled.rule {
                None => true,
                Some(rule) => rule.evaluate(&scope).unwrap_or_else(|error| {
                    tracing::warn!(
                        test = %self.name,
                        rule = rule.text(),
                        %error,
                        "failed to evaluate allocation rule"
                    );
                    false
                }),
            })
            .map(|compiled| &compiled.allocation)
    }

    /// Bucket whose cumulative range window contains `position`.
    pub fn bucket_at(&self, allocation: &Allocation, position: f64) -> Option<&TestBucket> {
        let mut cumulative = 0.0;
        for range in &allocation.ranges {
            cumulative += range.length;
            if position < cumulative {
                return self.definition.bucket(range.bucket_value);
            }
        }
        // lengths summing to slightly under 1.0
        allocation
            .ranges
            .iter()
            .rev()
            .find(|range| range.length > 0.0)
            .and_then(|range| self.definition.bucket(range.bucket_value))
    }

    fn choose_at(
        &self,
        position: impl FnOnce() -> f64,
        context: &dyn Scope,
        prior: &BTreeMap<String, TestBucket>,
        now: DateTime<Utc>,
    ) -> Option<Choice<'_>> {
        let allocation = self.select(context, prior, now)?;
        let bucket = self.bucket_at(allocation, position())?;
        Some(Choice { bucket, allocation })
    }
}

/// Deterministic chooser keyed by the request identifier.
pub struct StandardChooser {
    selector: AllocationSelector,
    hash_salt: String,
}

impl StandardChooser {
    pub fn choose(
        &self,
        identifier: &str,
        context: &dyn Scope,
        prior: &BTreeMap<String, TestBucket>,
        now: DateTime<Utc>,
    ) -> Option<Choice<'_>> {
        let test_salt = self.selector.definition.test_salt(&self.selector.name);
        self.selector.choose_at(
            || hash_position(&self.hash_salt, test_salt, identifier),
            context,
            prior,
            now,
        )
    }
}

/// Identifier-independent chooser.
pub struct RandomChooser {
    selector: AllocationSelector,
}

impl RandomChooser {
    pub fn choose(
        &self,
        positions: &mut dyn PositionSource,
        context: &dyn Scope,
        prior: &BTreeMap<String, TestBucket>,
        now: DateTime<Utc>,
    ) -> Option<Choice<'_>> {
        self.selector
            .choose_at(|| positions.next_position(), context, prior, now)
    }
}

pub enum TestChooser {
    Standard(StandardChooser),
    Random(RandomChooser),
}

impl TestChooser {
    /// Build the chooser variant matching the definition's test type.
    pub fn new(
        name: &str,
        definition: TestDefinition,
        config: &EngineConfig,
        functions: &FunctionRegistry,
    ) -> RuleResult<Self> {
        let random = definition.is_random();
        let selector = AllocationSelector::new(name, definition, config.window_bounds, functions)?;
        Ok(if random {
            TestChooser::Random(RandomChooser { selector })
        } else {
            TestChooser::Standard(StandardChooser {
                selector,
                hash_salt: config.hash_salt.clone(),
            })
        })
    }

    fn selector(&self) -> &AllocationSelector {
        match self {
            TestChooser::Standard(chooser) => &chooser.selector,
            TestChooser::Random(chooser) => &chooser.selector,
        }
    }

    pub fn name(&self) -> &str {
        self.selector().name()
    }

    pub fn definition(&self) -> &TestDefinition {
        self.selector().definition()
    }

    /// Declared bucket with `value`, regardless of allocation weights.
    pub fn get_test_bucket(&self, value: i32) -> Option<&TestBucket> {
        self.definition().bucket(value)
    }

    /// Write `bucket=value, ... | [rule] value:length, ...` for this test.
    pub fn print_test_buckets(&self, out: &mut impl Write) -> fmt::Result {
        let definition = self.definition();
        let buckets: Vec<String> = definition
            .buckets
            .iter()
            .map(|b| format!("{}={}", b.name, b.value))
            .collect();
        out.write_str(&buckets.join(", "))?;

        for compiled in &self.selector().allocations {
            let rule = compiled.rule.as_ref().map(Rule::text).unwrap_or("");
            let ranges: Vec<String> = compiled
                .allocation
                .ranges
                .iter()
                .map(|r| format!("{}:{}", r.bucket_value, r.length))
                .collect();
            write!(out, " | [{rule}] {}", ranges.join(", "))?;
        }
        Ok(())
    }
}
