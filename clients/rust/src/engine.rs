//! Assignment orchestration over one test matrix snapshot.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write};
use std::io;
use std::sync::{Arc, OnceLock};

use bucketing_rules::{FunctionRegistry, Scope, builtins};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chooser::{PositionSource, TestChooser};
use crate::config::{self, EngineConfig};
use crate::dependencies;
use crate::force_groups::{ForceGroupsDefaultMode, ForceGroupsOptions};
use crate::identifiers::{IdentifierValidator, Identifiers, NoopValidator};
use crate::load_result::LoadResult;
use crate::model::{Audit, TestBucket, TestDefinition, TestMatrix, TestType};
use crate::result::AssignmentResult;
use crate::validation::{self, ProvidedContext};
use crate::{EngineError, Result};

/// Read-only summary of a loaded engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub matrix_version: String,
    pub test_count: usize,
    pub random_test_count: usize,
    pub invalid_test_count: usize,
}

#[derive(Serialize)]
struct MatrixView<'a> {
    audit: &'a Audit,
    tests: BTreeMap<&'a str, &'a TestDefinition>,
}

/// Assigns buckets for one immutable matrix snapshot.
///
/// Everything is built once in [`Engine::construct`]; assignment only reads
/// shared state, so one engine can serve any number of threads. Reloading a
/// matrix means constructing a new engine (see [`crate::EngineHandle`]).
pub struct Engine {
    audit: Audit,
    tests: Arc<BTreeMap<String, TestDefinition>>,
    load_result: LoadResult,
    choosers: BTreeMap<String, TestChooser>,
    evaluation_order: Vec<String>,
    evaluation_index: HashMap<String, usize>,
    identifier_validator: Box<dyn IdentifierValidator>,
}

impl Engine {
    /// Construct with the process-wide [`config::config`], the built-in rule
    /// functions and no identifier validation.
    pub fn construct(matrix: TestMatrix, load_result: LoadResult) -> Result<Self> {
        Self::construct_with(
            matrix,
            load_result,
            config::config(),
            builtins(),
            NoopValidator,
        )
    }

    /// Build choosers and the evaluation order, resolving rule functions
    /// against `functions`. Fails on a rule that does not parse or on a
    /// dependency cycle.
    pub fn construct_with(
        matrix: TestMatrix,
        load_result: LoadResult,
        config: &EngineConfig,
        functions: &FunctionRegistry,
        identifier_validator: impl IdentifierValidator + 'static,
    ) -> Result<Self> {
        let TestMatrix { audit, tests } = matrix;
        let evaluation_order = dependencies::evaluation_order(&tests)?;

        let mut choosers = BTreeMap::new();
        for (name, definition) in &tests {
            let chooser = TestChooser::new(name, definition.clone(), config, functions)
                .map_err(|source| EngineError::InvalidRule {
                    test: name.clone(),
                    source,
                })?;
            choosers.insert(name.clone(), chooser);
        }

        let evaluation_index = evaluation_order
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();

        tracing::info!(
            version = %audit.version,
            tests = tests.len(),
            invalid = load_result.len(),
            "constructed bucketing engine"
        );

        Ok(Self {
            audit,
            tests: Arc::new(tests),
            load_result,
            choosers,
            evaluation_order,
            evaluation_index,
            identifier_validator: Box::new(identifier_validator),
        })
    }

    /// Verify `matrix`, drop invalid tests, and construct from what remains.
    /// Rules are resolved against the provided context's functions.
    pub fn from_matrix(matrix: &TestMatrix, provided: &ProvidedContext) -> Result<Self> {
        let (verified, load_result) = validation::verify_matrix(matrix, provided);
        Self::construct_with(
            verified,
            load_result,
            config::config(),
            provided.functions(),
            NoopValidator,
        )
    }

    /// An engine with no tests.
    pub fn empty() -> Self {
        Self {
            audit: Audit::empty(),
            tests: Arc::new(BTreeMap::new()),
            load_result: LoadResult::empty(),
            choosers: BTreeMap::new(),
            evaluation_order: Vec::new(),
            evaluation_index: HashMap::new(),
            identifier_validator: Box::new(NoopValidator),
        }
    }

    /// Determine buckets for a request at the current time.
    ///
    /// `test_name_filter` limits evaluation to the named tests and their
    /// dependencies; only the named tests are returned. An empty filter
    /// evaluates everything.
    pub fn determine_assignments(
        &self,
        identifiers: &Identifiers,
        context: &dyn Scope,
        force_groups: &ForceGroupsOptions,
        test_name_filter: &[&str],
    ) -> AssignmentResult {
        self.determine_assignments_at(
            identifiers,
            context,
            force_groups,
            test_name_filter,
            Utc::now(),
            &mut rand::thread_rng(),
        )
    }

    /// [`Engine::determine_assignments`] with an explicit clock and source of
    /// random positions.
    pub fn determine_assignments_at(
        &self,
        identifiers: &Identifiers,
        context: &dyn Scope,
        force_groups: &ForceGroupsOptions,
        test_name_filter: &[&str],
        now: DateTime<Utc>,
        positions: &mut dyn PositionSource,
    ) -> AssignmentResult {
        let determine_all = test_name_filter.is_empty();
        let filter: BTreeSet<&str> = test_name_filter
            .iter()
            .copied()
            .filter(|name| self.choosers.contains_key(*name))
            .collect();

        let order: Cow<'_, [String]> = if determine_all {
            Cow::Borrowed(&self.evaluation_order)
        } else {
            let mut scoped: Vec<String> =
                dependencies::transitive_dependencies(&self.tests, filter.iter().copied())
                    .into_iter()
                    .collect();
            scoped.sort_by_key(|name| self.evaluation_index.get(name).copied());
            Cow::Owned(scoped)
        };

        let degraded = self.degraded_test_types(identifiers);

        let mut buckets: BTreeMap<String, TestBucket> = BTreeMap::new();
        let mut allocations = BTreeMap::new();

        for name in order.iter() {
            let Some(chooser) = self.choosers.get(name) else {
                continue;
            };

            let identifier = match chooser {
                TestChooser::Standard(_) => {
                    let test_type = chooser.definition().test_type;
                    if degraded.contains(&test_type) {
                        continue;
                    }
                    match identifiers.get(test_type) {
                        Some(identifier) => Some(identifier),
                        None => continue,
                    }
                }
                TestChooser::Random(_) => {
                    if !identifiers.is_random_enabled() {
                        continue;
                    }
                    None
                }
            };

            match force_groups.forced_bucket_value(name) {
                Some(value) => match chooser.get_test_bucket(value) {
                    Some(bucket) => {
                        buckets.insert(name.clone(), bucket.clone());
                        continue;
                    }
                    None => {
                        tracing::debug!(test = %name, value, "forced bucket value is not declared");
                    }
                },
                None if force_groups.default_mode() == ForceGroupsDefaultMode::Fallback => continue,
                None => {}
            }

            let choice = match (chooser, identifier) {
                (TestChooser::Standard(standard), Some(identifier)) => {
                    standard.choose(identifier, context, &buckets, now)
                }
                (TestChooser::Random(random), _) => random.choose(positions, context, &buckets, now),
                (TestChooser::Standard(_), None) => None,
            };
            if let Some(choice) = choice {
                buckets.insert(name.clone(), choice.bucket.clone());
                allocations.insert(name.clone(), choice.allocation.clone());
            }
        }

        if !determine_all {
            buckets.retain(|name, _| filter.contains(name.as_str()));
            allocations.retain(|name, _| filter.contains(name.as_str()));
        }

        AssignmentResult::new(
            self.audit.version.clone(),
            buckets,
            allocations,
            Arc::clone(&self.tests),
        )
    }

    fn degraded_test_types(&self, identifiers: &Identifiers) -> BTreeSet<TestType> {
        identifiers
            .iter()
            .filter(|&(test_type, identifier)| {
                let valid = self.identifier_validator.validate(test_type, identifier);
                if !valid {
                    tracing::warn!(
                        %test_type,
                        identifier,
                        "invalid identifier, skipping tests of this type"
                    );
                }
                !valid
            })
            .map(|(test_type, _)| test_type)
            .collect()
    }

    pub fn audit(&self) -> &Audit {
        &self.audit
    }

    pub fn test_names(&self) -> impl Iterator<Item = &str> {
        self.tests.keys().map(String::as_str)
    }

    pub fn test_definition(&self, name: &str) -> Option<&TestDefinition> {
        self.tests.get(name)
    }

    pub fn load_result(&self) -> &LoadResult {
        &self.load_result
    }

    /// Tests in the order they are evaluated.
    pub fn evaluation_order(&self) -> &[String] {
        &self.evaluation_order
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            matrix_version: self.audit.version.clone(),
            test_count: self.tests.len(),
            random_test_count: self.tests.values().filter(|d| d.is_random()).count(),
            invalid_test_count: self.load_result.len(),
        }
    }

    // Dumps

    /// Write one `name : buckets | allocations` line per test accepted by
    /// `include`, in name order.
    pub fn append_tests(
        &self,
        out: &mut impl Write,
        include: impl Fn(&str, &TestDefinition) -> bool,
    ) -> fmt::Result {
        for (name, chooser) in &self.choosers {
            if include(name, chooser.definition()) {
                write!(out, "{name} : ")?;
                chooser.print_test_buckets(out)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }

    pub fn append_all_tests(&self, out: &mut impl Write) -> fmt::Result {
        self.append_tests(out, |_, _| true)
    }

    pub fn append_tests_of_type(&self, out: &mut impl Write, test_type: TestType) -> fmt::Result {
        self.append_tests(out, |_, definition| definition.test_type == test_type)
    }

    pub fn append_tests_name_filtered(&self, out: &mut impl Write, names: &[&str]) -> fmt::Result {
        self.append_tests(out, |name, _| names.contains(&name))
    }

    /// Pretty JSON of the whole matrix.
    pub fn append_test_matrix(&self, writer: impl io::Write) -> serde_json::Result<()> {
        let view = MatrixView {
            audit: &self.audit,
            tests: self.tests.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        };
        serde_json::to_writer_pretty(writer, &view)
    }

    /// Pretty JSON of the matrix restricted to `names`.
    pub fn append_test_matrix_filtered(
        &self,
        writer: impl io::Write,
        names: &[&str],
    ) -> serde_json::Result<()> {
        let view = MatrixView {
            audit: &self.audit,
            tests: self
                .tests
                .iter()
                .filter(|(k, _)| names.contains(&k.as_str()))
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
        };
        serde_json::to_writer_pretty(writer, &view)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("version", &self.audit.version)
            .field("tests", &self.evaluation_order)
            .finish_non_exhaustive()
    }
}

static EMPTY_ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

/// Shared engine with no tests, usable before any matrix has loaded.
pub fn empty_engine() -> Arc<Engine> {
    Arc::clone(EMPTY_ENGINE.get_or_init(|| Arc::new(Engine::empty())))
}
