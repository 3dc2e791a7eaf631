use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

use bucketing::testing::{TestDefinitionBuilder, matrix};
use bucketing::validation::ProvidedContext;
use bucketing::{
    AssignmentResult, Engine, EngineConfig, EngineHandle, ForceGroupsDefaultMode, ForceGroupsOptions,
    FunctionRegistry, Identifiers, LoadResult, NoopValidator, RuleContext, TestDefinition,
    TestMatrix, TestType, TestValidationError,
};
use tempfile::TempDir;

fn color_test() -> TestDefinition {
    TestDefinitionBuilder::user()
        .buckets(&[(-1, "inactive"), (0, "control"), (1, "blue")])
        .allocation(Some("true"), &[(0, 0.5), (1, 0.5)])
        .build()
}

fn make_engine(tests: TestMatrix) -> Engine {
    Engine::construct_with(
        tests,
        LoadResult::empty(),
        &EngineConfig::default(),
        &FunctionRegistry::default(),
        NoopValidator,
    )
    .unwrap()
}

fn assign(engine: &Engine, ids: &Identifiers, force: &ForceGroupsOptions, filter: &[&str]) -> AssignmentResult {
    engine.determine_assignments(ids, &RuleContext::new(), force, filter)
}

fn bucket_value(result: &AssignmentResult, test: &str) -> Option<i32> {
    result.bucket(test).map(|b| b.value)
}

#[test]
fn test_standard_assignment_is_deterministic() {
    let engine = make_engine(matrix([("colorTest", color_test())]));
    let ids = Identifiers::single(TestType::User, "user-42");

    let first = assign(&engine, &ids, &ForceGroupsOptions::new(), &[]);
    // sha1(":colorTest:user-42") lands at ~0.81
    assert_eq!(bucket_value(&first, "colorTest"), Some(1));
    assert_eq!(first.allocation("colorTest").unwrap().rule.as_deref(), Some("true"));

    for _ in 0..100 {
        let again = assign(&engine, &ids, &ForceGroupsOptions::new(), &[]);
        assert_eq!(again.buckets(), first.buckets());
        assert_eq!(again.allocations(), first.allocations());
    }

    // a fresh engine over the same definitions agrees
    let rebuilt = make_engine(matrix([("colorTest", color_test())]));
    assert_eq!(
        assign(&rebuilt, &ids, &ForceGroupsOptions::new(), &[]).buckets(),
        first.buckets()
    );
}

#[test]
fn test_unrelated_tests_do_not_perturb_assignment() {
    let ids = Identifiers::single(TestType::User, "user-42");
    let alone = make_engine(matrix([("colorTest", color_test())]));
    let crowded = make_engine(matrix([
        ("colorTest", color_test()),
        ("aaa", color_test()),
        ("zzz", color_test()),
    ]));
    assert_eq!(
        bucket_value(&assign(&alone, &ids, &ForceGroupsOptions::new(), &[]), "colorTest"),
        bucket_value(&assign(&crowded, &ids, &ForceGroupsOptions::new(), &[]), "colorTest"),
    );
}

#[test]
fn test_buckets_split_by_weight() {
    let engine = make_engine(matrix([(
        "split",
        TestDefinitionBuilder::user()
            .buckets(&[(0, "a"), (1, "b")])
            .allocation(None, &[(0, 0.2), (1, 0.8)])
            .build(),
    )]));
    let mut counts = BTreeMap::new();
    for i in 0..10_000 {
        let ids = Identifiers::single(TestType::User, format!("user-{i}"));
        let value = bucket_value(&assign(&engine, &ids, &ForceGroupsOptions::new(), &[]), "split").unwrap();
        *counts.entry(value).or_insert(0) += 1;
    }
    let a = counts[&0];
    assert!((1_700..2_300).contains(&a), "bucket 0 got {a} of 10000");
    assert_eq!(counts[&0] + counts[&1], 10_000);
}

#[test]
fn test_shared_salt_aligns_tests() {
    let shared = |salt: &str| {
        TestDefinitionBuilder::user()
            .buckets(&[(0, "a"), (1, "b")])
            .allocation(None, &[(0, 0.5), (1, 0.5)])
            .salt(salt)
            .build()
    };
    let engine = make_engine(matrix([("first", shared("&both")), ("second", shared("&both"))]));
    for i in 0..50 {
        let ids = Identifiers::single(TestType::User, format!("user-{i}"));
        let result = assign(&engine, &ids, &ForceGroupsOptions::new(), &[]);
        assert_eq!(bucket_value(&result, "first"), bucket_value(&result, "second"));
    }
}

fn dependent_matrix() -> TestMatrix {
    matrix([
        (
            "otherTest",
            TestDefinitionBuilder::user()
                .buckets(&[(0, "control"), (1, "active")])
                .allocation(None, &[(1, 1.0)])
                .build(),
        ),
        (
            "colorTest",
            TestDefinitionBuilder::user()
                .buckets(&[(0, "control"), (1, "blue")])
                .allocation(Some("${otherTest == 1}"), &[(1, 1.0)])
                .allocation(None, &[(0, 1.0)])
                .depends_on("otherTest")
                .build(),
        ),
        ("unrelated", color_test()),
    ])
}

#[test]
fn test_filter_returns_only_requested_tests() {
    let engine = make_engine(dependent_matrix());
    let ids = Identifiers::single(TestType::User, "user-42");

    let result = assign(&engine, &ids, &ForceGroupsOptions::new(), &["colorTest"]);
    assert_eq!(result.buckets().keys().collect::<Vec<_>>(), vec!["colorTest"]);
    assert_eq!(result.allocations().keys().collect::<Vec<_>>(), vec!["colorTest"]);
    // otherTest was evaluated first and put the request in bucket 1
    assert_eq!(bucket_value(&result, "colorTest"), Some(1));

    let forced = ForceGroupsOptions::new().with_force("otherTest", 0);
    let result = assign(&engine, &ids, &forced, &["colorTest"]);
    assert_eq!(bucket_value(&result, "colorTest"), Some(0));
    assert!(result.bucket("otherTest").is_none());
}

#[test]
fn test_unfiltered_request_evaluates_dependencies_first() {
    let engine = make_engine(dependent_matrix());
    assert_eq!(engine.evaluation_order(), ["otherTest", "colorTest", "unrelated"]);

    let ids = Identifiers::single(TestType::User, "user-42");
    let result = assign(&engine, &ids, &ForceGroupsOptions::new(), &[]);
    assert_eq!(bucket_value(&result, "otherTest"), Some(1));
    assert_eq!(bucket_value(&result, "colorTest"), Some(1));
    assert!(result.bucket("unrelated").is_some());
}

#[test]
fn test_invalid_identifier_degrades_only_its_type() {
    let tests = matrix([
        ("colorTest", color_test()),
        (
            "emailTest",
            TestDefinitionBuilder::new(TestType::Email)
                .buckets(&[(0, "plain"), (1, "fancy")])
                .allocation(None, &[(0, 0.5), (1, 0.5)])
                .build(),
        ),
    ]);
    let validator = |test_type: TestType, identifier: &str| {
        !(test_type == TestType::User && identifier.starts_with("bot-"))
    };
    let engine = Engine::construct_with(
        tests,
        LoadResult::empty(),
        &EngineConfig::default(),
        &FunctionRegistry::default(),
        validator,
    )
    .unwrap();

    let ids = Identifiers::single(TestType::User, "bot-7").with(TestType::Email, "a@example.com");
    let result = assign(&engine, &ids, &ForceGroupsOptions::new(), &[]);
    assert!(result.bucket("colorTest").is_none());
    assert!(result.bucket("emailTest").is_some());

    // forcing does not revive a degraded type
    let forced = ForceGroupsOptions::new().with_force("colorTest", 1);
    assert!(assign(&engine, &ids, &forced, &[]).bucket("colorTest").is_none());

    let ids = Identifiers::single(TestType::User, "user-42");
    assert!(assign(&engine, &ids, &ForceGroupsOptions::new(), &[]).bucket("colorTest").is_some());
}

#[test]
fn test_force_overrides_rules_in_both_modes() {
    let mut never = TestDefinitionBuilder::from(color_test()).rule("${false}").build();
    never.allocations[0].rule = None;
    let engine = make_engine(matrix([("colorTest", never)]));
    let ids = Identifiers::single(TestType::User, "user-42");

    assert!(assign(&engine, &ids, &ForceGroupsOptions::new(), &[]).is_empty());

    for mode in [ForceGroupsDefaultMode::Normal, ForceGroupsDefaultMode::Fallback] {
        let force = ForceGroupsOptions::new()
            .with_force("colorTest", -1)
            .with_default_mode(mode);
        let result = assign(&engine, &ids, &force, &[]);
        assert_eq!(bucket_value(&result, "colorTest"), Some(-1), "{mode:?}");
    }
}

#[test]
fn test_fallback_mode_skips_unforced_tests() {
    let engine = make_engine(matrix([("colorTest", color_test()), ("otherColor", color_test())]));
    let ids = Identifiers::single(TestType::User, "user-42");

    let force = ForceGroupsOptions::parse("otherColor0,default_to_fallback");
    let result = assign(&engine, &ids, &force, &[]);
    // colorTest's rule matches, but fallback leaves it to the caller
    assert!(result.bucket("colorTest").is_none());
    assert_eq!(bucket_value(&result, "otherColor"), Some(0));

    let normal = assign(&engine, &ids, &ForceGroupsOptions::new(), &[]);
    assert!(normal.bucket("colorTest").is_some());
}

#[test]
fn test_context_drives_eligibility() {
    let engine = make_engine(matrix([(
        "langTest",
        TestDefinitionBuilder::user()
            .buckets(&[(0, "control"), (1, "active")])
            .allocation(Some("${fn:contains(SUPPORTED, lang) && country eq 'US'}"), &[(1, 1.0)])
            .constant("SUPPORTED", vec!["en", "es"])
            .build(),
    )]));
    let ids = Identifiers::single(TestType::User, "user-42");
    let force = ForceGroupsOptions::new();

    let ctx = RuleContext::new().with("lang", "es").with("country", "US");
    let result = engine.determine_assignments(&ids, &ctx, &force, &[]);
    assert_eq!(bucket_value(&result, "langTest"), Some(1));

    let ctx = RuleContext::new().with("lang", "de").with("country", "US");
    assert!(engine.determine_assignments(&ids, &ctx, &force, &[]).is_empty());

    // missing context variable is ineligible, not an error
    let ctx = RuleContext::new().with("lang", "en");
    assert!(engine.determine_assignments(&ids, &ctx, &force, &[]).is_empty());
}

#[test]
fn test_load_matrix_file_and_drop_invalid_tests() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("matrix.json");
    std::fs::write(
        &path,
        r#"{
            "audit": {"version": "42", "updatedAtEpoch": 1700000000, "updatedBy": "alice"},
            "tests": {
                "colorTest": {
                    "testType": "USER",
                    "version": "3",
                    "buckets": [{"name": "control", "value": 0}, {"name": "blue", "value": 1}],
                    "allocations": [{"rule": "${country == 'US'}", "ranges": [
                        {"bucketValue": 0, "length": 0.5}, {"bucketValue": 1, "length": 0.5}
                    ]}]
                },
                "brokenTest": {
                    "testType": "USER",
                    "buckets": [{"name": "control", "value": 0}],
                    "allocations": [{"ranges": [{"bucketValue": 0, "length": 0.7}]}]
                }
            }
        }"#,
    )
    .unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let loaded: TestMatrix = serde_json::from_str(&contents).unwrap();
    let provided = ProvidedContext::new(
        RuleContext::new().with("country", "CA"),
        BTreeSet::new(),
    );
    let engine = Engine::from_matrix(&loaded, &provided).unwrap();

    assert_eq!(engine.test_names().collect::<Vec<_>>(), vec!["colorTest"]);
    assert!(matches!(
        engine.load_result().invalid_tests().get("brokenTest"),
        Some(TestValidationError::LengthSum { .. })
    ));
    assert_eq!(engine.stats().invalid_test_count, 1);

    let ids = Identifiers::single(TestType::User, "user-42");
    let ctx = RuleContext::new().with("country", "US");
    let result = engine.determine_assignments(&ids, &ctx, &ForceGroupsOptions::new(), &[]);
    assert_eq!(result.matrix_version(), "42");
    assert!(result.bucket("colorTest").is_some());

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["matrixVersion"], "42");
    assert!(json.get("testDefinitions").is_none());
}

#[test]
fn test_handle_swap_under_concurrent_readers() {
    let handle = Arc::new(EngineHandle::default());
    let ids = Identifiers::single(TestType::User, "user-42");

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let handle = Arc::clone(&handle);
            let ids = ids.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let engine = handle.load();
                    let result = engine.determine_assignments(
                        &ids,
                        &RuleContext::new(),
                        &ForceGroupsOptions::new(),
                        &[],
                    );
                    // each snapshot is internally consistent
                    assert_eq!(result.matrix_version(), engine.audit().version);
                }
            })
        })
        .collect();

    for _ in 0..20 {
        handle.replace(make_engine(matrix([("colorTest", color_test())])));
    }
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(handle.load().audit().version, "1");
}
