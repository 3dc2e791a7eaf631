use std::fmt::Write;

use bucketing::{Engine, EngineStats, TestType};
use clap::ValueEnum;

use crate::Result;

/// Output format for the dump command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Outcome of validating one matrix file
#[derive(Debug)]
pub struct ValidationReport {
    pub path: String,
    pub stats: EngineStats,
    /// (test name, reason) in name order
    pub invalid: Vec<(String, String)>,
}

impl ValidationReport {
    pub fn new(path: impl Into<String>, engine: &Engine) -> Self {
        let invalid = engine
            .load_result()
            .invalid_tests()
            .iter()
            .map(|(name, error)| (name.clone(), error.to_string()))
            .collect();
        Self {
            path: path.into(),
            stats: engine.stats(),
            invalid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }
}

pub fn render_reports(reports: &[ValidationReport]) -> String {
    let mut out = String::new();
    for report in reports {
        let status = if report.is_valid() { "ok" } else { "INVALID" };
        // writing to a String cannot fail
        let _ = writeln!(
            out,
            "{}: {} (version {}, {} tests, {} random, {} invalid)",
            report.path,
            status,
            report.stats.matrix_version,
            report.stats.test_count,
            report.stats.random_test_count,
            report.stats.invalid_test_count,
        );
        for (name, reason) in &report.invalid {
            let _ = writeln!(out, "  {name}: {reason}");
        }
    }
    out
}

/// Render the engine's tests, restricted by type and/or name when given.
pub fn render_dump(
    engine: &Engine,
    format: OutputFormat,
    test_type: Option<TestType>,
    names: &[String],
) -> Result<String> {
    let selected: Vec<&str> = engine
        .test_names()
        .filter(|name| names.is_empty() || names.iter().any(|n| n.as_str() == *name))
        .filter(|name| {
            test_type.is_none_or(|t| engine.test_definition(name).is_some_and(|d| d.test_type == t))
        })
        .collect();
    let unfiltered = test_type.is_none() && names.is_empty();

    match format {
        OutputFormat::Text => {
            let mut out = String::new();
            let written = match test_type {
                _ if unfiltered => engine.append_all_tests(&mut out),
                Some(t) if names.is_empty() => engine.append_tests_of_type(&mut out, t),
                _ => engine.append_tests_name_filtered(&mut out, &selected),
            };
            written.map_err(|_| crate::AppError::Validation("Failed to render tests".to_string()))?;
            Ok(out)
        }
        OutputFormat::Json => {
            let mut buf = Vec::new();
            if unfiltered {
                engine.append_test_matrix(&mut buf)?;
            } else {
                engine.append_test_matrix_filtered(&mut buf, &selected)?;
            }
            buf.push(b'\n');
            String::from_utf8(buf)
                .map_err(|e| crate::AppError::Validation(format!("Matrix JSON is not UTF-8: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketing::LoadResult;
    use bucketing::testing::{TestDefinitionBuilder, matrix};

    fn engine() -> Engine {
        let tests = matrix([
            (
                "colorTest",
                TestDefinitionBuilder::user()
                    .buckets(&[(0, "control"), (1, "blue")])
                    .allocation(None, &[(0, 0.5), (1, 0.5)])
                    .build(),
            ),
            (
                "pageTest",
                TestDefinitionBuilder::new(TestType::Page)
                    .buckets(&[(0, "control")])
                    .allocation(None, &[(0, 1.0)])
                    .build(),
            ),
        ]);
        Engine::construct(tests, LoadResult::empty()).unwrap()
    }

    #[test]
    fn test_text_dump_all() {
        let out = render_dump(&engine(), OutputFormat::Text, None, &[]).unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.starts_with("colorTest : control=0, blue=1"));
    }

    #[test]
    fn test_text_dump_by_type() {
        let out = render_dump(&engine(), OutputFormat::Text, Some(TestType::Page), &[]).unwrap();
        assert_eq!(out.lines().count(), 1);
        assert!(out.starts_with("pageTest : "));
    }

    #[test]
    fn test_text_dump_type_and_name_intersect() {
        let names = vec!["colorTest".to_string()];
        let out = render_dump(&engine(), OutputFormat::Text, Some(TestType::Page), &names).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_json_dump_filtered() {
        let names = vec!["pageTest".to_string()];
        let out = render_dump(&engine(), OutputFormat::Json, None, &names).unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        let tests = json["tests"].as_object().unwrap();
        assert_eq!(tests.len(), 1);
        assert!(tests.contains_key("pageTest"));
        assert_eq!(json["audit"]["version"], "1");
    }

    #[test]
    fn test_render_reports_lists_invalid_tests() {
        let mut load_result = LoadResult::empty();
        load_result.record_invalid("brokenTest", bucketing::TestValidationError::NoBuckets);
        let tests = matrix(Vec::<(&str, bucketing::TestDefinition)>::new());
        let engine = Engine::construct(tests, load_result).unwrap();

        let report = ValidationReport::new("matrix.json", &engine);
        assert!(!report.is_valid());

        let out = render_reports(&[report]);
        assert!(out.starts_with("matrix.json: INVALID (version 1, 0 tests, 0 random, 1 invalid)"));
        assert!(out.contains("  brokenTest: Test has no buckets"));
    }
}
