mod loader;
mod output;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use bucketing::{
    AssignmentResult, Engine, EngineConfig, ForceGroupsOptions, Identifiers, NoopValidator,
    TestMatrix, TestType, WindowBounds,
    validation::{self, ProvidedContext},
};
use bucketing_rules::{ContextValue, RuleContext};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::loader::MatrixLoader;
use crate::output::{OutputFormat, ValidationReport};

/// Result type for operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Errors that can occur while loading matrices or running commands
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("JSON parse error in {path}: {source}")]
    JsonParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Schema error in {path}: {message}")]
    Schema { path: String, message: String },

    #[error(transparent)]
    Engine(#[from] bucketing::EngineError),
}

#[derive(Parser, Debug)]
#[command(name = "bucketing-cli")]
#[command(version, about = "Validate test matrices and inspect bucket assignments", long_about = None)]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "increase log verbosity (-v, -vv, -vvv)")]
    verbose: u8,

    #[arg(
        long,
        env = "BUCKETING_HASH_SALT",
        default_value = "",
        global = true,
        help = "matrix-wide salt prefixed to every identifier hash"
    )]
    salt: String,

    #[arg(
        long,
        env = "BUCKETING_WINDOW_BOUNDS",
        default_value = "half-open",
        global = true,
        help = "allocation window semantics: half-open or inclusive"
    )]
    window_bounds: WindowBounds,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check matrix files and report tests that would be dropped
    Validate {
        #[arg(long, env = "BUCKETING_MATRIX", help = "matrix file or directory of matrix files")]
        matrix: PathBuf,

        #[command(flatten)]
        context: ContextArgs,

        #[arg(long, help = "rule variable that is only known at request time")]
        absent: Vec<String>,
    },

    /// Print the buckets assigned to one set of identifiers as JSON
    Assign {
        #[arg(long, env = "BUCKETING_MATRIX", help = "matrix file")]
        matrix: PathBuf,

        #[arg(long = "id", value_parser = parse_identifier, required = true, help = "identifier as TYPE=value, e.g. USER=42")]
        ids: Vec<(TestType, String)>,

        #[arg(long, help = "enable RANDOM tests for this request")]
        random: bool,

        #[command(flatten)]
        context: ContextArgs,

        #[arg(long, help = "force string, e.g. 'colorTest1,pageTest0,default_to_fallback'")]
        force: Option<String>,

        #[arg(long = "test", help = "only assign the named tests (and their dependencies)")]
        tests: Vec<String>,
    },

    /// Print bucket tables or matrix JSON for the loaded tests
    Dump {
        #[arg(long, env = "BUCKETING_MATRIX", help = "matrix file")]
        matrix: PathBuf,

        #[arg(long, help = "only tests of this type")]
        test_type: Option<TestType>,

        #[arg(long = "test", help = "only the named tests")]
        tests: Vec<String>,

        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,
    },
}

#[derive(Args, Debug, Default)]
struct ContextArgs {
    #[arg(long = "context", value_parser = parse_context_entry, help = "rule variable as name=value; JSON values are parsed, anything else is a string")]
    entries: Vec<(String, ContextValue)>,
}

impl ContextArgs {
    fn to_context(&self) -> RuleContext {
        self.entries.iter().cloned().collect()
    }
}

fn parse_context_entry(raw: &str) -> std::result::Result<(String, ContextValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, found '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str::<ContextValue>(value)
        .unwrap_or_else(|_| ContextValue::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn parse_identifier(raw: &str) -> std::result::Result<(TestType, String), String> {
    let (test_type, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TYPE=value, found '{raw}'"))?;
    let test_type = test_type.parse::<TestType>().map_err(|e| e.to_string())?;
    Ok((test_type, value.to_string()))
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("BUCKETING_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(
    matrix: &TestMatrix,
    provided: &ProvidedContext,
    config: &EngineConfig,
) -> Result<Engine> {
    let (verified, load_result) = validation::verify_matrix(matrix, provided);
    Ok(Engine::construct_with(
        verified,
        load_result,
        config,
        provided.functions(),
        NoopValidator,
    )?)
}

/// Validate every matrix under `root`. Without context or absent names,
/// rules are only parsed, not evaluated.
fn validate(
    root: &Path,
    context: &ContextArgs,
    absent: &[String],
    config: &EngineConfig,
) -> Result<Vec<ValidationReport>> {
    let loader = MatrixLoader::new()?;
    let files = loader.load_all(root)?;
    if files.is_empty() {
        return Err(AppError::Validation(format!(
            "No matrix files found under {}",
            root.display()
        )));
    }

    let provided = if context.entries.is_empty() && absent.is_empty() {
        ProvidedContext::unavailable()
    } else {
        let absent: BTreeSet<String> = absent.iter().cloned().collect();
        ProvidedContext::new(context.to_context(), absent)
    };

    files
        .iter()
        .map(|file| {
            let engine = build_engine(&file.matrix, &provided, config)?;
            Ok(ValidationReport::new(file.path.display().to_string(), &engine))
        })
        .collect()
}

fn assign(
    matrix: &Path,
    identifiers: Identifiers,
    context: &ContextArgs,
    force: Option<&str>,
    tests: &[String],
    config: &EngineConfig,
) -> Result<AssignmentResult> {
    let file = MatrixLoader::new()?.load_file(matrix)?;
    let engine = build_engine(&file.matrix, &ProvidedContext::unavailable(), config)?;
    let force = force.map(ForceGroupsOptions::parse).unwrap_or_default();
    let filter: Vec<&str> = tests.iter().map(String::as_str).collect();
    Ok(engine.determine_assignments(&identifiers, &context.to_context(), &force, &filter))
}

fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::default()
        .with_hash_salt(cli.salt)
        .with_window_bounds(cli.window_bounds);

    match cli.command {
        Command::Validate {
            matrix,
            context,
            absent,
        } => {
            let reports = validate(&matrix, &context, &absent, &config)?;
            print!("{}", output::render_reports(&reports));
            let invalid: usize = reports.iter().map(|r| r.invalid.len()).sum();
            if invalid > 0 {
                return Err(AppError::Validation(format!(
                    "{invalid} invalid test(s) found"
                )));
            }
        }
        Command::Assign {
            matrix,
            ids,
            random,
            context,
            force,
            tests,
        } => {
            let identifiers = ids
                .into_iter()
                .collect::<Identifiers>()
                .with_random_enabled(random);
            let result = assign(&matrix, identifiers, &context, force.as_deref(), &tests, &config)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Dump {
            matrix,
            test_type,
            tests,
            format,
        } => {
            let file = MatrixLoader::new()?.load_file(&matrix)?;
            let engine = build_engine(&file.matrix, &ProvidedContext::unavailable(), &config)?;
            print!("{}", output::render_dump(&engine, format, test_type, &tests)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use tempfile::TempDir;

    const MATRIX: &str = r#"{
        "audit": {"version": "3"},
        "tests": {
            "colorTest": {
                "testType": "USER",
                "buckets": [{"name": "control", "value": 0}, {"name": "blue", "value": 1}],
                "allocations": [
                    {"rule": "${country == 'US'}", "ranges": [{"bucketValue": 1, "length": 1.0}]},
                    {"ranges": [{"bucketValue": 0, "length": 1.0}]}
                ]
            },
            "brokenTest": {
                "testType": "USER",
                "buckets": [{"name": "control", "value": 0}],
                "allocations": [{"ranges": [{"bucketValue": 0, "length": 0.4}]}]
            }
        }
    }"#;

    fn write_matrix(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("matrix.json");
        fs::write(&path, MATRIX).unwrap();
        path
    }

    fn context(entries: &[&str]) -> ContextArgs {
        ContextArgs {
            entries: entries
                .iter()
                .map(|e| parse_context_entry(e).unwrap())
                .collect(),
        }
    }

    #[test]
    fn test_parse_context_entry_types() {
        assert_eq!(
            parse_context_entry("country=US").unwrap(),
            ("country".to_string(), ContextValue::String("US".to_string()))
        );
        assert_eq!(
            parse_context_entry("age=30").unwrap(),
            ("age".to_string(), ContextValue::Int(30))
        );
        assert_eq!(
            parse_context_entry("beta=true").unwrap(),
            ("beta".to_string(), ContextValue::Bool(true))
        );
        assert_eq!(
            parse_context_entry(r#"langs=["en","fr"]"#).unwrap().1,
            ContextValue::StringList(vec!["en".to_string(), "fr".to_string()])
        );
        assert!(parse_context_entry("noequals").is_err());
        assert!(parse_context_entry("=value").is_err());
    }

    #[test]
    fn test_parse_identifier() {
        assert_eq!(
            parse_identifier("USER=42").unwrap(),
            (TestType::User, "42".to_string())
        );
        assert_eq!(
            parse_identifier("page=home").unwrap(),
            (TestType::Page, "home".to_string())
        );
        assert!(parse_identifier("DEVICE=1").is_err());
        assert!(parse_identifier("USER").is_err());
    }

    #[test]
    fn test_cli_parses_assign() {
        let cli = Cli::try_parse_from([
            "bucketing-cli",
            "assign",
            "--matrix",
            "m.json",
            "--id",
            "USER=42",
            "--context",
            "country=US",
            "--test",
            "colorTest",
            "--window-bounds",
            "inclusive",
        ])
        .unwrap();
        assert_eq!(cli.window_bounds, WindowBounds::Inclusive);
        match cli.command {
            Command::Assign { ids, tests, random, .. } => {
                assert_eq!(ids, vec![(TestType::User, "42".to_string())]);
                assert_eq!(tests, vec!["colorTest".to_string()]);
                assert!(!random);
            }
            other => panic!("Expected assign command, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_id_for_assign() {
        let result = Cli::try_parse_from(["bucketing-cli", "assign", "--matrix", "m.json"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_reports_invalid_tests() {
        let dir = TempDir::new().unwrap();
        write_matrix(&dir);

        let reports = validate(
            dir.path(),
            &ContextArgs::default(),
            &[],
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.stats.matrix_version, "3");
        assert_eq!(report.stats.test_count, 1);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].0, "brokenTest");
    }

    #[test]
    fn test_validate_empty_directory() {
        let dir = TempDir::new().unwrap();
        let result = validate(
            dir.path(),
            &ContextArgs::default(),
            &[],
            &EngineConfig::default(),
        );
        match result {
            Err(AppError::Validation(msg)) => assert!(msg.contains("No matrix files")),
            other => panic!("Expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_assign_uses_context() {
        let dir = TempDir::new().unwrap();
        let path = write_matrix(&dir);
        let ids = Identifiers::single(TestType::User, "42");

        let us = assign(&path, ids.clone(), &context(&["country=US"]), None, &[], &EngineConfig::default()).unwrap();
        assert_eq!(us.bucket("colorTest").map(|b| b.value), Some(1));
        assert!(us.bucket("brokenTest").is_none());

        let fr = assign(&path, ids, &context(&["country=FR"]), None, &[], &EngineConfig::default()).unwrap();
        assert_eq!(fr.bucket("colorTest").map(|b| b.value), Some(0));
    }

    #[test]
    fn test_assign_force_overrides_rule() {
        let dir = TempDir::new().unwrap();
        let path = write_matrix(&dir);
        let ids = Identifiers::single(TestType::User, "42");

        let result = assign(
            &path,
            ids,
            &context(&["country=US"]),
            Some("colorTest0"),
            &["colorTest".to_string()],
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(result.bucket("colorTest").map(|b| b.value), Some(0));
        assert_eq!(result.buckets().len(), 1);
    }
}
