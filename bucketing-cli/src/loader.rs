use std::{
    fs,
    path::{Path, PathBuf},
};

use bucketing::TestMatrix;
use serde_json::Value;
use walkdir::WalkDir;

use crate::{AppError, Result};

const MATRIX_SCHEMA_JSON: &str = include_str!("matrix-schema.json");

/// A parsed matrix and the file it came from
#[derive(Debug)]
pub struct MatrixFile {
    pub path: PathBuf,
    pub matrix: TestMatrix,
}

/// Reads matrix documents and checks them against the embedded schema
/// before deserialising.
pub struct MatrixLoader {
    validator: jsonschema::Validator,
}

impl MatrixLoader {
    pub fn new() -> Result<Self> {
        let schema: Value = serde_json::from_str(MATRIX_SCHEMA_JSON)?;
        let validator = jsonschema::validator_for(&schema).map_err(|e| AppError::Schema {
            path: "matrix-schema.json".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { validator })
    }

    /// Load every `.json` and `.yaml` file under `root` in path order.
    /// `root` may also be a single file.
    pub fn load_all(&self, root: &Path) -> Result<Vec<MatrixFile>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let dir_entry = entry?;
            if !dir_entry.file_type().is_file() {
                continue;
            }
            let path = dir_entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("json" | "yaml" | "yml") => files.push(self.load_file(path)?),
                // skip READMEs and the like
                _ => continue,
            }
        }
        Ok(files)
    }

    pub fn load_file(&self, path: &Path) -> Result<MatrixFile> {
        let path_string = path.display().to_string();
        let document: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                let contents = fs::read_to_string(path)?;
                serde_json::from_str(&contents).map_err(|source| AppError::JsonParse {
                    path: path_string.clone(),
                    source,
                })?
            }
            Some("yaml") => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str(&contents).map_err(|source| AppError::YamlParse {
                    path: path_string.clone(),
                    source,
                })?
            }
            Some("yml") => {
                return Err(AppError::Validation(format!(
                    "Invalid file {}: expected .yaml, found .yml",
                    path_string
                )));
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "Invalid file {}: expected .json or .yaml",
                    path_string
                )));
            }
        };

        self.check_schema(&document, &path_string)?;

        let matrix: TestMatrix =
            serde_json::from_value(document).map_err(|source| AppError::JsonParse {
                path: path_string.clone(),
                source,
            })?;
        tracing::debug!(
            path = %path_string,
            version = %matrix.audit.version,
            tests = matrix.tests.len(),
            "loaded test matrix"
        );
        Ok(MatrixFile {
            path: path.to_path_buf(),
            matrix,
        })
    }

    fn check_schema(&self, document: &Value, path: &str) -> Result<()> {
        let output = self.validator.evaluate(document);

        if output.flag().valid {
            Ok(())
        } else {
            let errors: Vec<String> = output
                .iter_errors()
                .map(|e| format!("Error: {}", e.error))
                .collect();

            Err(AppError::Schema {
                path: path.to_string(),
                message: format!("Matrix validation failed:\n{}", errors.join("\n")),
            })
        }
    }
}
