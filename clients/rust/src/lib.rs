//! Deterministic experiment bucketing.
//!
//! An [`Engine`] is built from one [`TestMatrix`] snapshot and assigns each
//! request a bucket per test:
//!
//! ```rust,ignore
//! use bucketing::{Engine, ForceGroupsOptions, Identifiers, TestType};
//! use bucketing::validation::ProvidedContext;
//! use bucketing_rules::RuleContext;
//!
//! let engine = Engine::from_matrix(&matrix, &ProvidedContext::unavailable())?;
//! let result = engine.determine_assignments(
//!     &Identifiers::single(TestType::User, "user-42"),
//!     &RuleContext::new().with("country", "US"),
//!     &ForceGroupsOptions::new(),
//!     &[],
//! );
//! println!("{:?}", result.bucket("colorTest"));
//! ```

pub mod chooser;
pub mod config;
pub mod dependencies;
pub mod engine;
pub mod force_groups;
pub mod handle;
pub mod identifiers;
pub mod load_result;
pub mod model;
pub mod result;
pub mod testing;
pub mod validation;

pub use bucketing_rules::{ContextValue, Function, FunctionRegistry, InvalidRuleError, RuleContext};
pub use config::{EngineConfig, WindowBounds};
pub use dependencies::CyclicDependencyError;
pub use engine::{Engine, EngineStats, empty_engine};
pub use force_groups::{ForceGroupsDefaultMode, ForceGroupsOptions};
pub use handle::EngineHandle;
pub use identifiers::{IdentifierValidator, Identifiers, NoopValidator};
pub use load_result::{LoadResult, TestValidationError};
pub use model::{Allocation, Audit, Range, TestBucket, TestDefinition, TestMatrix, TestType};
pub use result::AssignmentResult;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid rule in test '{test}': {source}")]
    InvalidRule {
        test: String,
        #[source]
        source: InvalidRuleError,
    },

    #[error(transparent)]
    CyclicDependency(#[from] CyclicDependencyError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
