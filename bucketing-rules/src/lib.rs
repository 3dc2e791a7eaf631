//! Eligibility rule language for the bucketing engine.
//!
//! Rules are boolean expressions such as `${country == 'US' && !empty lang}`
//! evaluated against a [`Scope`] of named values. The same parser backs two
//! call sites:
//!
//! - [`verify`] runs when a test matrix is loaded. It checks syntax and, when a
//!   best-effort context is available, that the rule is boolean-typed, only
//!   references known identifiers, and evaluates cleanly. Failures involving
//!   identifiers the caller declared as expectedly absent are tolerated.
//! - [`Rule::evaluate`] / [`evaluate`] run per request. Any failure there is
//!   reported to the caller, which treats the rule as not matching.
//!
//! Function names are resolved against a [`FunctionRegistry`]; the plain
//! entry points use the built-ins and the `_with` variants take a registry.

mod context;
mod eval;
pub mod functions;
mod lexer;
mod parser;

use std::collections::BTreeSet;
use std::fmt;

pub use context::{ContextValue, EmptyScope, Layered, RuleContext, Scope};
pub use eval::{EvalError, StaticType};
pub use functions::{Function, FunctionRegistry, builtins};

use parser::{Expr, ParseError};

/// Result type for rule verification
pub type RuleResult<T> = Result<T, InvalidRuleError>;

/// A rule failed to parse, type-check, or evaluate during verification.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidRuleError {
    #[error("Rule {rule} has invalid syntax: {message}")]
    Syntax { rule: String, message: String },

    #[error("Rule {rule} has invalid syntax or unknown function '{function}'")]
    UnknownFunction { rule: String, function: String },

    #[error("Rule is not a boolean condition '{rule}'")]
    NotBoolean { rule: String },

    #[error("Rule {rule} contains undefined identifier '{identifier}'")]
    UndefinedIdentifier { rule: String, identifier: String },

    #[error("Failed to evaluate a rule {rule}: {source}")]
    Evaluation {
        rule: String,
        #[source]
        source: EvalError,
    },
}

/// Strip an optional `${ ... }` wrapper and surrounding whitespace.
pub fn strip_braces(rule: &str) -> &str {
    let trimmed = rule.trim();
    trimmed
        .strip_prefix("${")
        .and_then(|inner| inner.strip_suffix('}'))
        .unwrap_or(trimmed)
        .trim()
}

/// True if the rule text contains no expression (always eligible).
pub fn is_blank(rule: &str) -> bool {
    strip_braces(rule).is_empty()
}

/// A compiled rule expression.
pub struct Rule {
    text: String,
    expr: Expr,
}

impl Rule {
    /// Parse rule text. Blank rules are rejected; callers treat them as
    /// "always eligible" before compiling.
    pub fn parse(text: &str) -> RuleResult<Self> {
        Self::parse_with(text, builtins())
    }

    /// Parse rule text, resolving function calls against `functions`.
    pub fn parse_with(text: &str, functions: &FunctionRegistry) -> RuleResult<Self> {
        let expr = parser::parse(strip_braces(text), functions).map_err(|e| match e {
            ParseError::Syntax(message) => InvalidRuleError::Syntax {
                rule: text.to_string(),
                message,
            },
            ParseError::UnknownFunction(function) => InvalidRuleError::UnknownFunction {
                rule: text.to_string(),
                function,
            },
        })?;
        Ok(Self {
            text: text.to_string(),
            expr,
        })
    }

    /// Parse rule text, mapping blank rules to `None`.
    pub fn compile(text: Option<&str>) -> RuleResult<Option<Self>> {
        Self::compile_with(text, builtins())
    }

    pub fn compile_with(
        text: Option<&str>,
        functions: &FunctionRegistry,
    ) -> RuleResult<Option<Self>> {
        match text {
            Some(text) if !is_blank(text) => Self::parse_with(text, functions).map(Some),
            _ => Ok(None),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Result type of the expression as far as it can be known statically.
    pub fn static_type(&self) -> StaticType {
        eval::infer_type(&self.expr)
    }

    /// Free identifiers referenced by the rule, sorted.
    pub fn identifiers(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.expr.collect_identifiers(&mut out);
        out
    }

    /// Evaluate against `scope`. `null` results count as `false`.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<bool, EvalError> {
        eval::evaluate_bool(&self.expr, scope)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rule").field(&self.text).finish()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Verify a rule at load time.
///
/// With `should_evaluate == false` only syntax is checked. Otherwise the rule
/// must be boolean-typed, every identifier must be bound in `scope` or listed
/// in `absent_identifiers`, and evaluation against `scope` must succeed unless
/// it failed for lack of a value while the rule mentions an absent identifier.
pub fn verify(
    rule: &str,
    should_evaluate: bool,
    scope: &dyn Scope,
    absent_identifiers: &BTreeSet<String>,
) -> RuleResult<()> {
    verify_with(rule, should_evaluate, scope, absent_identifiers, builtins())
}

/// [`verify`] with caller-supplied functions.
pub fn verify_with(
    rule: &str,
    should_evaluate: bool,
    scope: &dyn Scope,
    absent_identifiers: &BTreeSet<String>,
    functions: &FunctionRegistry,
) -> RuleResult<()> {
    if is_blank(rule) {
        return Ok(());
    }
    let compiled = Rule::parse_with(rule, functions)?;
    if !should_evaluate {
        return Ok(());
    }

    if !compiled.static_type().may_be_boolean() {
        return Err(InvalidRuleError::NotBoolean {
            rule: rule.to_string(),
        });
    }

    let identifiers = compiled.identifiers();
    if let Some(undefined) = identifiers
        .iter()
        .find(|name| !scope.has(name) && !absent_identifiers.contains(**name))
    {
        return Err(InvalidRuleError::UndefinedIdentifier {
            rule: rule.to_string(),
            identifier: undefined.to_string(),
        });
    }

    match compiled.evaluate(scope) {
        Ok(_) => Ok(()),
        Err(EvalError::NotBoolean(_)) => Err(InvalidRuleError::NotBoolean {
            rule: rule.to_string(),
        }),
        Err(e @ EvalError::MissingValue(_))
            if identifiers
                .iter()
                .any(|name| absent_identifiers.contains(*name)) =>
        {
            tracing::debug!(
                rule,
                error = %e,
                "rule references uninstantiated identifiers, ignoring the failure"
            );
            Ok(())
        }
        Err(source) => Err(InvalidRuleError::Evaluation {
            rule: rule.to_string(),
            source,
        }),
    }
}

/// Parse and evaluate a rule in one step. Blank rules are `true`; parse or
/// evaluation failures are logged and yield `false`.
pub fn evaluate(rule: &str, scope: &dyn Scope) -> bool {
    evaluate_with(rule, scope, builtins())
}

pub fn evaluate_with(rule: &str, scope: &dyn Scope, functions: &FunctionRegistry) -> bool {
    if is_blank(rule) {
        return true;
    }
    let compiled = match Rule::parse_with(rule, functions) {
        Ok(compiled) => compiled,
        Err(e) => {
            tracing::warn!(rule, error = %e, "failed to parse rule");
            return false;
        }
    };
    match compiled.evaluate(scope) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(rule, error = %e, "failed to evaluate rule");
            false
        }
    }
}
