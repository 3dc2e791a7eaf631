//! Evaluation of parsed rules against a [`Scope`].

use std::cmp::Ordering;

use crate::context::{ContextValue, Scope};
use crate::parser::{BinaryOp, Expr, UnaryOp};

/// Errors raised while evaluating a rule against concrete values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("identifier '{0}' has no value")]
    MissingValue(String),

    #[error("cannot apply '{operation}' to {left} and {right}")]
    TypeMismatch {
        operation: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,

    #[error("index {index} is out of bounds")]
    IndexOutOfBounds { index: i64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("expression produced {0}, expected a boolean")]
    NotBoolean(&'static str),
}

/// Result type known before evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticType {
    Bool,
    Number,
    String,
    Null,
    /// Depends on runtime values (identifiers, member access).
    Unknown,
}

impl StaticType {
    pub fn may_be_boolean(self) -> bool {
        matches!(self, StaticType::Bool | StaticType::Unknown)
    }
}

pub(crate) fn infer_type(expr: &Expr) -> StaticType {
    match expr {
        Expr::Literal(value) => match value {
            ContextValue::Bool(_) => StaticType::Bool,
            ContextValue::Int(_) | ContextValue::Float(_) => StaticType::Number,
            ContextValue::String(_) => StaticType::String,
            ContextValue::Null => StaticType::Null,
            _ => StaticType::Unknown,
        },
        Expr::Identifier(_) | Expr::Member(..) | Expr::Index(..) => StaticType::Unknown,
        Expr::Unary(UnaryOp::Neg, _) => StaticType::Number,
        Expr::Unary(UnaryOp::Not | UnaryOp::Empty, _) => StaticType::Bool,
        Expr::Binary(op, ..) => match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                StaticType::Number
            }
            _ => StaticType::Bool,
        },
        Expr::Call(function, _) => function.returns(),
    }
}

pub(crate) fn evaluate_bool(expr: &Expr, scope: &dyn Scope) -> Result<bool, EvalError> {
    match evaluate(expr, scope)? {
        ContextValue::Bool(b) => Ok(b),
        ContextValue::Null => Ok(false),
        other => Err(EvalError::NotBoolean(other.type_name())),
    }
}

pub(crate) fn evaluate(expr: &Expr, scope: &dyn Scope) -> Result<ContextValue, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Identifier(name) => scope
            .resolve(name)
            .map(|value| value.into_owned())
            .ok_or_else(|| EvalError::MissingValue(name.clone())),
        Expr::Member(target, property) => match evaluate(target, scope)? {
            ContextValue::Map(mut map) => Ok(map.remove(property).unwrap_or(ContextValue::Null)),
            ContextValue::Null => Ok(ContextValue::Null),
            other => Err(EvalError::TypeMismatch {
                operation: format!(".{property}"),
                left: other.type_name(),
                right: "property",
            }),
        },
        Expr::Index(target, index) => {
            let target = evaluate(target, scope)?;
            let index = evaluate(index, scope)?;
            index_value(target, index)
        }
        Expr::Unary(op, operand) => match op {
            UnaryOp::Not => Ok(ContextValue::Bool(!truthy(evaluate(operand, scope)?, "!")?)),
            UnaryOp::Neg => match evaluate(operand, scope)? {
                ContextValue::Int(i) => i.checked_neg().map(ContextValue::Int).ok_or(EvalError::Overflow),
                ContextValue::Float(f) => Ok(ContextValue::Float(-f)),
                other => Err(EvalError::TypeMismatch {
                    operation: "-".to_string(),
                    left: other.type_name(),
                    right: "number",
                }),
            },
            UnaryOp::Empty => match evaluate(operand, scope) {
                Ok(value) => Ok(ContextValue::Bool(value.is_empty())),
                Err(EvalError::MissingValue(_)) => Ok(ContextValue::Bool(true)),
                Err(e) => Err(e),
            },
        },
        Expr::Binary(BinaryOp::And, left, right) => {
            if !truthy(evaluate(left, scope)?, "&&")? {
                return Ok(ContextValue::Bool(false));
            }
            Ok(ContextValue::Bool(truthy(evaluate(right, scope)?, "&&")?))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if truthy(evaluate(left, scope)?, "||")? {
                return Ok(ContextValue::Bool(true));
            }
            Ok(ContextValue::Bool(truthy(evaluate(right, scope)?, "||")?))
        }
        Expr::Binary(op, left, right) => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            binary(*op, &left, &right)
        }
        Expr::Call(function, args) => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            function.call(&values)
        }
    }
}

fn truthy(value: ContextValue, operation: &str) -> Result<bool, EvalError> {
    match value {
        ContextValue::Bool(b) => Ok(b),
        ContextValue::Null => Ok(false),
        other => Err(EvalError::TypeMismatch {
            operation: operation.to_string(),
            left: other.type_name(),
            right: "bool",
        }),
    }
}

fn index_value(target: ContextValue, index: ContextValue) -> Result<ContextValue, EvalError> {
    match (&target, &index) {
        (ContextValue::Map(map), ContextValue::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(ContextValue::Null))
        }
        (ContextValue::Null, _) => Ok(ContextValue::Null),
        (_, ContextValue::Int(i)) if target.is_list() => {
            let position =
                usize::try_from(*i).map_err(|_| EvalError::IndexOutOfBounds { index: *i })?;
            target
                .list_item(position)
                .ok_or(EvalError::IndexOutOfBounds { index: *i })
        }
        _ => Err(EvalError::TypeMismatch {
            operation: "[]".to_string(),
            left: target.type_name(),
            right: index.type_name(),
        }),
    }
}

/// Equality used by `==`, `!=` and `contains`. Values of unrelated types are unequal.
pub(crate) fn values_equal(left: &ContextValue, right: &ContextValue) -> bool {
    match (left, right) {
        (ContextValue::Int(a), ContextValue::Int(b)) => a == b,
        (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

fn compare(op: BinaryOp, left: &ContextValue, right: &ContextValue) -> Result<Ordering, EvalError> {
    let ordering = match (left, right) {
        (ContextValue::Int(a), ContextValue::Int(b)) => Some(a.cmp(b)),
        (ContextValue::String(a), ContextValue::String(b)) => Some(a.cmp(b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    ordering.ok_or_else(|| EvalError::TypeMismatch {
        operation: op.symbol().to_string(),
        left: left.type_name(),
        right: right.type_name(),
    })
}

fn binary(op: BinaryOp, left: &ContextValue, right: &ContextValue) -> Result<ContextValue, EvalError> {
    let result = match op {
        BinaryOp::Eq => ContextValue::Bool(values_equal(left, right)),
        BinaryOp::Ne => ContextValue::Bool(!values_equal(left, right)),
        BinaryOp::Lt => ContextValue::Bool(compare(op, left, right)? == Ordering::Less),
        BinaryOp::Gt => ContextValue::Bool(compare(op, left, right)? == Ordering::Greater),
        BinaryOp::Le => ContextValue::Bool(compare(op, left, right)? != Ordering::Greater),
        BinaryOp::Ge => ContextValue::Bool(compare(op, left, right)? != Ordering::Less),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, left, right)?
        }
        // evaluate() short-circuits these before reaching here
        BinaryOp::And => ContextValue::Bool(
            truthy(left.clone(), "&&")? && truthy(right.clone(), "&&")?,
        ),
        BinaryOp::Or => ContextValue::Bool(
            truthy(left.clone(), "||")? || truthy(right.clone(), "||")?,
        ),
    };
    Ok(result)
}

fn arithmetic(op: BinaryOp, left: &ContextValue, right: &ContextValue) -> Result<ContextValue, EvalError> {
    let mismatch = || EvalError::TypeMismatch {
        operation: op.symbol().to_string(),
        left: left.type_name(),
        right: right.type_name(),
    };
    if let (ContextValue::Int(a), ContextValue::Int(b)) = (left, right) {
        let (a, b) = (*a, *b);
        let value = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Rem if b == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Rem => a.checked_rem(b),
            BinaryOp::Div if b == 0 => return Err(EvalError::DivisionByZero),
            // division always produces a float
            BinaryOp::Div => return Ok(ContextValue::Float(a as f64 / b as f64)),
            _ => return Err(mismatch()),
        };
        return value.map(ContextValue::Int).ok_or(EvalError::Overflow);
    }
    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(mismatch()),
    };
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(mismatch()),
    };
    Ok(ContextValue::Float(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuleContext;
    use crate::functions::builtins;
    use std::collections::BTreeMap;

    fn parse(source: &str) -> Result<Expr, crate::parser::ParseError> {
        crate::parser::parse(source, builtins())
    }

    fn eval(source: &str, ctx: &RuleContext) -> Result<ContextValue, EvalError> {
        evaluate(&parse(source).unwrap(), ctx)
    }

    fn eval_bool(source: &str, ctx: &RuleContext) -> Result<bool, EvalError> {
        evaluate_bool(&parse(source).unwrap(), ctx)
    }

    #[test]
    fn test_comparisons() {
        let ctx = RuleContext::new()
            .with("country", "US")
            .with("age", 30i64)
            .with("score", 0.75);
        assert_eq!(eval_bool("country == 'US'", &ctx), Ok(true));
        assert_eq!(eval_bool("country ne 'US'", &ctx), Ok(false));
        assert_eq!(eval_bool("age >= 18 && age lt 65", &ctx), Ok(true));
        assert_eq!(eval_bool("score > 0.5", &ctx), Ok(true));
        assert_eq!(eval_bool("age == 30.0", &ctx), Ok(true));
    }

    #[test]
    fn test_mismatched_equality_is_false() {
        let ctx = RuleContext::new().with("age", 30i64);
        assert_eq!(eval_bool("age == '30'", &ctx), Ok(false));
        assert_eq!(eval_bool("age != '30'", &ctx), Ok(true));
    }

    #[test]
    fn test_mismatched_ordering_errors() {
        let ctx = RuleContext::new().with("age", 30i64);
        assert!(matches!(
            eval_bool("age < 'thirty'", &ctx),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_identifier() {
        let ctx = RuleContext::new();
        assert_eq!(
            eval_bool("lang == 'en'", &ctx),
            Err(EvalError::MissingValue("lang".into()))
        );
        // empty tolerates missing values
        assert_eq!(eval_bool("empty lang", &ctx), Ok(true));
    }

    #[test]
    fn test_short_circuit_skips_missing() {
        let ctx = RuleContext::new().with("enabled", false);
        assert_eq!(eval_bool("enabled && missing > 1", &ctx), Ok(false));
        assert_eq!(eval_bool("!enabled || missing > 1", &ctx), Ok(true));
    }

    #[test]
    fn test_member_and_index_access() {
        let ua = BTreeMap::from([
            ("android".to_string(), ContextValue::Bool(true)),
            ("version".to_string(), ContextValue::String("5.1".into())),
        ]);
        let ctx = RuleContext::new()
            .with("ua", ua)
            .with("langs", vec!["en", "fr"]);
        assert_eq!(eval_bool("ua.android", &ctx), Ok(true));
        assert_eq!(eval_bool("ua.ios", &ctx), Ok(false));
        assert_eq!(eval_bool("ua['version'] == '5.1'", &ctx), Ok(true));
        assert_eq!(eval_bool("langs[1] == 'fr'", &ctx), Ok(true));
        assert_eq!(
            eval("langs[5]", &ctx),
            Err(EvalError::IndexOutOfBounds { index: 5 })
        );
    }

    #[test]
    fn test_arithmetic() {
        let ctx = RuleContext::new().with("n", 7i64);
        assert_eq!(eval("n % 2", &ctx), Ok(ContextValue::Int(1)));
        assert_eq!(eval("n / 2", &ctx), Ok(ContextValue::Float(3.5)));
        assert_eq!(eval("-n + 1", &ctx), Ok(ContextValue::Int(-6)));
        assert_eq!(eval("n div 0", &ctx), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn test_non_boolean_result() {
        let ctx = RuleContext::new().with("n", 7i64);
        assert_eq!(eval_bool("n", &ctx), Err(EvalError::NotBoolean("int")));
        assert_eq!(eval_bool("null", &ctx), Ok(false));
    }

    #[test]
    fn test_infer_type() {
        assert_eq!(infer_type(&parse("1 + 2").unwrap()), StaticType::Number);
        assert_eq!(infer_type(&parse("'a'").unwrap()), StaticType::String);
        assert_eq!(infer_type(&parse("a == 1").unwrap()), StaticType::Bool);
        assert_eq!(infer_type(&parse("a").unwrap()), StaticType::Unknown);
        assert_eq!(infer_type(&parse("toLowerCase(a)").unwrap()), StaticType::String);
    }
}
