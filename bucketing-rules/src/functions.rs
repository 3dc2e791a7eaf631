//! Functions callable from rules.
//!
//! Names are resolved against a [`FunctionRegistry`] when a rule is parsed,
//! so a typo in a function name is reported as an invalid rule instead of
//! failing every request.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::context::ContextValue;
use crate::eval::{EvalError, StaticType, values_equal};

/// Namespace prefix accepted in front of a function name (`fn:contains`).
pub const FUNCTION_NAMESPACE: &str = "fn";

type Callable = dyn Fn(&[ContextValue]) -> Result<ContextValue, EvalError> + Send + Sync;

/// A named function callable from rules.
///
/// The parser checks the argument count against `arity`, so the callable can
/// index into its arguments directly. `returns` feeds static type checking;
/// use [`StaticType::Unknown`] when the result type depends on the arguments.
pub struct Function {
    name: String,
    arity: usize,
    returns: StaticType,
    call: Box<Callable>,
}

impl Function {
    pub fn new<F>(name: impl Into<String>, arity: usize, returns: StaticType, call: F) -> Self
    where
        F: Fn(&[ContextValue]) -> Result<ContextValue, EvalError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            returns,
            call: Box::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn returns(&self) -> StaticType {
        self.returns
    }

    pub fn call(&self, args: &[ContextValue]) -> Result<ContextValue, EvalError> {
        (self.call)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("returns", &self.returns)
            .finish()
    }
}

/// The set of functions a rule may call, keyed by local name.
///
/// [`FunctionRegistry::default`] holds the built-ins; applications register
/// their own on top before compiling rules. Registering an existing name
/// replaces it.
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<Function>>,
}

impl FunctionRegistry {
    /// A registry with no functions at all.
    pub fn empty() -> Self {
        Self {
            functions: BTreeMap::new(),
        }
    }

    /// The built-in functions.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Function::new("contains", 2, StaticType::Bool, contains))
            .register(Function::new("startsWith", 2, StaticType::Bool, starts_with))
            .register(Function::new("endsWith", 2, StaticType::Bool, ends_with))
            .register(Function::new("toLowerCase", 1, StaticType::String, to_lower_case))
            .register(Function::new("toUpperCase", 1, StaticType::String, to_upper_case))
            .register(Function::new("length", 1, StaticType::Number, length))
            .register(Function::new("versionInRange", 3, StaticType::Bool, version_in_range));
        registry
    }

    pub fn register(&mut self, function: Function) -> &mut Self {
        self.functions.insert(function.name.clone(), Arc::new(function));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, function: Function) -> Self {
        self.register(function);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Function>> {
        self.functions.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Shared built-in registry used when no custom functions are supplied.
pub fn builtins() -> &'static FunctionRegistry {
    static BUILTINS: OnceLock<FunctionRegistry> = OnceLock::new();
    BUILTINS.get_or_init(FunctionRegistry::builtin)
}

fn string_arg<'a>(function: &str, value: &'a ContextValue) -> Result<&'a str, EvalError> {
    value.as_str().ok_or_else(|| EvalError::TypeMismatch {
        operation: function.to_string(),
        left: value.type_name(),
        right: "string",
    })
}

fn contains(args: &[ContextValue]) -> Result<ContextValue, EvalError> {
    let (haystack, needle) = (&args[0], &args[1]);
    if let Some(items) = haystack.list_items() {
        return Ok(ContextValue::Bool(
            items.iter().any(|item| values_equal(item, needle)),
        ));
    }
    match haystack {
        ContextValue::String(s) => Ok(ContextValue::Bool(s.contains(string_arg("contains", needle)?))),
        ContextValue::Map(m) => Ok(ContextValue::Bool(
            m.contains_key(string_arg("contains", needle)?),
        )),
        ContextValue::Null => Ok(ContextValue::Bool(false)),
        other => Err(EvalError::TypeMismatch {
            operation: "contains".to_string(),
            left: other.type_name(),
            right: needle.type_name(),
        }),
    }
}

fn starts_with(args: &[ContextValue]) -> Result<ContextValue, EvalError> {
    let s = string_arg("startsWith", &args[0])?;
    let prefix = string_arg("startsWith", &args[1])?;
    Ok(ContextValue::Bool(s.starts_with(prefix)))
}

fn ends_with(args: &[ContextValue]) -> Result<ContextValue, EvalError> {
    let s = string_arg("endsWith", &args[0])?;
    let suffix = string_arg("endsWith", &args[1])?;
    Ok(ContextValue::Bool(s.ends_with(suffix)))
}

fn to_lower_case(args: &[ContextValue]) -> Result<ContextValue, EvalError> {
    Ok(ContextValue::String(
        string_arg("toLowerCase", &args[0])?.to_lowercase(),
    ))
}

fn to_upper_case(args: &[ContextValue]) -> Result<ContextValue, EvalError> {
    Ok(ContextValue::String(
        string_arg("toUpperCase", &args[0])?.to_uppercase(),
    ))
}

fn length(args: &[ContextValue]) -> Result<ContextValue, EvalError> {
    match &args[0] {
        ContextValue::Null => Ok(ContextValue::Int(0)),
        other => other
            .len()
            .map(|n| ContextValue::Int(n as i64))
            .ok_or_else(|| EvalError::TypeMismatch {
                operation: "length".to_string(),
                left: other.type_name(),
                right: "collection",
            }),
    }
}

/// `lo <= version < hi`, comparing dot-separated numeric components.
fn version_in_range(args: &[ContextValue]) -> Result<ContextValue, EvalError> {
    let version = parse_version(string_arg("versionInRange", &args[0])?)?;
    let lo = parse_version(string_arg("versionInRange", &args[1])?)?;
    let hi = parse_version(string_arg("versionInRange", &args[2])?)?;
    Ok(ContextValue::Bool(
        compare_versions(&version, &lo) != Ordering::Less
            && compare_versions(&version, &hi) == Ordering::Less,
    ))
}

fn parse_version(text: &str) -> Result<Vec<u64>, EvalError> {
    text.trim()
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| EvalError::InvalidArgument(format!("'{text}' is not a version")))
        })
        .collect()
}

// Missing trailing components compare as zero, so "1.2" == "1.2.0".
fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
