//! Values and variable scopes that rules are evaluated against.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

// ContextValue

/// A typed value that can be bound to a rule variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    BoolList(Vec<bool>),
    Map(BTreeMap<String, ContextValue>),
}

impl ContextValue {
    /// Human-readable type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ContextValue::Null => "null",
            ContextValue::Bool(_) => "bool",
            ContextValue::Int(_) => "int",
            ContextValue::Float(_) => "float",
            ContextValue::String(_) => "string",
            ContextValue::StringList(_)
            | ContextValue::IntList(_)
            | ContextValue::FloatList(_)
            | ContextValue::BoolList(_) => "list",
            ContextValue::Map(_) => "map",
        }
    }

    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ContextValue::Int(i) => Some(*i as f64),
            ContextValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(
            self,
            ContextValue::StringList(_)
                | ContextValue::IntList(_)
                | ContextValue::FloatList(_)
                | ContextValue::BoolList(_)
        )
    }

    /// Number of elements for lists and maps, characters for strings.
    pub fn len(&self) -> Option<usize> {
        match self {
            ContextValue::String(s) => Some(s.chars().count()),
            ContextValue::StringList(v) => Some(v.len()),
            ContextValue::IntList(v) => Some(v.len()),
            ContextValue::FloatList(v) => Some(v.len()),
            ContextValue::BoolList(v) => Some(v.len()),
            ContextValue::Map(m) => Some(m.len()),
            _ => None,
        }
    }

    /// `empty` semantics: null, or a string/list/map with no elements.
    pub fn is_empty(&self) -> bool {
        match self {
            ContextValue::Null => true,
            other => other.len() == Some(0),
        }
    }

    /// Element `index` of a list value.
    pub fn list_item(&self, index: usize) -> Option<ContextValue> {
        match self {
            ContextValue::StringList(v) => v.get(index).cloned().map(ContextValue::String),
            ContextValue::IntList(v) => v.get(index).copied().map(ContextValue::Int),
            ContextValue::FloatList(v) => v.get(index).copied().map(ContextValue::Float),
            ContextValue::BoolList(v) => v.get(index).copied().map(ContextValue::Bool),
            _ => None,
        }
    }

    /// Iterate list elements as scalar values; `None` if not a list.
    pub fn list_items(&self) -> Option<Vec<ContextValue>> {
        if !self.is_list() {
            return None;
        }
        (0..self.len()?).map(|i| self.list_item(i)).collect()
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Null => write!(f, "null"),
            ContextValue::Bool(b) => write!(f, "{b}"),
            ContextValue::Int(i) => write!(f, "{i}"),
            ContextValue::Float(v) => write!(f, "{v}"),
            ContextValue::String(s) => write!(f, "{s}"),
            ContextValue::StringList(v) => write!(f, "{v:?}"),
            ContextValue::IntList(v) => write!(f, "{v:?}"),
            ContextValue::FloatList(v) => write!(f, "{v:?}"),
            ContextValue::BoolList(v) => write!(f, "{v:?}"),
            ContextValue::Map(m) => {
                let pairs: Vec<String> = m.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::String(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::String(s)
    }
}

impl From<i64> for ContextValue {
    fn from(i: i64) -> Self {
        ContextValue::Int(i)
    }
}

impl From<i32> for ContextValue {
    fn from(i: i32) -> Self {
        ContextValue::Int(i as i64)
    }
}

impl From<f64> for ContextValue {
    fn from(f: f64) -> Self {
        ContextValue::Float(f)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Bool(b)
    }
}

impl From<Vec<String>> for ContextValue {
    fn from(v: Vec<String>) -> Self {
        ContextValue::StringList(v)
    }
}

impl From<Vec<&str>> for ContextValue {
    fn from(v: Vec<&str>) -> Self {
        ContextValue::StringList(v.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<i64>> for ContextValue {
    fn from(v: Vec<i64>) -> Self {
        ContextValue::IntList(v)
    }
}

impl From<BTreeMap<String, ContextValue>> for ContextValue {
    fn from(m: BTreeMap<String, ContextValue>) -> Self {
        ContextValue::Map(m)
    }
}

// Scope

/// Variable lookup used by rule evaluation.
///
/// Implementations may hand out borrowed values or build them on demand
/// (prior bucket assignments are exposed as integers this way).
pub trait Scope {
    fn resolve(&self, name: &str) -> Option<Cow<'_, ContextValue>>;

    fn has(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }
}

/// A scope with no variables bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn resolve(&self, _name: &str) -> Option<Cow<'_, ContextValue>> {
        None
    }
}

impl Scope for HashMap<String, ContextValue> {
    fn resolve(&self, name: &str) -> Option<Cow<'_, ContextValue>> {
        self.get(name).map(Cow::Borrowed)
    }
}

impl Scope for BTreeMap<String, ContextValue> {
    fn resolve(&self, name: &str) -> Option<Cow<'_, ContextValue>> {
        self.get(name).map(Cow::Borrowed)
    }
}

/// Scopes consulted in order; the first one binding a name wins.
pub struct Layered<'a> {
    layers: Vec<&'a dyn Scope>,
}

impl<'a> Layered<'a> {
    pub fn new(layers: Vec<&'a dyn Scope>) -> Self {
        Self { layers }
    }
}

impl Scope for Layered<'_> {
    fn resolve(&self, name: &str) -> Option<Cow<'_, ContextValue>> {
        self.layers.iter().find_map(|layer| layer.resolve(name))
    }
}

// RuleContext

/// Request variables supplied to rule evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleContext {
    data: HashMap<String, ContextValue>,
}

impl RuleContext {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Insert a value into the context, replacing any previous binding.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.data.insert(key.into(), value.into());
    }

    /// Builder-style [`RuleContext::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.data.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }
}

impl Scope for RuleContext {
    fn resolve(&self, name: &str) -> Option<Cow<'_, ContextValue>> {
        self.data.get(name).map(Cow::Borrowed)
    }
}

impl<K: Into<String>, V: Into<ContextValue>> FromIterator<(K, V)> for RuleContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
