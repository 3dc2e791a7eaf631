//! Per-request identifiers and their validation.

use std::collections::BTreeMap;

use crate::model::TestType;

/// Identifier per test type for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifiers {
    ids: BTreeMap<TestType, String>,
    random_enabled: bool,
}

impl Identifiers {
    /// No identifiers, random tests disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a request carrying a single identifier.
    pub fn single(test_type: TestType, identifier: impl Into<String>) -> Self {
        Self::new().with(test_type, identifier)
    }

    pub fn with(mut self, test_type: TestType, identifier: impl Into<String>) -> Self {
        self.insert(test_type, identifier);
        self
    }

    pub fn insert(&mut self, test_type: TestType, identifier: impl Into<String>) {
        self.ids.insert(test_type, identifier.into());
    }

    pub fn with_random_enabled(mut self, enabled: bool) -> Self {
        self.random_enabled = enabled;
        self
    }

    pub fn get(&self, test_type: TestType) -> Option<&str> {
        self.ids.get(&test_type).map(String::as_str)
    }

    pub fn is_random_enabled(&self) -> bool {
        self.random_enabled
    }

    pub fn iter(&self) -> impl Iterator<Item = (TestType, &str)> {
        self.ids.iter().map(|(t, id)| (*t, id.as_str()))
    }
}

impl<S: Into<String>> FromIterator<(TestType, S)> for Identifiers {
    fn from_iter<I: IntoIterator<Item = (TestType, S)>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(|(t, id)| (t, id.into())).collect(),
            random_enabled: false,
        }
    }
}

/// Checks whether an identifier is usable for its test type.
///
/// Invalid identifiers degrade every standard test of that type to "no
/// identifier" for the request.
pub trait IdentifierValidator: Send + Sync {
    fn validate(&self, test_type: TestType, identifier: &str) -> bool;
}

/// Accepts every identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl IdentifierValidator for NoopValidator {
    fn validate(&self, _test_type: TestType, _identifier: &str) -> bool {
        true
    }
}

impl<F> IdentifierValidator for F
where
    F: Fn(TestType, &str) -> bool + Send + Sync,
{
    fn validate(&self, test_type: TestType, identifier: &str) -> bool {
        self(test_type, identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_lookup() {
        let ids = Identifiers::single(TestType::User, "user-42")
            .with(TestType::Email, "a@example.com")
            .with_random_enabled(true);
        assert_eq!(ids.get(TestType::User), Some("user-42"));
        assert_eq!(ids.get(TestType::Page), None);
        assert!(ids.is_random_enabled());
        assert_eq!(
            ids.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            vec![TestType::User, TestType::Email]
        );
    }

    #[test]
    fn test_random_disabled_by_default() {
        let ids: Identifiers = [(TestType::Page, "/jobs")].into_iter().collect();
        assert!(!ids.is_random_enabled());
        assert_eq!(ids.get(TestType::Page), Some("/jobs"));
    }

    #[test]
    fn test_closure_validator() {
        let validator = |_: TestType, id: &str| !id.is_empty();
        assert!(validator.validate(TestType::User, "x"));
        assert!(!validator.validate(TestType::User, ""));
        assert!(NoopValidator.validate(TestType::User, ""));
    }
}
