//! Ordering of tests whose rules read other tests' buckets.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::TestDefinition;

/// The dependency graph among tests contains a cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cyclic dependency among tests: {}", .cycle.join(" -> "))]
pub struct CyclicDependencyError {
    /// Tests forming the cycle, first name repeated at the end.
    pub cycle: Vec<String>,
}

/// Known dependencies of `name`, skipping edges to tests not in `tests`.
fn known_dependencies<'a>(
    tests: &'a BTreeMap<String, TestDefinition>,
    name: &'a str,
    definition: &'a TestDefinition,
) -> impl Iterator<Item = &'a str> {
    definition.depends_on.iter().filter_map(move |dep| {
        if tests.contains_key(dep) {
            Some(dep.as_str())
        } else {
            tracing::debug!(test = name, dependency = %dep, "ignoring dependency on unknown test");
            None
        }
    })
}

/// Total evaluation order: every test appears after all tests it depends on.
/// Independent tests are ordered by name.
pub fn evaluation_order(
    tests: &BTreeMap<String, TestDefinition>,
) -> Result<Vec<String>, CyclicDependencyError> {
    let mut pending: HashMap<&str, usize> = HashMap::with_capacity(tests.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, definition) in tests {
        let mut count = 0;
        for dep in known_dependencies(tests, name, definition) {
            dependents.entry(dep).or_default().push(name);
            count += 1;
        }
        pending.insert(name, count);
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut order = Vec::with_capacity(tests.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for &dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < tests.len() {
        let unresolved: BTreeSet<&str> = pending
            .into_iter()
            .filter(|&(_, count)| count > 0)
            .map(|(name, _)| name)
            .collect();
        return Err(CyclicDependencyError {
            cycle: find_cycle(tests, &unresolved),
        });
    }
    Ok(order)
}

// Every unresolved test has at least one unresolved dependency, so following
// the first one from any start must revisit a test.
fn find_cycle(tests: &BTreeMap<String, TestDefinition>, unresolved: &BTreeSet<&str>) -> Vec<String> {
    let Some(&start) = unresolved.first() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&index) = position.get(current) {
            let mut cycle: Vec<String> = path[index..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        let next = tests.get(current).and_then(|definition| {
            definition
                .depends_on
                .iter()
                .map(String::as_str)
                .find(|dep| unresolved.contains(dep))
        });
        match next {
            Some(next) => current = next,
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// The requested tests plus everything reachable through `depends_on`.
///
/// Only the reachable subgraph is visited. Requested names that are not in
/// `tests` are ignored.
pub fn transitive_dependencies<S: AsRef<str>>(
    tests: &BTreeMap<String, TestDefinition>,
    requested: impl IntoIterator<Item = S>,
) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = requested
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect();

    while let Some(name) = stack.pop() {
        if seen.contains(&name) {
            continue;
        }
        let Some(definition) = tests.get(&name) else {
            continue;
        };
        stack.extend(
            definition
                .depends_on
                .iter()
                .filter(|dep| !seen.contains(*dep))
                .cloned(),
        );
        seen.insert(name);
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestType;

    fn make_tests(edges: &[(&str, &[&str])]) -> BTreeMap<String, TestDefinition> {
        edges
            .iter()
            .map(|(name, deps)| {
                let mut definition = TestDefinition::new(TestType::User);
                definition.depends_on = deps.iter().map(|d| d.to_string()).collect();
                (name.to_string(), definition)
            })
            .collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_order_respects_dependencies() {
        let tests = make_tests(&[
            ("a", &["c"]),
            ("b", &[]),
            ("c", &["d", "b"]),
            ("d", &[]),
            ("e", &["a"]),
        ]);
        let order = evaluation_order(&tests).unwrap();
        assert_eq!(order.len(), 5);
        for (name, definition) in &tests {
            for dep in &definition.depends_on {
                assert!(position(&order, dep) < position(&order, name), "{dep} before {name}");
            }
        }
    }

    #[test]
    fn test_independent_tests_ordered_by_name() {
        let tests = make_tests(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]);
        assert_eq!(evaluation_order(&tests).unwrap(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_order_is_stable() {
        let tests = make_tests(&[("x", &["y"]), ("y", &[]), ("w", &["y"]), ("v", &[])]);
        let first = evaluation_order(&tests).unwrap();
        for _ in 0..10 {
            assert_eq!(evaluation_order(&tests).unwrap(), first);
        }
        assert_eq!(first, vec!["v", "y", "w", "x"]);
    }

    #[test]
    fn test_unknown_dependency_ignored() {
        let tests = make_tests(&[("a", &["ghost"]), ("b", &["a"])]);
        assert_eq!(evaluation_order(&tests).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_reported() {
        let tests = make_tests(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])]);
        let err = evaluation_order(&tests).unwrap_err();
        assert_eq!(err.cycle, vec!["a", "b", "c", "a"]);
        assert_eq!(err.to_string(), "Cyclic dependency among tests: a -> b -> c -> a");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let tests = make_tests(&[("a", &["a"])]);
        let err = evaluation_order(&tests).unwrap_err();
        assert_eq!(err.cycle, vec!["a", "a"]);
    }

    #[test]
    fn test_cycle_reached_through_dependent() {
        // `a` is stuck only because it depends on the b <-> c cycle
        let tests = make_tests(&[("a", &["b"]), ("b", &["c"]), ("c", &["b"])]);
        let err = evaluation_order(&tests).unwrap_err();
        assert_eq!(err.cycle, vec!["b", "c", "b"]);
    }

    #[test]
    fn test_transitive_dependencies_minimal() {
        let tests = make_tests(&[
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &[]),
            ("d", &["c"]),
            ("e", &[]),
        ]);
        let closure = transitive_dependencies(&tests, ["a"]);
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let closure = transitive_dependencies(&tests, ["e", "d"]);
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec!["c", "d", "e"]);
    }

    #[test]
    fn test_transitive_dependencies_ignores_unknown_names() {
        let tests = make_tests(&[("a", &["ghost"])]);
        let closure = transitive_dependencies(&tests, ["a", "nope"]);
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn test_transitive_dependencies_terminates_on_cycle() {
        let tests = make_tests(&[("a", &["b"]), ("b", &["a"])]);
        assert_eq!(transitive_dependencies(&tests, ["a"]).len(), 2);
    }
}
