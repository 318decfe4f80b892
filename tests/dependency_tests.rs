use std::collections::{HashMap, HashSet};
use teamllm::dependency::{DependencyError, DependencyResolver};

fn ids(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn deps(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    pairs
        .iter()
        .map(|(team, prereqs)| {
            (
                team.to_string(),
                prereqs.iter().map(|s| s.to_string()).collect(),
            )
        })
        .collect()
}

#[test]
fn test_build_dependency_graph_is_a_defensive_copy() {
    let resolver = DependencyResolver::new();
    let mut dependencies = deps(&[("team_b", &["team_a"])]);

    let graph = resolver.build_dependency_graph(&dependencies);
    dependencies.insert("team_c".to_string(), vec!["team_b".to_string()]);

    assert!(!graph.contains_key("team_c"));
    assert_eq!(graph["team_b"], vec!["team_a".to_string()]);
}

#[test]
fn test_validate_dependencies_valid() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_b", &["team_a"]), ("team_c", &["team_b"])]);

    let problems =
        resolver.validate_dependencies(&dependencies, &ids(&["team_a", "team_b", "team_c"]));
    assert!(problems.is_empty());
}

#[test]
fn test_validate_dependencies_unknown_key() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_x", &["team_a"])]);

    let problems = resolver.validate_dependencies(&dependencies, &ids(&["team_a", "team_b"]));
    assert_eq!(problems.len(), 1);
    assert!(problems[0].contains("Dependency key 'team_x'"));
}

#[test]
fn test_validate_dependencies_unknown_value() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_b", &["team_x"])]);

    let problems = resolver.validate_dependencies(&dependencies, &ids(&["team_a", "team_b"]));
    assert_eq!(problems.len(), 1);
    assert!(problems[0].contains("Dependency 'team_x' for team 'team_b'"));
}

#[test]
fn test_validate_dependencies_self_dependency() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_a", &["team_a"])]);

    let problems = resolver.validate_dependencies(&dependencies, &ids(&["team_a", "team_b"]));
    assert!(problems
        .iter()
        .any(|p| p.contains("Team 'team_a' cannot depend on itself")));
}

#[test]
fn test_detect_cycles_none() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_b", &["team_a"]), ("team_c", &["team_b"])]);

    assert!(resolver.detect_circular_dependencies(&dependencies).is_empty());
}

#[test]
fn test_detect_cycles_simple() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_a", &["team_b"]), ("team_b", &["team_a"])]);

    let cycles = resolver.detect_circular_dependencies(&dependencies);
    assert!(!cycles.is_empty());
    assert!(cycles
        .iter()
        .any(|cycle| cycle.contains(&"team_a".to_string()) && cycle.contains(&"team_b".to_string())));
}

#[test]
fn test_detect_cycles_three_nodes() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[
        ("team_a", &["team_c"]),
        ("team_b", &["team_a"]),
        ("team_c", &["team_b"]),
    ]);

    let cycles = resolver.detect_circular_dependencies(&dependencies);
    assert!(cycles.iter().any(|cycle| {
        ["team_a", "team_b", "team_c"]
            .iter()
            .all(|team| cycle.contains(&team.to_string()))
    }));
}

#[test]
fn test_detect_cycles_in_disconnected_component() {
    let resolver = DependencyResolver::new();
    // One clean chain plus a separate two-node loop.
    let dependencies = deps(&[
        ("team_b", &["team_a"]),
        ("team_x", &["team_y"]),
        ("team_y", &["team_x"]),
    ]);

    let cycles = resolver.detect_circular_dependencies(&dependencies);
    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].contains(&"team_x".to_string()));
}

#[test]
fn test_execution_order_no_dependencies_is_lexicographic() {
    let resolver = DependencyResolver::new();
    let order = resolver
        .calculate_execution_order(&HashMap::new(), &ids(&["team_c", "team_a", "team_b"]))
        .unwrap();
    assert_eq!(order, vec!["team_a", "team_b", "team_c"]);
}

#[test]
fn test_execution_order_linear() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_b", &["team_a"]), ("team_c", &["team_b"])]);

    let order = resolver
        .calculate_execution_order(&dependencies, &ids(&["team_a", "team_b", "team_c"]))
        .unwrap();
    assert_eq!(order, vec!["team_a", "team_b", "team_c"]);
}

#[test]
fn test_execution_order_respects_all_prerequisites() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[
        ("team_b", &["team_a"]),
        ("team_c", &["team_a"]),
        ("team_d", &["team_b", "team_c"]),
        ("team_e", &["team_d"]),
    ]);
    let team_ids = ids(&["team_a", "team_b", "team_c", "team_d", "team_e"]);

    let order = resolver
        .calculate_execution_order(&dependencies, &team_ids)
        .unwrap();
    assert_eq!(order.len(), team_ids.len());

    let position: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    assert!(position["team_a"] < position["team_b"]);
    assert!(position["team_a"] < position["team_c"]);
    assert!(position["team_b"] < position["team_d"]);
    assert!(position["team_c"] < position["team_d"]);
    assert!(position["team_d"] < position["team_e"]);
}

#[test]
fn test_execution_order_is_deterministic() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_z", &["team_a"])]);
    let team_ids = ids(&["team_a", "team_m", "team_z", "team_b"]);

    let first = resolver
        .calculate_execution_order(&dependencies, &team_ids)
        .unwrap();
    for _ in 0..10 {
        let again = resolver
            .calculate_execution_order(&dependencies, &team_ids)
            .unwrap();
        assert_eq!(first, again);
    }
}

#[test]
fn test_execution_order_invalid_dependencies() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_b", &["team_x"])]);

    let err = resolver
        .calculate_execution_order(&dependencies, &ids(&["team_a", "team_b"]))
        .unwrap_err();
    match &err {
        DependencyError::InvalidDependencies(problems) => assert!(!problems.is_empty()),
        other => panic!("expected InvalidDependencies, got {:?}", other),
    }
    assert!(err.to_string().contains("Invalid dependencies"));
}

#[test]
fn test_execution_order_circular_dependencies() {
    let resolver = DependencyResolver::new();
    let dependencies = deps(&[("team_a", &["team_b"]), ("team_b", &["team_a"])]);

    let err = resolver
        .calculate_execution_order(&dependencies, &ids(&["team_a", "team_b"]))
        .unwrap_err();
    assert!(matches!(err, DependencyError::CircularDependencies(_)));
    assert!(err.to_string().contains("Circular dependencies detected"));
}
