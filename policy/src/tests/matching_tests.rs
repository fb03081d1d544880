//! Tests for admission match semantics.

use celgate_protocol::{
    GroupVersionResource, LabelSelector, MatchResources, Namespace, NamedRuleWithOperations,
    Operation, RuleScope,
};
use serde_json::json;

use super::{create, deployment, deployments, init, pod, pods};
use crate::error::MatchError;
use crate::matching::{Attributes, DefaultMatcher, MatchCriteria, Matcher};

fn rule(groups: &[&str], resources: &[&str], operations: &[&str]) -> NamedRuleWithOperations {
    NamedRuleWithOperations {
        operations: operations.iter().map(|s| s.to_string()).collect(),
        api_groups: groups.iter().map(|s| s.to_string()).collect(),
        api_versions: vec!["*".to_string()],
        resources: resources.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn selector(value: serde_json::Value) -> LabelSelector {
    serde_json::from_value(value).unwrap()
}

fn pod_attributes(namespace: &str) -> Attributes {
    Attributes::from_request(&create(pods(), pod(namespace, "web", json!([]))))
}

fn matches(resources: MatchResources, attributes: &Attributes, namespace: Option<&Namespace>) -> Result<bool, MatchError> {
    DefaultMatcher.matches(&MatchCriteria::new(Some(&resources)), attributes, namespace)
}

// =============================================================================
// Resource rules
// =============================================================================

#[test]
fn test_empty_rules_match_everything() {
    init();
    let attributes = pod_attributes("default");
    assert_eq!(matches(MatchResources::default(), &attributes, None), Ok(true));

    let cm = Attributes::from_request(&create(
        GroupVersionResource::new("", "v1", "configmaps"),
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}}),
    ));
    assert_eq!(matches(MatchResources::default(), &cm, None), Ok(true));
}

#[test]
fn test_absent_constraints_match_everything() {
    let criteria = MatchCriteria::new(None);
    assert_eq!(DefaultMatcher.matches(&criteria, &pod_attributes("default"), None), Ok(true));
}

#[test]
fn test_single_empty_rule_matches_nothing() {
    let resources = MatchResources {
        resource_rules: vec![NamedRuleWithOperations::default()],
        ..Default::default()
    };
    assert_eq!(matches(resources, &pod_attributes("default"), None), Ok(false));
}

#[test]
fn test_exclude_wins_over_include() {
    let resources = MatchResources {
        resource_rules: vec![rule(&[""], &["pods"], &["*"])],
        exclude_resource_rules: vec![rule(&[""], &["pods"], &["CREATE"])],
        ..Default::default()
    };
    assert_eq!(matches(resources, &pod_attributes("default"), None), Ok(false));
}

#[test]
fn test_rule_fields() {
    let attributes = pod_attributes("default");
    let hit = |r: NamedRuleWithOperations| {
        matches(
            MatchResources {
                resource_rules: vec![r],
                ..Default::default()
            },
            &attributes,
            None,
        )
        .unwrap()
    };

    assert!(hit(rule(&[""], &["pods"], &["CREATE"])));
    assert!(hit(rule(&["*"], &["*"], &["*"])));
    assert!(!hit(rule(&["apps"], &["pods"], &["CREATE"])));
    assert!(!hit(rule(&[""], &["pods"], &["UPDATE", "DELETE"])));
    assert!(!hit(rule(&[""], &["configmaps"], &["CREATE"])));

    let mut named = rule(&[""], &["pods"], &["CREATE"]);
    named.resource_names = vec!["other".to_string()];
    assert!(!hit(named));

    let mut cluster = rule(&[""], &["pods"], &["CREATE"]);
    cluster.scope = Some(RuleScope::Cluster);
    assert!(!hit(cluster));
}

#[test]
fn test_subresource_forms() {
    let mut attributes = pod_attributes("default");
    attributes.sub_resource = "status".to_string();
    let hit = |resource: &str| {
        matches(
            MatchResources {
                resource_rules: vec![rule(&[""], &[resource], &["*"])],
                ..Default::default()
            },
            &attributes,
            None,
        )
        .unwrap()
    };

    assert!(!hit("pods"));
    assert!(hit("pods/status"));
    assert!(hit("pods/*"));
    assert!(hit("*/status"));
    assert!(hit("*/*"));
    assert!(!hit("*"));
}

#[test]
fn test_operation_case_insensitive() {
    let attributes = pod_attributes("default");
    let resources = MatchResources {
        resource_rules: vec![rule(&[""], &["pods"], &["create"])],
        ..Default::default()
    };
    assert_eq!(attributes.operation, Operation::Create);
    assert_eq!(matches(resources, &attributes, None), Ok(true));
}

// =============================================================================
// Selectors
// =============================================================================

#[test]
fn test_object_selector() {
    let mut object = pod("default", "web", json!([]));
    object["metadata"]["labels"] = json!({"tier": "frontend"});
    let attributes = Attributes::from_request(&create(pods(), object));

    let frontend = MatchResources {
        object_selector: Some(selector(json!({"matchLabels": {"tier": "frontend"}}))),
        ..Default::default()
    };
    assert_eq!(matches(frontend, &attributes, None), Ok(true));

    let backend = MatchResources {
        object_selector: Some(selector(json!({"matchLabels": {"tier": "backend"}}))),
        ..Default::default()
    };
    assert_eq!(matches(backend, &attributes, None), Ok(false));
}

#[test]
fn test_namespace_selector_uses_resolved_namespace() {
    let attributes = pod_attributes("team-a");
    let resources = MatchResources {
        namespace_selector: Some(selector(json!({
            "matchExpressions": [{"key": "env", "operator": "In", "values": ["prod"]}],
        }))),
        ..Default::default()
    };
    let prod = Namespace::new("team-a", &[("env", "prod")]);
    let dev = Namespace::new("team-a", &[("env", "dev")]);
    assert_eq!(matches(resources.clone(), &attributes, Some(&prod)), Ok(true));
    assert_eq!(matches(resources.clone(), &attributes, Some(&dev)), Ok(false));
    assert_eq!(
        matches(resources, &attributes, None),
        Err(MatchError::NamespaceNotFound("team-a".to_string()))
    );
}

#[test]
fn test_namespace_selector_ignores_cluster_scoped_resources() {
    let node = Attributes::from_request(&create(
        GroupVersionResource::new("", "v1", "nodes"),
        json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "worker-1"}}),
    ));
    let resources = MatchResources {
        namespace_selector: Some(selector(json!({"matchLabels": {"env": "prod"}}))),
        ..Default::default()
    };
    assert_eq!(matches(resources, &node, None), Ok(true));
}

#[test]
fn test_namespace_selector_on_namespace_object() {
    let attributes = Attributes::from_request(&create(
        GroupVersionResource::new("", "v1", "namespaces"),
        json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team-a", "labels": {"env": "prod"}}}),
    ));
    let resources = MatchResources {
        namespace_selector: Some(selector(json!({"matchLabels": {"env": "prod"}}))),
        ..Default::default()
    };
    assert_eq!(matches(resources, &attributes, None), Ok(true));
}

#[test]
fn test_malformed_selector_is_deferred() {
    let malformed = selector(json!({
        "matchExpressions": [{"key": "env", "operator": "In", "values": []}],
    }));
    let resources = MatchResources {
        object_selector: Some(malformed),
        resource_rules: vec![rule(&["apps"], &["deployments"], &["CREATE"])],
        ..Default::default()
    };

    // A pod does not match the rules, so the broken selector never surfaces.
    assert_eq!(matches(resources.clone(), &pod_attributes("default"), None), Ok(false));

    let deploy = Attributes::from_request(&create(deployments(), deployment("default", "web", json!([]))));
    assert!(matches!(
        matches(resources, &deploy, None),
        Err(MatchError::ObjectSelector(_))
    ));
}

#[test]
fn test_malformed_namespace_selector_is_deferred() {
    let resources = MatchResources {
        namespace_selector: Some(selector(json!({"matchLabels": {"bad key!": "x"}}))),
        resource_rules: vec![rule(&[""], &["pods"], &["CREATE"])],
        ..Default::default()
    };
    assert!(matches!(
        matches(resources.clone(), &pod_attributes("default"), None),
        Err(MatchError::NamespaceSelector(_))
    ));

    let deploy = Attributes::from_request(&create(deployments(), deployment("default", "web", json!([]))));
    assert_eq!(matches(resources, &deploy, None), Ok(false));
}
