//! Admission match semantics: selectors, resource rules and exclusions.

use std::collections::BTreeMap;

use celgate_protocol::{
    object_meta, AdmissionRequest, GroupVersionKind, GroupVersionResource, MatchResources,
    Namespace, NamedRuleWithOperations, Operation, RuleScope, UserInfo,
};
use serde_json::Value;

use crate::error::{MatchError, SelectorError};
use crate::selector::Selector;

/// The request attributes the matcher and evaluators read.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    pub sub_resource: String,
    pub name: String,
    pub namespace: String,
    pub operation: Operation,
    pub object: Option<Value>,
    pub old_object: Option<Value>,
    pub user_info: UserInfo,
    pub dry_run: bool,
}

impl Attributes {
    pub fn from_request(request: &AdmissionRequest) -> Self {
        Self {
            kind: request.kind.clone(),
            resource: request.resource.clone(),
            sub_resource: request.sub_resource.clone(),
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            operation: request.operation,
            object: request.object.clone().filter(|o| !o.is_null()),
            old_object: request.old_object.clone().filter(|o| !o.is_null()),
            user_info: request.user_info.clone(),
            dry_run: request.dry_run,
        }
    }

    /// True when the request targets a core `namespaces` resource.
    pub fn is_namespace(&self) -> bool {
        self.resource.group.is_empty() && self.resource.resource == "namespaces"
    }

    /// Labels of the new object, falling back to the old one.
    pub fn object_labels(&self) -> BTreeMap<String, String> {
        self.object
            .as_ref()
            .or(self.old_object.as_ref())
            .map(|o| object_meta(o).labels)
            .unwrap_or_default()
    }
}

/// A policy's match constraint with its selectors parsed up front.
///
/// Selector errors are kept rather than raised: the matcher only reports
/// them for requests that match structurally.
#[derive(Debug, Clone)]
pub struct MatchCriteria {
    constraints: MatchResources,
    namespace_selector: Result<Selector, SelectorError>,
    object_selector: Result<Selector, SelectorError>,
}

impl MatchCriteria {
    /// Absent constraints match every request.
    pub fn new(constraints: Option<&MatchResources>) -> Self {
        let constraints = constraints.cloned().unwrap_or_default();
        let namespace_selector = Selector::parse(constraints.namespace_selector.as_ref());
        let object_selector = Selector::parse(constraints.object_selector.as_ref());
        Self {
            constraints,
            namespace_selector,
            object_selector,
        }
    }

    pub fn constraints(&self) -> &MatchResources {
        &self.constraints
    }

    pub fn namespace_selector(&self) -> Result<&Selector, &SelectorError> {
        self.namespace_selector.as_ref()
    }

    pub fn object_selector(&self) -> Result<&Selector, &SelectorError> {
        self.object_selector.as_ref()
    }

    pub fn resource_rules(&self) -> &[NamedRuleWithOperations] {
        &self.constraints.resource_rules
    }

    pub fn exclude_resource_rules(&self) -> &[NamedRuleWithOperations] {
        &self.constraints.exclude_resource_rules
    }
}

/// Decides whether a request falls under a match constraint.
pub trait Matcher: Send + Sync {
    fn matches(
        &self,
        criteria: &MatchCriteria,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
    ) -> Result<bool, MatchError>;
}

/// Kubernetes admission match semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMatcher;

impl Matcher for DefaultMatcher {
    fn matches(
        &self,
        criteria: &MatchCriteria,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
    ) -> Result<bool, MatchError> {
        let mut deferred: Option<MatchError> = None;

        match matches_namespace_selector(criteria, attributes, namespace) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => deferred = Some(e),
        }

        match criteria.object_selector() {
            Ok(selector) => {
                if !selector.matches(&attributes.object_labels()) {
                    return Ok(false);
                }
            }
            Err(e) => {
                deferred.get_or_insert(MatchError::ObjectSelector(e.clone()));
            }
        }

        if criteria
            .exclude_resource_rules()
            .iter()
            .any(|rule| rule_matches(rule, attributes))
        {
            return Ok(false);
        }

        let rules = criteria.resource_rules();
        if !rules.is_empty() && !rules.iter().any(|rule| rule_matches(rule, attributes)) {
            return Ok(false);
        }

        match deferred {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}

fn matches_namespace_selector(
    criteria: &MatchCriteria,
    attributes: &Attributes,
    namespace: Option<&Namespace>,
) -> Result<bool, MatchError> {
    let selector = criteria
        .namespace_selector()
        .map_err(|e| MatchError::NamespaceSelector(e.clone()))?;
    if selector.is_everything() {
        return Ok(true);
    }
    if attributes.is_namespace() {
        return Ok(selector.matches(&attributes.object_labels()));
    }
    if attributes.namespace.is_empty() {
        // Cluster-scoped resources are not subject to namespace selection.
        return Ok(true);
    }
    match namespace {
        Some(ns) => Ok(selector.matches(&ns.metadata.labels)),
        None => Err(MatchError::NamespaceNotFound(attributes.namespace.clone())),
    }
}

/// Operation, group, version, resource, scope and name checks of one rule.
pub fn rule_matches(rule: &NamedRuleWithOperations, attributes: &Attributes) -> bool {
    operation_matches(&rule.operations, attributes.operation)
        && list_matches(&rule.api_groups, &attributes.resource.group)
        && list_matches(&rule.api_versions, &attributes.resource.version)
        && resource_matches(
            &rule.resources,
            &attributes.resource.resource,
            &attributes.sub_resource,
        )
        && scope_matches(rule.scope, attributes)
        && (rule.resource_names.is_empty() || rule.resource_names.contains(&attributes.name))
}

fn operation_matches(operations: &[String], operation: Operation) -> bool {
    operations
        .iter()
        .any(|op| op == "*" || op.eq_ignore_ascii_case(operation.as_str()))
}

fn list_matches(items: &[String], value: &str) -> bool {
    items.iter().any(|item| item == "*" || item == value)
}

fn resource_matches(resources: &[String], resource: &str, sub_resource: &str) -> bool {
    resources.iter().any(|entry| {
        let (res, sub) = entry.split_once('/').unwrap_or((entry.as_str(), ""));
        (res == "*" || res == resource) && (sub == "*" || sub == sub_resource)
    })
}

fn scope_matches(scope: Option<RuleScope>, attributes: &Attributes) -> bool {
    match scope.unwrap_or_default() {
        RuleScope::All => true,
        RuleScope::Cluster => attributes.namespace.is_empty(),
        RuleScope::Namespaced => !attributes.namespace.is_empty(),
    }
}
