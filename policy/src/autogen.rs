//! Derived pod-controller rules for Pod-level validating policies.
//!
//! A policy whose resource rules all target core `pods` also covers the
//! controllers that embed a pod template. Derivation is a pure function of
//! the authored spec; the source policy is never modified.

use std::sync::OnceLock;

use celgate_protocol::{
    AuditAnnotation, EvaluationMode, MatchCondition, MatchResources, NamedRuleWithOperations,
    Validation, ValidatingPolicySpec, Variable,
};
use regex::Regex;

/// Variant covering controllers with `spec.template`.
pub const AUTOGEN: &str = "autogen";
/// Variant covering CronJobs (`spec.jobTemplate.spec.template`).
pub const AUTOGEN_CRONJOBS: &str = "autogen-cronjobs";

/// A pod-template-bearing controller resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controller {
    pub resource: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
}

pub const CONTROLLERS: &[Controller] = &[
    Controller { resource: "daemonsets", group: "apps", version: "v1", kind: "DaemonSet" },
    Controller { resource: "deployments", group: "apps", version: "v1", kind: "Deployment" },
    Controller { resource: "jobs", group: "batch", version: "v1", kind: "Job" },
    Controller { resource: "replicasets", group: "apps", version: "v1", kind: "ReplicaSet" },
    Controller { resource: "statefulsets", group: "apps", version: "v1", kind: "StatefulSet" },
    Controller { resource: "cronjobs", group: "batch", version: "v1", kind: "CronJob" },
];

pub fn default_controllers() -> Vec<String> {
    CONTROLLERS.iter().map(|c| c.resource.to_string()).collect()
}

pub fn lookup_controller(resource: &str) -> Option<&'static Controller> {
    CONTROLLERS.iter().find(|c| c.resource == resource)
}

/// An extra match-constraint variant derived from a Pod-level policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRule {
    /// [`AUTOGEN`] or [`AUTOGEN_CRONJOBS`].
    pub variant: &'static str,
    pub match_constraints: MatchResources,
    pub match_conditions: Vec<MatchCondition>,
    pub variables: Vec<Variable>,
    pub validations: Vec<Validation>,
    pub audit_annotations: Vec<AuditAnnotation>,
}

/// Derive controller rules for `spec`.
///
/// `default_controllers` applies unless the policy lists its own; an empty
/// list disables derivation.
pub fn compute_rules(spec: &ValidatingPolicySpec, default_controllers: &[String]) -> Vec<DerivedRule> {
    if spec.evaluation_mode() == EvaluationMode::Json || !targets_only_pods(spec) {
        return Vec::new();
    }
    let Some(constraints) = spec.match_constraints.as_ref() else {
        return Vec::new();
    };

    let controllers: Vec<&'static Controller> = spec
        .autogen
        .as_ref()
        .and_then(|a| a.pod_controllers.as_ref())
        .and_then(|p| p.controllers.as_deref())
        .unwrap_or(default_controllers)
        .iter()
        .filter_map(|name| lookup_controller(name))
        .collect();

    let (cronjobs, templated): (Vec<_>, Vec<_>) =
        controllers.into_iter().partition(|c| c.resource == "cronjobs");

    let mut rules = Vec::new();
    if !templated.is_empty() {
        rules.push(derive(spec, constraints, AUTOGEN, &templated, "spec.template"));
    }
    if !cronjobs.is_empty() {
        rules.push(derive(
            spec,
            constraints,
            AUTOGEN_CRONJOBS,
            &cronjobs,
            "spec.jobTemplate.spec.template",
        ));
    }
    rules
}

fn targets_only_pods(spec: &ValidatingPolicySpec) -> bool {
    let Some(constraints) = spec.match_constraints.as_ref() else {
        return false;
    };
    !constraints.resource_rules.is_empty()
        && constraints.resource_rules.iter().all(|rule| {
            rule.api_groups.iter().all(|g| g.is_empty())
                && !rule.resources.is_empty()
                && rule.resources.iter().all(|r| r == "pods")
        })
}

fn derive(
    spec: &ValidatingPolicySpec,
    constraints: &MatchResources,
    variant: &'static str,
    controllers: &[&'static Controller],
    template_path: &str,
) -> DerivedRule {
    let mut operations: Vec<String> = Vec::new();
    for op in constraints.resource_rules.iter().flat_map(|r| r.operations.iter()) {
        if !operations.contains(op) {
            operations.push(op.clone());
        }
    }

    // One rule per API group, controllers in configured order.
    let mut resource_rules: Vec<NamedRuleWithOperations> = Vec::new();
    for controller in controllers {
        match resource_rules
            .iter()
            .position(|r| r.api_groups.first().map(String::as_str) == Some(controller.group))
        {
            Some(i) => resource_rules[i].resources.push(controller.resource.to_string()),
            None => resource_rules.push(NamedRuleWithOperations {
                operations: operations.clone(),
                api_groups: vec![controller.group.to_string()],
                api_versions: vec![controller.version.to_string()],
                resources: vec![controller.resource.to_string()],
                ..Default::default()
            }),
        }
    }

    let rewrite = |expression: &str| rewrite_expression(expression, template_path);

    DerivedRule {
        variant,
        match_constraints: MatchResources {
            namespace_selector: constraints.namespace_selector.clone(),
            object_selector: constraints.object_selector.clone(),
            resource_rules,
            exclude_resource_rules: constraints.exclude_resource_rules.clone(),
        },
        match_conditions: spec
            .match_conditions
            .iter()
            .map(|c| MatchCondition {
                name: format!("{}-{}", variant, c.name),
                expression: rewrite(&c.expression),
            })
            .collect(),
        variables: spec
            .variables
            .iter()
            .map(|v| Variable {
                name: v.name.clone(),
                expression: rewrite(&v.expression),
            })
            .collect(),
        validations: spec
            .validations
            .iter()
            .map(|v| Validation {
                expression: rewrite(&v.expression),
                message_expression: rewrite(&v.message_expression),
                ..v.clone()
            })
            .collect(),
        audit_annotations: spec
            .audit_annotations
            .iter()
            .map(|a| AuditAnnotation {
                key: a.key.clone(),
                value_expression: rewrite(&a.value_expression),
            })
            .collect(),
    }
}

fn object_path_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(object|oldObject)\.(spec|metadata)\b").ok())
        .as_ref()
}

/// Point `object.spec`/`object.metadata` (and the `oldObject` forms) at the
/// embedded pod template.
pub fn rewrite_expression(expression: &str, template_path: &str) -> String {
    let Some(re) = object_path_regex() else {
        return expression.to_string();
    };
    re.replace_all(expression, |caps: &regex::Captures<'_>| {
        format!("{}.{}.{}", &caps[1], template_path, &caps[2])
    })
    .into_owned()
}
