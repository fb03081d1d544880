//! CEL policy documents: match constraints, the four policy kinds and exceptions.

use serde::{Deserialize, Serialize};

use crate::meta::{LabelSelector, ObjectMeta};

pub const KIND_VALIDATING_POLICY: &str = "ValidatingPolicy";
pub const KIND_MUTATING_POLICY: &str = "MutatingPolicy";
pub const KIND_GENERATING_POLICY: &str = "GeneratingPolicy";
pub const KIND_IMAGE_VALIDATING_POLICY: &str = "ImageValidatingPolicy";
pub const KIND_POLICY_EXCEPTION: &str = "PolicyException";

// =============================================================================
// MATCHING
// =============================================================================

/// Whether a rule applies to cluster-scoped resources, namespaced ones, or both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleScope {
    Cluster,
    Namespaced,
    #[default]
    #[serde(rename = "*")]
    All,
}

/// A resource rule, optionally narrowed to specific object names.
///
/// Every list supports `*`. Resources additionally support the
/// `resource/subresource` forms `*/*`, `pods/*` and `*/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamedRuleWithOperations {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
    pub operations: Vec<String>,
    pub api_groups: Vec<String>,
    pub api_versions: Vec<String>,
    pub resources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<RuleScope>,
}

/// The resource-match constraint of a policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,
    pub resource_rules: Vec<NamedRuleWithOperations>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_resource_rules: Vec<NamedRuleWithOperations>,
}

/// A named boolean expression gating a policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchCondition {
    pub name: String,
    pub expression: String,
}

/// A named expression whose result is exposed under `variables.<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Variable {
    pub name: String,
    pub expression: String,
}

/// A boolean assertion with its failure message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Validation {
    pub expression: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_expression: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// A key whose value is computed when a validation fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditAnnotation {
    pub key: String,
    pub value_expression: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}

/// How a failing validation affects the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationAction {
    Deny,
    Warn,
    Audit,
}

/// Whether a policy reviews admission requests or bare JSON payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationMode {
    #[default]
    Kubernetes,
    #[serde(rename = "JSON")]
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Toggle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl Toggle {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluationConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<EvaluationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutate_existing: Option<Toggle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_existing: Option<Toggle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronize: Option<Toggle>,
}

/// Pod-controller autogen settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodControllersConfiguration {
    /// Controller resources to derive rules for. `None` means the engine default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controllers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutogenConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_controllers: Option<PodControllersConfiguration>,
}

// =============================================================================
// POLICY KINDS
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatingPolicySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_constraints: Option<MatchResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_actions: Vec<ValidationAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    pub validations: Vec<Validation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audit_annotations: Vec<AuditAnnotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autogen: Option<AutogenConfiguration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchType {
    #[serde(rename = "JSONPatch")]
    JsonPatch,
    #[default]
    ApplyConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpressionSource {
    pub expression: String,
}

/// One mutation: either a JSON patch expression or an apply configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mutation {
    pub patch_type: PatchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_patch: Option<ExpressionSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_configuration: Option<ExpressionSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MutatingPolicySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_constraints: Option<MatchResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    pub mutations: Vec<Mutation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratingPolicySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_constraints: Option<MatchResources>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    pub generate: Vec<ExpressionSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationConfiguration>,
}

/// Selects the images a verification policy applies to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchImageReference {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub glob: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub expression: String,
}

/// A named expression returning the list of image references to verify.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageExtractor {
    pub name: String,
    pub expression: String,
}

/// A trusted signer. The verifier configuration is opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attestor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cosign: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notary: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttestationType {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attestation {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intoto: Option<AttestationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<AttestationType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageValidatingPolicySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_constraints: Option<MatchResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_actions: Vec<ValidationAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    pub match_image_references: Vec<MatchImageReference>,
    #[serde(rename = "images", skip_serializing_if = "Vec::is_empty")]
    pub image_extractors: Vec<ImageExtractor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attestors: Vec<Attestor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attestations: Vec<Attestation>,
    pub validations: Vec<Validation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audit_annotations: Vec<AuditAnnotation>,
}

/// A typed policy document: `apiVersion`, `kind`, `metadata`, `spec`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument<S> {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: S,
}

impl<S> PolicyDocument<S> {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

pub type ValidatingPolicy = PolicyDocument<ValidatingPolicySpec>;
pub type MutatingPolicy = PolicyDocument<MutatingPolicySpec>;
pub type GeneratingPolicy = PolicyDocument<GeneratingPolicySpec>;
pub type ImageValidatingPolicy = PolicyDocument<ImageValidatingPolicySpec>;

/// Accessors shared by every policy spec.
pub trait PolicySpec {
    /// The document kind this spec belongs to.
    const KIND: &'static str;

    fn match_constraints(&self) -> Option<&MatchResources>;
    fn match_conditions(&self) -> &[MatchCondition];
    fn variables(&self) -> &[Variable];

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Fail
    }

    fn validation_actions(&self) -> Vec<ValidationAction> {
        vec![ValidationAction::Deny]
    }
}

fn actions_or_deny(actions: &[ValidationAction]) -> Vec<ValidationAction> {
    if actions.is_empty() {
        vec![ValidationAction::Deny]
    } else {
        actions.to_vec()
    }
}

impl PolicySpec for ValidatingPolicySpec {
    const KIND: &'static str = KIND_VALIDATING_POLICY;

    fn match_constraints(&self) -> Option<&MatchResources> {
        self.match_constraints.as_ref()
    }
    fn match_conditions(&self) -> &[MatchCondition] {
        &self.match_conditions
    }
    fn variables(&self) -> &[Variable] {
        &self.variables
    }
    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy.unwrap_or_default()
    }
    fn validation_actions(&self) -> Vec<ValidationAction> {
        actions_or_deny(&self.validation_actions)
    }
}

impl ValidatingPolicySpec {
    pub fn evaluation_mode(&self) -> EvaluationMode {
        self.evaluation
            .as_ref()
            .and_then(|e| e.mode)
            .unwrap_or_default()
    }
}

impl PolicySpec for MutatingPolicySpec {
    const KIND: &'static str = KIND_MUTATING_POLICY;

    fn match_constraints(&self) -> Option<&MatchResources> {
        self.match_constraints.as_ref()
    }
    fn match_conditions(&self) -> &[MatchCondition] {
        &self.match_conditions
    }
    fn variables(&self) -> &[Variable] {
        &self.variables
    }
    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy.unwrap_or_default()
    }
}

impl MutatingPolicySpec {
    pub fn mutate_existing(&self) -> bool {
        self.evaluation
            .as_ref()
            .and_then(|e| e.mutate_existing.as_ref())
            .is_some_and(Toggle::is_enabled)
    }
}

impl PolicySpec for GeneratingPolicySpec {
    const KIND: &'static str = KIND_GENERATING_POLICY;

    fn match_constraints(&self) -> Option<&MatchResources> {
        self.match_constraints.as_ref()
    }
    fn match_conditions(&self) -> &[MatchCondition] {
        &self.match_conditions
    }
    fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

impl GeneratingPolicySpec {
    pub fn synchronize(&self) -> bool {
        self.evaluation
            .as_ref()
            .and_then(|e| e.synchronize.as_ref())
            .is_some_and(Toggle::is_enabled)
    }
}

impl PolicySpec for ImageValidatingPolicySpec {
    const KIND: &'static str = KIND_IMAGE_VALIDATING_POLICY;

    fn match_constraints(&self) -> Option<&MatchResources> {
        self.match_constraints.as_ref()
    }
    fn match_conditions(&self) -> &[MatchCondition] {
        &self.match_conditions
    }
    fn variables(&self) -> &[Variable] {
        &self.variables
    }
    fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy.unwrap_or_default()
    }
    fn validation_actions(&self) -> Vec<ValidationAction> {
        actions_or_deny(&self.validation_actions)
    }
}

// =============================================================================
// EXCEPTIONS
// =============================================================================

/// Identifies the policy an exception applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyRef {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyExceptionSpec {
    pub policy_refs: Vec<PolicyRef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,
}

pub type PolicyException = PolicyDocument<PolicyExceptionSpec>;

impl PolicyException {
    /// True if this exception names the policy `name` of kind `kind`.
    pub fn applies_to(&self, name: &str, kind: &str) -> bool {
        self.spec
            .policy_refs
            .iter()
            .any(|r| r.name == name && r.kind == kind)
    }
}
