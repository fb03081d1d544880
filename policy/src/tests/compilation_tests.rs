//! Tests for policy compilation and compile-time diagnostics.

use celgate_protocol::FailurePolicy;

use super::{documents, init};
use crate::compiled::{CompiledMutation, ImageMatcher};
use crate::compiler::{
    Compiler, CompilerOptions, GeneratingCompiler, ImageCompiler, MutatingCompiler,
    ValidatingCompiler,
};
use crate::error::{CompileErrors, FieldErrorKind};

fn validating_errors(yaml: &str) -> CompileErrors {
    let set = documents(yaml);
    ValidatingCompiler::default()
        .compile(&set.validating[0], &set.exceptions)
        .unwrap_err()
}

fn paths(errors: &CompileErrors) -> Vec<&str> {
    errors.iter().map(|e| e.path.as_str()).collect()
}

// =============================================================================
// Validating
// =============================================================================

#[test]
fn test_compile_validating() {
    init();
    let set = documents(
        r#"
apiVersion: policies.celgate.io/v1
kind: ValidatingPolicy
metadata:
  name: check-labels
spec:
  matchConstraints:
    resourceRules:
      - apiGroups: [""]
        apiVersions: [v1]
        operations: [CREATE, UPDATE]
        resources: [configmaps]
  matchConditions:
    - name: not-system
      expression: "object.metadata.namespace != 'kube-system'"
  variables:
    - name: labels
      expression: "has(object.metadata.labels) ? object.metadata.labels : {}"
  validations:
    - expression: "'team' in variables.labels"
      messageExpression: "'missing team on ' + object.metadata.name"
      reason: Invalid
  auditAnnotations:
    - key: owner
      valueExpression: "'unknown'"
"#,
    );
    let compiled = ValidatingCompiler::default()
        .compile(&set.validating[0], &[])
        .unwrap();

    assert_eq!(compiled.name(), "check-labels");
    assert_eq!(compiled.kind(), "ValidatingPolicy");
    assert_eq!(compiled.failure_policy(), FailurePolicy::Fail);
    assert_eq!(compiled.programs.match_conditions.len(), 1);
    assert_eq!(compiled.programs.variables.len(), 1);
    assert_eq!(compiled.body.validations.len(), 1);
    assert!(compiled.body.validations[0].message_expression.is_some());
    assert_eq!(compiled.body.validations[0].reason, "Invalid");
    assert_eq!(compiled.body.audit_annotations[0].key, "owner");
    // Not a pod policy: nothing derived.
    assert!(compiled.body.autogen.is_empty());
}

#[test]
fn test_syntax_error_reports_path() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata:
  name: broken
spec:
  validations:
    - expression: "object.spec.replicas >"
"#,
    );
    assert_eq!(paths(&errors), vec!["spec.validations[0].expression"]);
    assert_eq!(errors.0[0].kind, FieldErrorKind::Invalid);
    assert!(errors.to_string().contains("compilation failed"));
}

#[test]
fn test_undeclared_references_rejected() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata:
  name: typos
spec:
  validations:
    - expression: "obejct.spec.replicas > 1"
    - expression: "noSuchFunction(object)"
    - expression: "generate('', [])"
    - expression: "object.spec.containers.all(c, c.image == image)"
"#,
    );
    assert_eq!(
        paths(&errors),
        vec![
            "spec.validations[0].expression",
            "spec.validations[1].expression",
            "spec.validations[2].expression",
            "spec.validations[3].expression",
        ]
    );
    assert!(errors.0[0].detail.contains("undeclared reference to \"obejct\""));
    assert!(errors.0[1].detail.contains("function \"noSuchFunction\""));
    assert!(errors.0[2].detail.contains("function \"generate\""));
    assert!(errors.0[3].detail.contains("undeclared reference to \"image\""));
}

#[test]
fn test_quoted_variables_are_literals() {
    let set = documents(
        r#"
kind: ValidatingPolicy
metadata:
  name: literal
spec:
  validations:
    - expression: "object.metadata.name != 'variables.x'"
"#,
    );
    let compiled = ValidatingCompiler::default()
        .compile(&set.validating[0], &[])
        .unwrap();
    assert!(compiled.body.validations[0].expression.variable_refs().is_empty());
}

#[test]
fn test_all_errors_reported() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata:
  name: broken
spec:
  matchConditions:
    - name: ""
      expression: "true"
  validations:
    - expression: ""
    - expression: "(("
"#,
    );
    assert_eq!(
        paths(&errors),
        vec![
            "spec.matchConditions[0].name",
            "spec.validations[0].expression",
            "spec.validations[1].expression",
        ]
    );
}

#[test]
fn test_requires_name_and_body() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata: {}
spec: {}
"#,
    );
    assert_eq!(paths(&errors), vec!["metadata.name", "spec.validations"]);
    assert!(errors.iter().all(|e| e.kind == FieldErrorKind::Required));
}

#[test]
fn test_duplicate_names() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata:
  name: dupes
spec:
  matchConditions:
    - name: a
      expression: "true"
    - name: a
      expression: "true"
  variables:
    - name: v
      expression: "1"
    - name: v
      expression: "2"
  validations:
    - expression: "true"
"#,
    );
    let details: Vec<&str> = errors.iter().map(|e| e.detail.as_str()).collect();
    assert!(details.contains(&"duplicate match condition name"));
    assert!(details.contains(&"duplicate variable name"));
}

#[test]
fn test_variable_ordering() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata:
  name: ordering
spec:
  variables:
    - name: first
      expression: "variables.second + 1"
    - name: second
      expression: "1"
  validations:
    - expression: "variables.third == 1"
"#,
    );
    assert_eq!(errors.len(), 2);
    assert!(errors.0[0].detail.contains("referenced before its declaration"));
    assert_eq!(errors.0[0].path, "spec.variables[0].expression");
    assert!(errors.0[1].detail.contains("undeclared variable \"third\""));
}

#[test]
fn test_json_mode_rejects_admission_variables() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata:
  name: payload
spec:
  evaluation:
    mode: JSON
  validations:
    - expression: "request.operation == 'CREATE'"
    - expression: "object.kind == 'request'"
"#,
    );
    assert_eq!(paths(&errors), vec!["spec.validations[0].expression"]);
    assert!(errors.0[0].detail.contains("\"request\""));
}

#[test]
fn test_forced_failure_policy() {
    let set = documents(
        r#"
kind: ValidatingPolicy
metadata:
  name: forced
spec:
  failurePolicy: Fail
  validations:
    - expression: "true"
"#,
    );
    let compiler = ValidatingCompiler::new(CompilerOptions {
        force_failure_policy_ignore: true,
        ..Default::default()
    });
    let compiled = compiler.compile(&set.validating[0], &[]).unwrap();
    assert_eq!(compiled.failure_policy(), FailurePolicy::Ignore);
}

#[test]
fn test_exception_conditions_compiled_for_referenced_policy_only() {
    let set = documents(
        r#"
kind: ValidatingPolicy
metadata:
  name: target
spec:
  validations:
    - expression: "true"
---
kind: PolicyException
metadata:
  name: applies
  namespace: security
spec:
  policyRefs:
    - name: target
      kind: ValidatingPolicy
  matchConditions:
    - name: system
      expression: "object.metadata.namespace == 'kube-system'"
---
kind: PolicyException
metadata:
  name: wrong-kind
spec:
  policyRefs:
    - name: target
      kind: MutatingPolicy
"#,
    );
    let compiled = ValidatingCompiler::default()
        .compile(&set.validating[0], &set.exceptions)
        .unwrap();
    assert_eq!(compiled.exceptions.len(), 1);
    assert_eq!(compiled.exceptions[0].exception.name(), "applies");
    assert_eq!(compiled.exceptions[0].conditions.len(), 1);
}

#[test]
fn test_exception_errors_carry_exception_path() {
    let errors = validating_errors(
        r#"
kind: ValidatingPolicy
metadata:
  name: target
spec:
  validations:
    - expression: "true"
---
kind: PolicyException
metadata:
  name: broken
spec:
  policyRefs:
    - name: target
      kind: ValidatingPolicy
  matchConditions:
    - name: bad
      expression: "))"
"#,
    );
    assert_eq!(errors.len(), 1);
    assert!(errors.0[0].path.starts_with("exceptions[broken].spec.matchConditions"));
}

// =============================================================================
// Other kinds
// =============================================================================

#[test]
fn test_compile_mutating() {
    let set = documents(
        r#"
kind: MutatingPolicy
metadata:
  name: add-labels
spec:
  evaluation:
    mutateExisting:
      enabled: true
  mutations:
    - patchType: JSONPatch
      jsonPatch:
        expression: "[{'op': 'add', 'path': '/metadata/labels', 'value': {'managed': 'true'}}]"
    - patchType: ApplyConfiguration
      applyConfiguration:
        expression: "{'metadata': {'annotations': {'seen': 'yes'}}}"
"#,
    );
    let compiled = MutatingCompiler::default().compile(&set.mutating[0], &[]).unwrap();
    assert!(compiled.body.mutate_existing);
    assert!(matches!(compiled.body.mutations[0], CompiledMutation::JsonPatch(_)));
    assert!(matches!(compiled.body.mutations[1], CompiledMutation::ApplyConfiguration(_)));
}

#[test]
fn test_mutation_requires_expression_for_patch_type() {
    let set = documents(
        r#"
kind: MutatingPolicy
metadata:
  name: mismatched
spec:
  mutations:
    - patchType: JSONPatch
      applyConfiguration:
        expression: "{}"
"#,
    );
    let errors = MutatingCompiler::default()
        .compile(&set.mutating[0], &[])
        .unwrap_err();
    assert_eq!(paths(&errors), vec!["spec.mutations[0].jsonPatch"]);
}

#[test]
fn test_compile_generating() {
    let set = documents(
        r#"
kind: GeneratingPolicy
metadata:
  name: gen
spec:
  generate: []
"#,
    );
    let errors = GeneratingCompiler::default()
        .compile(&set.generating[0], &[])
        .unwrap_err();
    assert_eq!(paths(&errors), vec!["spec.generate"]);
}

#[test]
fn test_compile_image_policy() {
    let set = documents(
        r#"
kind: ImageValidatingPolicy
metadata:
  name: signed
spec:
  matchImageReferences:
    - glob: "ghcr.io/acme/*"
    - expression: "ref.startsWith('docker.io/')"
  images:
    - name: sidecars
      expression: "[]"
  attestors:
    - name: notary
      notary:
        certs: "-----BEGIN CERTIFICATE-----"
  validations:
    - expression: "verifyImageSignatures(image, [attestors.notary]) > 0"
"#,
    );
    let compiled = ImageCompiler::default().compile(&set.image[0], &[]).unwrap();
    assert!(matches!(compiled.body.image_matchers[0], ImageMatcher::Glob(_)));
    assert!(matches!(compiled.body.image_matchers[1], ImageMatcher::Expression(_)));
    assert_eq!(compiled.body.extractors[0].name, "sidecars");
    assert_eq!(compiled.body.attestors["notary"]["name"], "notary");
}

#[test]
fn test_image_reference_needs_exactly_one_form() {
    let set = documents(
        r#"
kind: ImageValidatingPolicy
metadata:
  name: signed
spec:
  matchImageReferences:
    - glob: "ghcr.io/*"
      expression: "true"
    - {}
  attestors:
    - name: a
    - name: a
  validations:
    - expression: "true"
"#,
    );
    let errors = ImageCompiler::default().compile(&set.image[0], &[]).unwrap_err();
    assert_eq!(
        paths(&errors),
        vec![
            "spec.matchImageReferences[0]",
            "spec.matchImageReferences[1]",
            "spec.attestors[1].name",
        ]
    );
}
