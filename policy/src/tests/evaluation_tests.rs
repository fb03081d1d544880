//! Tests for compiled policy evaluation.

use std::sync::{Arc, Mutex};

use celgate_protocol::GroupVersionKind;
use serde_json::json;

use super::{create, documents, init, libraries, pod, pods};
use crate::cel::libs::{GenerateContext, Libraries};
use crate::cel::{Bindings, Cancellation, CelExpression, Scope};
use crate::compiled::{CompiledValidatingPolicy, Evaluation, ValidationOutcome};
use crate::compiler::{Compiler, ImageCompiler, MutatingCompiler, ValidatingCompiler};
use crate::config::GenerationLabels;
use crate::error::{EvalError, EvalResult};
use crate::fake::FakeContext;
use crate::matching::Attributes;
use crate::typeconv::TypeConverter;

fn compile(yaml: &str) -> CompiledValidatingPolicy {
    let set = documents(yaml);
    ValidatingCompiler::default()
        .compile(&set.validating[0], &set.exceptions)
        .unwrap()
}

fn attributes(namespace: &str) -> Attributes {
    Attributes::from_request(&create(
        pods(),
        pod(namespace, "web", json!([{"name": "app", "image": "nginx"}])),
    ))
}

fn evaluate(policy: &CompiledValidatingPolicy, context: &Arc<FakeContext>) -> EvalResult<Evaluation<ValidationOutcome>> {
    policy.evaluate(&attributes("default"), None, None, &libraries(context))
}

fn failure(evaluation: EvalResult<Evaluation<ValidationOutcome>>) -> ValidationOutcome {
    match evaluation {
        Ok(Evaluation::Evaluated(outcome)) if !outcome.allowed => outcome,
        other => panic!("expected a failed validation, got {:?}", other),
    }
}

const LOOKUP_POLICY: &str = r#"
kind: ValidatingPolicy
metadata:
  name: lookup
spec:
  matchConditions:
    - name: gate
      expression: "object.metadata.namespace == 'guarded'"
  validations:
    - expression: "getResource('v1', 'configmaps', 'default', 'missing').data.key == 'x'"
"#;

// =============================================================================
// Match conditions
// =============================================================================

#[test]
fn test_false_condition_skips_body() {
    init();
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(LOOKUP_POLICY);

    let result = evaluate(&policy, &ctx).unwrap();
    assert_eq!(result, Evaluation::NotMatched);
    assert_eq!(ctx.calls("getResource"), 0);

    // The same body errors once the gate opens.
    let result = policy.evaluate(&attributes("guarded"), None, None, &libraries(&ctx));
    assert!(matches!(result, Err(EvalError::Execution { .. })));
    assert_eq!(ctx.calls("getResource"), 1);
}

#[test]
fn test_false_condition_beats_errored_condition() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: mixed
spec:
  matchConditions:
    - name: broken
      expression: "object.metadata.missing == 'x'"
    - name: never
      expression: "false"
  validations:
    - expression: "false"
"#,
    );
    assert_eq!(evaluate(&policy, &ctx).unwrap(), Evaluation::NotMatched);
}

#[test]
fn test_condition_error_follows_failure_policy() {
    let ctx = Arc::new(FakeContext::new());
    let yaml = |failure_policy: &str| {
        format!(
            r#"
kind: ValidatingPolicy
metadata:
  name: erroring
spec:
  failurePolicy: {}
  matchConditions:
    - name: broken
      expression: "object.metadata.missing == 'x'"
  validations:
    - expression: "false"
"#,
            failure_policy
        )
    };

    let fail = compile(&yaml("Fail"));
    match evaluate(&fail, &ctx) {
        Err(EvalError::MatchCondition { name, .. }) => assert_eq!(name, "broken"),
        other => panic!("expected match condition error, got {:?}", other),
    }

    let ignore = compile(&yaml("Ignore"));
    assert_eq!(evaluate(&ignore, &ctx).unwrap(), Evaluation::NotMatched);
}

// =============================================================================
// Exceptions
// =============================================================================

const EXCEPTED_POLICY: &str = r#"
kind: ValidatingPolicy
metadata:
  name: deny-all
spec:
  validations:
    - expression: "false"
      message: denied
---
kind: PolicyException
metadata:
  name: web-pods
  namespace: platform
spec:
  policyRefs:
    - name: deny-all
      kind: ValidatingPolicy
  matchConditions:
    - name: is-web
      expression: "object.metadata.name == 'web'"
    - name: in-default
      expression: "object.metadata.namespace == 'default'"
"#;

#[test]
fn test_exception_skips_policy() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(EXCEPTED_POLICY);
    match evaluate(&policy, &ctx).unwrap() {
        Evaluation::Excepted(exceptions) => {
            assert_eq!(exceptions.len(), 1);
            assert_eq!(exceptions[0].metadata.key(), "platform/web-pods");
        }
        other => panic!("expected exception, got {:?}", other),
    }

    // One false condition and the exception does not apply.
    let other_ns = policy.evaluate(&attributes("prod"), None, None, &libraries(&ctx));
    assert_eq!(failure(other_ns).message, "denied");
}

#[test]
fn test_exception_condition_error_is_fatal() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: target
spec:
  failurePolicy: Ignore
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
      expression: "object.nope.deeper == 1"
"#,
    );
    assert!(matches!(
        evaluate(&policy, &ctx),
        Err(EvalError::ExceptionCondition { .. })
    ));
}

// =============================================================================
// Variables
// =============================================================================

#[test]
fn test_variable_runs_once() {
    let ctx = Arc::new(
        FakeContext::new().with_resource(
            "v1",
            "configmaps",
            json!({"kind": "ConfigMap", "metadata": {"name": "settings", "namespace": "default"}}),
        ),
    );
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: memo
spec:
  variables:
    - name: cms
      expression: "listResources('v1', 'configmaps', 'default')"
  validations:
    - expression: "variables.cms.kind == 'List'"
    - expression: "size(variables.cms.items) == 1"
"#,
    );

    let result = evaluate(&policy, &ctx).unwrap();
    assert!(result.evaluated().unwrap().allowed);
    assert_eq!(ctx.calls("listResources"), 1);
}

#[test]
fn test_unused_variable_never_runs() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: lazy
spec:
  variables:
    - name: expensive
      expression: "listResources('v1', 'secrets', '')"
  validations:
    - expression: "object.kind == 'Pod'"
"#,
    );
    assert!(evaluate(&policy, &ctx).unwrap().evaluated().unwrap().allowed);
    assert_eq!(ctx.calls("listResources"), 0);
}

#[test]
fn test_short_circuit_skips_variable() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: short-circuit
spec:
  variables:
    - name: cms
      expression: "listResources('v1', 'configmaps', 'default')"
    - name: absent
      expression: "getResource('v1', 'configmaps', 'default', 'absent')"
  validations:
    - expression: "true || size(variables.cms.items) > 0"
    - expression: "object.kind == 'Pod' ? true : variables.absent.data.mode == 'strict'"
"#,
    );
    assert!(evaluate(&policy, &ctx).unwrap().evaluated().unwrap().allowed);
    assert_eq!(ctx.calls("listResources"), 0);
    assert_eq!(ctx.calls("getResource"), 0);
}

#[test]
fn test_variable_error_surfaces() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: failing-variable
spec:
  variables:
    - name: cm
      expression: "getResource('v1', 'configmaps', 'default', 'absent')"
  validations:
    - expression: "variables.cm.data.mode == 'strict'"
"#,
    );
    match evaluate(&policy, &ctx) {
        Err(EvalError::Variable { name, .. }) => assert_eq!(name, "cm"),
        other => panic!("expected variable error, got {:?}", other),
    }
}

#[test]
fn test_variables_chain() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: chain
spec:
  variables:
    - name: containers
      expression: "object.spec.containers"
    - name: count
      expression: "size(variables.containers)"
  validations:
    - expression: "variables.count == 2"
      messageExpression: "'expected 2 containers, found ' + string(variables.count)"
"#,
    );
    assert_eq!(failure(evaluate(&policy, &ctx)).message, "expected 2 containers, found 1");
}

// =============================================================================
// Messages and audit annotations
// =============================================================================

#[test]
fn test_message_fallbacks() {
    let ctx = Arc::new(FakeContext::new());
    let with = |validation: &str| {
        let policy = compile(&format!(
            "kind: ValidatingPolicy\nmetadata:\n  name: msg\nspec:\n  validations:\n    - {}\n",
            validation
        ));
        failure(evaluate(&policy, &ctx)).message
    };

    assert_eq!(
        with(r#"{expression: "false", message: static, messageExpression: "'dynamic'"}"#),
        "dynamic"
    );
    assert_eq!(
        with(r#"{expression: "false", message: static, messageExpression: "'  '"}"#),
        "static"
    );
    assert_eq!(with(r#"{expression: "1 > 2"}"#), "failed expression: 1 > 2");
    assert!(with(r#"{expression: "false", message: static, messageExpression: "object.nope.x"}"#)
        .starts_with("failed to evaluate message expression:"));
}

#[test]
fn test_first_failing_validation_wins() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: ordered
spec:
  validations:
    - expression: "true"
    - expression: "false"
      message: second
      reason: Forbidden
    - expression: "false"
      message: third
  auditAnnotations:
    - key: pod
      valueExpression: "object.metadata.namespace + '/' + object.metadata.name"
    - key: empty
      valueExpression: "''"
"#,
    );
    let outcome = failure(evaluate(&policy, &ctx));
    assert_eq!(outcome.message, "second");
    assert_eq!(outcome.reason, "Forbidden");
    assert_eq!(outcome.audit_annotations.get("pod").map(String::as_str), Some("default/web"));
    assert!(!outcome.audit_annotations.contains_key("empty"));
}

#[test]
fn test_non_bool_validation_is_error() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: typed
spec:
  validations:
    - expression: "object.metadata.name"
"#,
    );
    assert!(matches!(
        evaluate(&policy, &ctx),
        Err(EvalError::UnexpectedType { expected: "bool", .. })
    ));
}

#[test]
fn test_json_payload() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: payload
spec:
  evaluation:
    mode: JSON
  validations:
    - expression: "object.replicas <= 3"
      message: too many replicas
"#,
    );
    let ok = policy.evaluate_json(&json!({"replicas": 2}), &libraries(&ctx)).unwrap();
    assert!(ok.evaluated().unwrap().allowed);
    let denied = policy.evaluate_json(&json!({"replicas": 5}), &libraries(&ctx));
    assert_eq!(failure(denied).message, "too many replicas");
}

#[test]
fn test_cancelled_evaluation() {
    let ctx = Arc::new(FakeContext::new());
    let policy = compile(
        r#"
kind: ValidatingPolicy
metadata:
  name: slow
spec:
  validations:
    - expression: "true"
"#,
    );
    let cancellation = Cancellation::new();
    cancellation.cancel();
    let libraries = Libraries::new(ctx, cancellation);
    assert_eq!(
        policy.evaluate(&attributes("default"), None, None, &libraries),
        Err(EvalError::Cancelled)
    );
}

// =============================================================================
// Mutation and image verification
// =============================================================================

#[test]
fn test_mutations_chain() {
    let ctx = Arc::new(FakeContext::new());
    let set = documents(
        r#"
kind: MutatingPolicy
metadata:
  name: defaults
spec:
  mutations:
    - patchType: JSONPatch
      jsonPatch:
        expression: "[{'op': 'add', 'path': '/metadata/labels', 'value': {'managed': 'true'}}]"
    - patchType: ApplyConfiguration
      applyConfiguration:
        expression: >-
          {'metadata': {'labels': {'seen': object.metadata.labels.managed}},
           'spec': {'containers': [{'name': 'app', 'imagePullPolicy': 'Always'}]}}
"#,
    );
    let policy = MutatingCompiler::default().compile(&set.mutating[0], &[]).unwrap();
    let converter = TypeConverter::for_kind(&GroupVersionKind::new("", "v1", "Pod"));

    let patched = policy
        .evaluate(&attributes("default"), None, &converter, &libraries(&ctx))
        .unwrap();
    let patched = patched.evaluated().unwrap();
    assert_eq!(patched["metadata"]["labels"], json!({"managed": "true", "seen": "true"}));
    assert_eq!(
        patched["spec"]["containers"],
        json!([{"name": "app", "image": "nginx", "imagePullPolicy": "Always"}])
    );
}

#[test]
fn test_bad_patch_is_error() {
    let ctx = Arc::new(FakeContext::new());
    let set = documents(
        r#"
kind: MutatingPolicy
metadata:
  name: broken
spec:
  mutations:
    - patchType: JSONPatch
      jsonPatch:
        expression: "[{'op': 'remove', 'path': '/spec/absent'}]"
"#,
    );
    let policy = MutatingCompiler::default().compile(&set.mutating[0], &[]).unwrap();
    let converter = TypeConverter::for_kind(&GroupVersionKind::new("", "v1", "Pod"));
    assert!(matches!(
        policy.evaluate(&attributes("default"), None, &converter, &libraries(&ctx)),
        Err(EvalError::Patch(_))
    ));
}

const IMAGE_POLICY: &str = r#"
kind: ImageValidatingPolicy
metadata:
  name: signed
spec:
  matchImageReferences:
    - glob: "ghcr.io/acme/*"
  attestors:
    - name: notary
  validations:
    - expression: "verifyImageSignatures(image, [attestors.notary]) > 0"
      messageExpression: "'unsigned image ' + image"
"#;

#[test]
fn test_image_verification() {
    let set = documents(IMAGE_POLICY);
    let policy = ImageCompiler::default().compile(&set.image[0], &[]).unwrap();
    let ctx = Arc::new(FakeContext::new().with_signature("ghcr.io/acme/api:1", &["notary"]));
    let request = |image: &str| {
        Attributes::from_request(&create(
            pods(),
            pod(
                "default",
                "web",
                json!([{"name": "app", "image": image}, {"name": "proxy", "image": "envoyproxy/envoy:v1"}]),
            ),
        ))
    };

    let signed = policy
        .evaluate(&request("ghcr.io/acme/api:1"), None, &libraries(&ctx))
        .unwrap();
    let outcome = signed.evaluated().unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.images, vec!["ghcr.io/acme/api:1".to_string()]);

    let unsigned = policy
        .evaluate(&request("ghcr.io/acme/api:2"), None, &libraries(&ctx))
        .unwrap();
    let outcome = unsigned.evaluated().unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.message, "unsigned image ghcr.io/acme/api:2");
    assert_eq!(outcome.failed_image.as_deref(), Some("ghcr.io/acme/api:2"));

    // Nothing selected: the policy does not apply.
    let unrelated = policy
        .evaluate(&request("quay.io/other:1"), None, &libraries(&ctx))
        .unwrap();
    assert_eq!(unrelated, crate::compiled::Evaluation::NotMatched);
}

#[test]
fn test_poisoned_generation_sink_is_error() {
    let ctx = Arc::new(FakeContext::new());
    let sink = Arc::new(Mutex::new(Vec::new()));
    let holder = sink.clone();
    let _ = std::thread::spawn(move || {
        let _guard = holder.lock().unwrap();
        panic!("poison the generation sink");
    })
    .join();

    let libraries = libraries(&ctx).with_generation(
        GenerateContext {
            policy_name: "defaults".into(),
            ..Default::default()
        },
        GenerationLabels::default(),
        sink,
    );
    let expression = CelExpression::compile(
        "generate('team-a', [{'apiVersion': 'v1', 'kind': 'ConfigMap', 'metadata': {'name': 'd'}}])",
    )
    .unwrap();
    let scope = Scope::new(&Bindings::default(), &libraries, &[]);
    let err = scope.execute("generate[0]", &expression, &[]).unwrap_err();
    assert!(err.to_string().contains("sink poisoned"));
}
