use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use celgate_policy::{
    no_namespaces, parse_documents, Compiler, EngineConfig, EngineRequest, FakeContext,
    StaticProvider, ValidatingCompiler, ValidatingEngine,
};
use celgate_protocol::{AdmissionRequest, GroupVersionResource, Operation};

const POLICY: &str = r#"
apiVersion: policies.celgate.io/v1
kind: ValidatingPolicy
metadata:
  name: pod-hygiene
spec:
  matchConstraints:
    resourceRules:
      - apiGroups: [""]
        apiVersions: [v1]
        operations: [CREATE, UPDATE]
        resources: [pods]
  variables:
    - name: containers
      expression: "object.spec.containers"
  validations:
    - expression: "variables.containers.all(c, has(c.resources))"
      message: resources required
    - expression: "!variables.containers.exists(c, c.image.endsWith(':latest'))"
      message: pin image tags
"#;

fn make_request(kind: &str) -> AdmissionRequest {
    let containers = serde_json::json!([
        {"name": "app", "image": "nginx:1.27", "resources": {"limits": {"cpu": "1"}}},
        {"name": "sidecar", "image": "envoy:1.30", "resources": {"limits": {"cpu": "1"}}},
    ]);
    match kind {
        "deployment" => AdmissionRequest::for_object(
            Operation::Create,
            GroupVersionResource::new("apps", "v1", "deployments"),
            serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "default"},
                "spec": {"template": {"spec": {"containers": containers}}}
            }),
        ),
        _ => AdmissionRequest::for_object(
            Operation::Create,
            GroupVersionResource::new("", "v1", "pods"),
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "web", "namespace": "default"},
                "spec": {"containers": containers}
            }),
        ),
    }
}

fn bench_compile(c: &mut Criterion) {
    let set = parse_documents(POLICY).unwrap();
    let compiler = ValidatingCompiler::default();

    c.bench_function("compile_validating_policy", |b| {
        b.iter(|| compiler.compile(black_box(&set.validating[0]), &[]).unwrap())
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let set = parse_documents(POLICY).unwrap();
    let provider = StaticProvider::compile(&ValidatingCompiler::default(), &set.validating, &[]).unwrap();
    let engine = ValidatingEngine::new(Arc::new(provider), no_namespaces(), EngineConfig::default());
    let context = Arc::new(FakeContext::new());

    let pod = EngineRequest::admission(make_request("pod"), context.clone());
    c.bench_function("evaluate_pod", |b| {
        b.iter(|| engine.handle(black_box(&pod), None).unwrap())
    });

    let deployment = EngineRequest::admission(make_request("deployment"), context);
    c.bench_function("evaluate_autogen_deployment", |b| {
        b.iter(|| engine.handle(black_box(&deployment), None).unwrap())
    });
}

criterion_group!(benches, bench_compile, bench_evaluate);
criterion_main!(benches);
