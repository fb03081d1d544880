mod compilation_tests;
mod evaluation_tests;
mod matching_tests;
mod provider_tests;

use std::sync::Arc;

use celgate_protocol::{AdmissionRequest, GroupVersionResource, Operation};
use serde_json::{json, Value};

use crate::cel::libs::Libraries;
use crate::cel::Cancellation;
use crate::fake::FakeContext;
use crate::parser::{parse_documents, PolicySet};

pub(crate) fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn documents(yaml: &str) -> PolicySet {
    parse_documents(yaml).unwrap()
}

pub(crate) fn libraries(context: &Arc<FakeContext>) -> Libraries {
    Libraries::new(context.clone(), Cancellation::new())
}

pub(crate) fn pod(namespace: &str, name: &str, containers: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {"containers": containers},
    })
}

pub(crate) fn create(resource: GroupVersionResource, object: Value) -> AdmissionRequest {
    AdmissionRequest::for_object(Operation::Create, resource, object)
}

pub(crate) fn pods() -> GroupVersionResource {
    GroupVersionResource::new("", "v1", "pods")
}

pub(crate) fn deployments() -> GroupVersionResource {
    GroupVersionResource::new("apps", "v1", "deployments")
}

pub(crate) fn deployment(namespace: &str, name: &str, containers: Value) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": namespace},
        "spec": {
            "replicas": 1,
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": containers},
            },
        },
    })
}
