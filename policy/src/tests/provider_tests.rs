//! Tests for policy providers and manifest loading.

use std::sync::{Arc, Mutex};

use celgate_protocol::PolicyException;

use super::{documents, init};
use crate::compiler::ValidatingCompiler;
use crate::error::{PolicyError, Result};
use crate::parser::parse_documents;
use crate::provider::{ExceptionLister, Provider, StaticProvider, WatchProvider};
use crate::selector::Selector;

const POLICIES: &str = r#"
kind: ValidatingPolicy
metadata:
  name: first
spec:
  validations:
    - expression: "true"
---
kind: ValidatingPolicy
metadata:
  name: second
spec:
  validations:
    - expression: "object.metadata.name != ''"
"#;

const EXCEPTION: &str = r#"
kind: PolicyException
metadata:
  name: skip-first
  namespace: ops
spec:
  policyRefs:
    - name: first
      kind: ValidatingPolicy
  matchConditions:
    - name: always
      expression: "true"
"#;

fn exception() -> PolicyException {
    documents(EXCEPTION).exceptions.remove(0)
}

/// An exception store the test can edit after the provider is built.
#[derive(Clone, Default)]
struct SharedExceptions(Arc<Mutex<Vec<PolicyException>>>);

impl SharedExceptions {
    fn replace(&self, exceptions: Vec<PolicyException>) {
        *self.0.lock().unwrap() = exceptions;
    }
}

impl ExceptionLister for SharedExceptions {
    fn list(&self, selector: &Selector) -> Result<Vec<PolicyException>> {
        self.0.lock().unwrap().list(selector)
    }
}

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_parse_multi_document() {
    init();
    let set = parse_documents(&format!("---\n{}---\n{}\n---\n", POLICIES, EXCEPTION)).unwrap();
    assert_eq!(set.validating.len(), 2);
    assert_eq!(set.exceptions.len(), 1);
    assert_eq!(set.len(), 3);
    assert_eq!(set.validating[1].name(), "second");
}

#[test]
fn test_parse_rejects_unknown_kind() {
    let err = parse_documents("kind: ConfigMap\nmetadata:\n  name: x\n").unwrap_err();
    assert!(matches!(err, PolicyError::UnsupportedKind(ref kind) if kind == "ConfigMap"));

    let err = parse_documents("metadata: {}\n").unwrap_err();
    assert!(matches!(err, PolicyError::UnsupportedKind(ref kind) if kind.is_empty()));
}

#[test]
fn test_parse_empty_manifest() {
    assert!(parse_documents("").unwrap().is_empty());
    assert!(matches!(parse_documents("kind: [\n"), Err(PolicyError::YamlParse(_))));
}

// =============================================================================
// StaticProvider
// =============================================================================

#[test]
fn test_static_provider() {
    let set = documents(POLICIES);
    let provider = StaticProvider::compile(&ValidatingCompiler::default(), &set.validating, &[]).unwrap();
    assert_eq!(provider.len(), 2);

    let fetched = provider.fetch().unwrap();
    assert_eq!(fetched[0].name(), "first");
    assert_eq!(fetched[1].name(), "second");
    assert!(provider.get("second").unwrap().is_some());
    assert!(provider.get("third").unwrap().is_none());
}

#[test]
fn test_static_provider_compile_error() {
    let set = documents(&POLICIES.replace("\"true\"", "\"((\""));
    let err = StaticProvider::compile(&ValidatingCompiler::default(), &set.validating, &[]).unwrap_err();
    match err {
        PolicyError::Compile { name, errors } => {
            assert_eq!(name, "first");
            assert_eq!(errors.len(), 1);
        }
        other => panic!("unexpected error: {}", other),
    }
}

// =============================================================================
// WatchProvider
// =============================================================================

#[test]
fn test_watch_provider_reconcile_and_remove() {
    let provider = WatchProvider::new(ValidatingCompiler::default(), Box::new(Vec::<PolicyException>::new()));
    for policy in documents(POLICIES).validating {
        provider.reconcile(policy).unwrap();
    }
    assert_eq!(provider.names().unwrap(), vec!["first", "second"]);

    provider.remove("first").unwrap();
    assert_eq!(provider.names().unwrap(), vec!["second"]);
    assert_eq!(provider.fetch().unwrap().len(), 1);
}

#[test]
fn test_watch_provider_drops_broken_update() {
    let provider = WatchProvider::new(ValidatingCompiler::default(), Box::new(Vec::<PolicyException>::new()));
    let mut set = documents(POLICIES);
    provider.reconcile(set.validating[0].clone()).unwrap();
    assert!(provider.get("first").unwrap().is_some());

    set.validating[0].spec.validations[0].expression = "((".to_string();
    let err = provider.reconcile(set.validating.remove(0)).unwrap_err();
    assert!(matches!(err, PolicyError::Compile { .. }));
    assert!(provider.get("first").unwrap().is_none());
}

#[test]
fn test_watch_provider_attaches_exceptions() {
    let provider = WatchProvider::new(ValidatingCompiler::default(), Box::new(vec![exception()]));
    for policy in documents(POLICIES).validating {
        provider.reconcile(policy).unwrap();
    }
    assert_eq!(provider.get("first").unwrap().unwrap().exceptions.len(), 1);
    assert!(provider.get("second").unwrap().unwrap().exceptions.is_empty());
}

#[test]
fn test_exception_change_recompiles_referenced_policies() {
    let provider = WatchProvider::new(ValidatingCompiler::default(), Box::new(Vec::<PolicyException>::new()));
    for policy in documents(POLICIES).validating {
        provider.reconcile(policy).unwrap();
    }
    let before = provider.get("first").unwrap().unwrap();
    let untouched = provider.get("second").unwrap().unwrap();

    provider.exception_changed(&exception()).unwrap();

    let after = provider.get("first").unwrap().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(Arc::ptr_eq(&untouched, &provider.get("second").unwrap().unwrap()));
}

#[test]
fn test_retargeted_exception_leaves_previous_policy() {
    let exceptions = SharedExceptions::default();
    exceptions.replace(vec![exception()]);
    let provider = WatchProvider::new(ValidatingCompiler::default(), Box::new(exceptions.clone()));
    for policy in documents(POLICIES).validating {
        provider.reconcile(policy).unwrap();
    }
    assert_eq!(provider.get("first").unwrap().unwrap().exceptions.len(), 1);

    let mut retargeted = exception();
    retargeted.spec.policy_refs[0].name = "second".to_string();
    exceptions.replace(vec![retargeted.clone()]);
    provider.exception_changed(&retargeted).unwrap();

    assert!(provider.get("first").unwrap().unwrap().exceptions.is_empty());
    assert_eq!(provider.get("second").unwrap().unwrap().exceptions.len(), 1);
}

#[test]
fn test_deleted_exception_is_dropped() {
    let exceptions = SharedExceptions::default();
    exceptions.replace(vec![exception()]);
    let provider = WatchProvider::new(ValidatingCompiler::default(), Box::new(exceptions.clone()));
    for policy in documents(POLICIES).validating {
        provider.reconcile(policy).unwrap();
    }

    exceptions.replace(Vec::new());
    provider.exception_changed(&exception()).unwrap();
    assert!(provider.get("first").unwrap().unwrap().exceptions.is_empty());
}
