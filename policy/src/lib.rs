//! Admission-control core for CEL policies.
//!
//! This crate matches admission requests against policy constraints,
//! compiles the four policy kinds into executable CEL programs, evaluates
//! them with lazily computed variables and exceptions, and folds the results
//! into per-policy responses and an allow/deny verdict.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use celgate_policy::{
//!     no_namespaces, parse_documents, EngineConfig, EngineRequest, FakeContext, StaticProvider,
//!     ValidatingCompiler, ValidatingEngine,
//! };
//! use celgate_protocol::{AdmissionRequest, GroupVersionResource, Operation};
//! use serde_json::json;
//!
//! let set = parse_documents(r#"
//! apiVersion: policies.celgate.io/v1
//! kind: ValidatingPolicy
//! metadata:
//!   name: require-team
//! spec:
//!   matchConstraints:
//!     resourceRules:
//!       - apiGroups: [""]
//!         apiVersions: [v1]
//!         operations: [CREATE]
//!         resources: [configmaps]
//!   validations:
//!     - expression: "has(object.metadata.labels) && 'team' in object.metadata.labels"
//!       message: team label required
//! "#).unwrap();
//!
//! let provider = StaticProvider::compile(&ValidatingCompiler::default(), &set.validating, &[]).unwrap();
//! let engine = ValidatingEngine::new(Arc::new(provider), no_namespaces(), EngineConfig::default());
//!
//! let request = AdmissionRequest::for_object(
//!     Operation::Create,
//!     GroupVersionResource::new("", "v1", "configmaps"),
//!     json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "settings"}}),
//! );
//! let response = engine
//!     .handle(&EngineRequest::admission(request, Arc::new(FakeContext::new())), None)
//!     .unwrap();
//!
//! let verdict = response.verdict();
//! assert!(!verdict.allowed);
//! assert_eq!(verdict.message, "require-team: team label required");
//! ```

pub mod autogen;
pub mod cel;
pub mod compiled;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
mod fake;
pub mod matching;
mod parser;
pub mod pattern;
pub mod provider;
pub mod response;
pub mod selector;
pub mod typeconv;

#[cfg(test)]
mod tests;

pub use cel::libs::{ContextInterface, GenerateContext};
pub use cel::Cancellation;
pub use compiled::{
    CompiledGeneratingPolicy, CompiledImagePolicy, CompiledMutatingPolicy, CompiledPolicy,
    CompiledValidatingPolicy, Evaluation,
};
pub use compiler::{
    Compiler, CompilerOptions, GeneratingCompiler, ImageCompiler, MutatingCompiler,
    ValidatingCompiler,
};
pub use config::{EngineConfig, GenerationLabels};
pub use engine::{
    no_namespaces, static_namespaces, EngineRequest, GeneratingEngine, ImageVerificationOutcome,
    ImageVerifyEngine, MutatingEngine, NamespaceResolver, RequestPayload, ValidatingEngine,
};
pub use error::{
    CompileErrors, ConfigError, ContextError, EngineError, EvalError, FieldError, MatchError,
    PatternError, PolicyError, SelectorError,
};
pub use fake::FakeContext;
pub use matching::{Attributes, DefaultMatcher, MatchCriteria, Matcher};
pub use parser::{parse_documents, PolicySet};
pub use pattern::{compile_pattern, CompiledPattern};
pub use provider::{ExceptionLister, Provider, StaticProvider, WatchProvider};
pub use response::{
    EngineResponse, PolicyResponse, ResponseSummary, RuleResponse, RuleStatus, RuleType, Verdict,
};
