//! Per-kind engines: fetch, match, evaluate and collect responses.
//!
//! An engine never aborts a request because one policy failed. Each
//! policy's failure is isolated into its own response entry.

pub mod generating;
pub mod image;
pub mod mutating;
pub mod validating;

use std::sync::Arc;

use celgate_protocol::{AdmissionRequest, FailurePolicy, Namespace, ValidationAction};
use serde_json::Value;

use crate::cel::libs::{ContextInterface, Libraries};
use crate::cel::Cancellation;
use crate::config::EngineConfig;
use crate::error::MatchError;
use crate::matching::{Attributes, DefaultMatcher, MatchCriteria, Matcher};
use crate::response::{PolicyResponse, RuleResponse, RuleType};

pub use generating::GeneratingEngine;
pub use image::{ImageVerificationOutcome, ImageVerifyEngine};
pub use mutating::MutatingEngine;
pub use validating::ValidatingEngine;

/// What a request asks the engine to review.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Admission(AdmissionRequest),
    /// A bare document, bound as `object`, for payload-mode policies.
    Json(Value),
}

/// One evaluation request and the capabilities it may use.
#[derive(Clone)]
pub struct EngineRequest {
    pub payload: RequestPayload,
    pub context: Arc<dyn ContextInterface>,
    pub cancellation: Cancellation,
}

impl EngineRequest {
    pub fn admission(request: AdmissionRequest, context: Arc<dyn ContextInterface>) -> Self {
        Self {
            payload: RequestPayload::Admission(request),
            context,
            cancellation: Cancellation::new(),
        }
    }

    pub fn json(payload: Value, context: Arc<dyn ContextInterface>) -> Self {
        Self {
            payload: RequestPayload::Json(payload),
            context,
            cancellation: Cancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn admission_request(&self) -> Option<&AdmissionRequest> {
        match &self.payload {
            RequestPayload::Admission(request) => Some(request),
            RequestPayload::Json(_) => None,
        }
    }
}

/// Looks up the Namespace object a request targets.
pub type NamespaceResolver = Arc<dyn Fn(&str) -> Option<Namespace> + Send + Sync>;

/// A resolver that knows no namespaces.
pub fn no_namespaces() -> NamespaceResolver {
    Arc::new(|_| None)
}

/// A resolver backed by a fixed list.
pub fn static_namespaces(namespaces: Vec<Namespace>) -> NamespaceResolver {
    Arc::new(move |name| namespaces.iter().find(|ns| ns.metadata.name == name).cloned())
}

/// Collaborators shared by every engine kind.
#[derive(Clone)]
pub(crate) struct EngineCore {
    pub(crate) matcher: Arc<dyn Matcher>,
    pub(crate) namespaces: NamespaceResolver,
    pub(crate) config: EngineConfig,
}

impl EngineCore {
    pub(crate) fn new(namespaces: NamespaceResolver, config: EngineConfig) -> Self {
        Self {
            matcher: Arc::new(DefaultMatcher),
            namespaces,
            config,
        }
    }

    pub(crate) fn libraries(&self, request: &EngineRequest) -> Libraries {
        let cancellation = request.cancellation.or_timeout(self.config.timeout());
        Libraries::new(request.context.clone(), cancellation)
    }

    /// Request attributes plus the Namespace object, when one applies.
    pub(crate) fn prepare(&self, request: &AdmissionRequest) -> (Attributes, Option<Namespace>) {
        let attributes = Attributes::from_request(request);
        let namespace = if attributes.namespace.is_empty() {
            None
        } else {
            (self.namespaces)(&attributes.namespace)
        };
        (attributes, namespace)
    }

    pub(crate) fn matches(
        &self,
        criteria: &MatchCriteria,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
    ) -> Result<bool, MatchError> {
        self.matcher.matches(criteria, attributes, namespace)
    }

    /// Match the policy's own constraints, then each derived variant.
    pub(crate) fn decide<'a>(
        &self,
        criteria: &MatchCriteria,
        variants: impl IntoIterator<Item = &'a MatchCriteria>,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
    ) -> MatchDecision {
        match self.matches(criteria, attributes, namespace) {
            Ok(true) => return MatchDecision::Matched(None),
            Ok(false) => {}
            Err(e) => return MatchDecision::Failed(e),
        }
        for (i, variant) in variants.into_iter().enumerate() {
            match self.matches(variant, attributes, namespace) {
                Ok(true) => return MatchDecision::Matched(Some(i)),
                Ok(false) => {}
                Err(e) => return MatchDecision::Failed(e),
            }
        }
        MatchDecision::NotMatched
    }
}

/// How the matcher judged one policy.
pub(crate) enum MatchDecision {
    /// Matched; carries the index of the derived variant that matched.
    Matched(Option<usize>),
    NotMatched,
    /// A deferred selector error on a structurally matching request.
    Failed(MatchError),
}

/// Match errors under `Ignore` drop the policy; otherwise they become an
/// error response for it.
pub(crate) fn match_failure(
    name: &str,
    kind: &str,
    failure_policy: FailurePolicy,
    actions: &[ValidationAction],
    rule_type: RuleType,
    error: MatchError,
) -> Option<PolicyResponse> {
    match failure_policy {
        FailurePolicy::Ignore => {
            log::warn!("ignoring match error for {} {}: {}", kind, name, error);
            None
        }
        FailurePolicy::Fail => Some(PolicyResponse::new(
            name,
            kind,
            actions.to_vec(),
            RuleResponse::error(name, rule_type, format!("failed to match policy: {}", error)),
        )),
    }
}

/// The resource a response reports on.
pub(crate) fn reported_resource(request: &AdmissionRequest) -> Value {
    request
        .object
        .clone()
        .filter(|o| !o.is_null())
        .or_else(|| request.old_object.clone())
        .unwrap_or(Value::Null)
}
