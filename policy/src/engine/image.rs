//! Image verification engine.
//!
//! Verification has to happen before the object is persisted, but allow
//! and deny are decided at validation time. [`ImageVerifyEngine::handle_mutating`]
//! verifies and records a per-policy outcome in an annotation;
//! [`ImageVerifyEngine::handle_validating`] later reads that annotation
//! back and renders the decision without verifying again.

use std::collections::BTreeMap;
use std::sync::Arc;

use celgate_protocol::{AdmissionRequest, ValidationAction};
use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    match_failure, reported_resource, EngineCore, EngineRequest, MatchDecision, NamespaceResolver,
    RequestPayload,
};
use crate::cel::libs::Libraries;
use crate::compiled::{CompiledImagePolicy, Evaluation};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::matching::{Attributes, Matcher};
use crate::provider::Provider;
use crate::response::{
    EngineResponse, PolicyResponse, RuleResponse, RuleStatus, RuleType, Stopwatch,
};

type ImageProvider = Arc<dyn Provider<CompiledImagePolicy> + Send + Sync>;
type Predicate<'a> = Option<&'a dyn Fn(&CompiledImagePolicy) -> bool>;

/// One policy's verification result as stored in the outcomes annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageVerificationOutcome {
    pub name: String,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ImageVerificationOutcome {
    fn from_rule(rule: &RuleResponse) -> Self {
        Self {
            name: rule.name.clone(),
            status: rule.status,
            message: rule.message.clone(),
            properties: rule.properties.clone(),
        }
    }
}

/// What verification made of one matched policy.
enum Verified {
    /// Conditions false, excepted by `Ignore`, or no images selected.
    Skipped,
    Rule(RuleResponse),
}

pub struct ImageVerifyEngine {
    provider: ImageProvider,
    core: EngineCore,
}

impl ImageVerifyEngine {
    pub fn new(provider: ImageProvider, namespaces: NamespaceResolver, config: EngineConfig) -> Self {
        Self {
            provider,
            core: EngineCore::new(namespaces, config),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.core.matcher = matcher;
        self
    }

    /// Verify and decide in one pass.
    pub fn handle(&self, request: &EngineRequest, predicate: Predicate<'_>) -> EngineResult<EngineResponse> {
        let admission = admission(request)?;
        let libraries = self.core.libraries(request);
        let mut response = EngineResponse::new(reported_resource(admission));
        for (policy, verified) in self.verify(admission, &libraries, predicate)? {
            match verified {
                Ok(Verified::Skipped) => {}
                Ok(Verified::Rule(rule)) => response.policies.push(policy_response(&policy, rule)),
                Err(failure) => response.policies.extend(failure),
            }
        }
        Ok(response)
    }

    /// Verify and record the outcomes in an annotation patch.
    pub fn handle_mutating(
        &self,
        request: &EngineRequest,
        predicate: Predicate<'_>,
    ) -> EngineResult<EngineResponse> {
        let admission = admission(request)?;
        let object = admission.object.clone().filter(|o| !o.is_null());
        let libraries = self.core.libraries(request);
        let mut response = EngineResponse::new(reported_resource(admission));
        let mut outcomes = BTreeMap::new();
        for (policy, verified) in self.verify(admission, &libraries, predicate)? {
            let rule = match verified {
                Ok(Verified::Skipped) => {
                    RuleResponse::skip(policy.name(), RuleType::ImageVerify, "no images verified")
                }
                Ok(Verified::Rule(rule)) => {
                    response.policies.push(policy_response(&policy, rule.clone()));
                    rule
                }
                Err(failure) => {
                    let Some(failure) = failure else { continue };
                    let rule = failure.rules.first().cloned();
                    response.policies.push(failure);
                    let Some(rule) = rule else { continue };
                    rule
                }
            };
            outcomes.insert(policy.name().to_string(), ImageVerificationOutcome::from_rule(&rule));
        }
        // Nothing to annotate without an object, e.g. on DELETE.
        let Some(object) = object.filter(|_| !outcomes.is_empty()) else {
            return Ok(response);
        };

        let annotation = &self.core.config.image_verification_outcomes_annotation;
        let patch = outcomes_patch(&object, annotation, &outcomes)?;
        let mut patched = object;
        json_patch::patch(&mut patched, &patch.0).map_err(|e| EngineError::Patch(e.to_string()))?;
        response.patched_resource = Some(patched);
        response.patch = Some(patch);
        Ok(response)
    }

    /// Decide from the outcomes recorded by [`Self::handle_mutating`].
    pub fn handle_validating(
        &self,
        request: &EngineRequest,
        predicate: Predicate<'_>,
    ) -> EngineResult<EngineResponse> {
        let admission = admission(request)?;
        let annotation = &self.core.config.image_verification_outcomes_annotation;
        let recorded = read_outcomes(admission, annotation)?;
        let (attributes, namespace) = self.core.prepare(admission);
        let mut response = EngineResponse::new(reported_resource(admission));

        for policy in self.candidates(predicate)? {
            match self.core.decide(&policy.criteria, std::iter::empty(), &attributes, namespace.as_ref()) {
                MatchDecision::Matched(_) => {}
                MatchDecision::NotMatched => continue,
                MatchDecision::Failed(e) => {
                    response.policies.extend(match_failure(
                        policy.name(),
                        policy.kind(),
                        policy.failure_policy(),
                        &policy.actions,
                        RuleType::ImageVerify,
                        e,
                    ));
                    continue;
                }
            }
            let Some(recorded) = recorded.as_ref() else {
                return Err(EngineError::MissingOutcomes(annotation.clone()));
            };
            let rule = match recorded.get(policy.name()) {
                Some(outcome) if outcome.status == RuleStatus::Skip => continue,
                Some(outcome) => RuleResponse::new(
                    policy.name(),
                    RuleType::ImageVerify,
                    outcome.status,
                    outcome.message.clone(),
                )
                .with_properties(outcome.properties.clone()),
                None => RuleResponse::fail(policy.name(), RuleType::ImageVerify, "policy not evaluated"),
            };
            response.policies.push(policy_response(&policy, rule));
        }
        Ok(response)
    }

    fn candidates(&self, predicate: Predicate<'_>) -> EngineResult<Vec<Arc<CompiledImagePolicy>>> {
        Ok(self
            .provider
            .fetch()?
            .into_iter()
            .filter(|p| predicate.map_or(true, |keep| keep(p.as_ref())))
            .collect())
    }

    /// Match and evaluate every candidate. Match failures come back as
    /// `Err` with the response to report, if any.
    #[allow(clippy::type_complexity)]
    fn verify(
        &self,
        admission: &AdmissionRequest,
        libraries: &Libraries,
        predicate: Predicate<'_>,
    ) -> EngineResult<Vec<(Arc<CompiledImagePolicy>, Result<Verified, Option<PolicyResponse>>)>> {
        let (attributes, namespace) = self.core.prepare(admission);
        let mut results = Vec::new();
        for policy in self.candidates(predicate)? {
            let verified = match self.core.decide(
                &policy.criteria,
                std::iter::empty(),
                &attributes,
                namespace.as_ref(),
            ) {
                MatchDecision::Matched(_) => Ok(self.verify_one(&policy, &attributes, namespace.as_ref(), libraries)),
                MatchDecision::NotMatched => continue,
                MatchDecision::Failed(e) => Err(match_failure(
                    policy.name(),
                    policy.kind(),
                    policy.failure_policy(),
                    &policy.actions,
                    RuleType::ImageVerify,
                    e,
                )),
            };
            results.push((policy, verified));
        }
        Ok(results)
    }

    fn verify_one(
        &self,
        policy: &CompiledImagePolicy,
        attributes: &Attributes,
        namespace: Option<&celgate_protocol::Namespace>,
        libraries: &Libraries,
    ) -> Verified {
        let stopwatch = Stopwatch::start();
        let name = policy.name();
        let rule = match policy.evaluate(attributes, namespace, libraries) {
            Ok(Evaluation::NotMatched) => return Verified::Skipped,
            Ok(Evaluation::Excepted(exceptions)) => {
                RuleResponse::excepted(name, RuleType::ImageVerify, exceptions)
            }
            Ok(Evaluation::Evaluated(outcome)) => {
                let images = outcome.images.join(",");
                let rule = if outcome.allowed {
                    RuleResponse::pass(name, RuleType::ImageVerify, "")
                } else if policy.actions == [ValidationAction::Warn] {
                    RuleResponse::warn(name, RuleType::ImageVerify, outcome.message)
                } else {
                    RuleResponse::fail(name, RuleType::ImageVerify, outcome.message)
                };
                let rule = rule.with_property("images", images);
                match outcome.failed_image {
                    Some(image) => rule.with_property("image", image),
                    None => rule,
                }
            }
            Err(e) => {
                log::debug!("image policy {} errored: {}", name, e);
                RuleResponse::error(name, RuleType::ImageVerify, e.to_string())
            }
        };
        Verified::Rule(rule.with_stats(stopwatch.stats()))
    }
}

fn admission(request: &EngineRequest) -> EngineResult<&AdmissionRequest> {
    match &request.payload {
        RequestPayload::Admission(admission) => Ok(admission),
        RequestPayload::Json(_) => Err(EngineError::Request(
            "image verification requires an admission request".to_string(),
        )),
    }
}

fn policy_response(policy: &CompiledImagePolicy, rule: RuleResponse) -> PolicyResponse {
    PolicyResponse::new(policy.name(), policy.kind(), policy.actions.clone(), rule)
}

/// A JSON patch writing `outcomes` under `annotation`.
fn outcomes_patch(
    object: &Value,
    annotation: &str,
    outcomes: &BTreeMap<String, ImageVerificationOutcome>,
) -> EngineResult<Patch> {
    let serialized =
        serde_json::to_string(outcomes).map_err(|e| EngineError::Patch(e.to_string()))?;
    let operation = match object.get("metadata") {
        None => json!({
            "op": "add",
            "path": "/metadata",
            "value": {"annotations": {annotation: serialized}},
        }),
        Some(metadata) if !metadata["annotations"].is_object() => json!({
            "op": "add",
            "path": "/metadata/annotations",
            "value": {annotation: serialized},
        }),
        Some(_) => json!({
            "op": "add",
            "path": format!("/metadata/annotations/{}", escape_pointer(annotation)),
            "value": serialized,
        }),
    };
    serde_json::from_value(Value::Array(vec![operation]))
        .map_err(|e| EngineError::Patch(e.to_string()))
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Outcomes recorded on the request object; `None` when not annotated.
fn read_outcomes(
    request: &AdmissionRequest,
    annotation: &str,
) -> EngineResult<Option<BTreeMap<String, ImageVerificationOutcome>>> {
    let raw = request
        .object
        .as_ref()
        .and_then(|o| o.get("metadata"))
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(annotation))
        .and_then(Value::as_str);
    match raw {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw).map(Some).map_err(|e| {
            EngineError::Request(format!("malformed {} annotation: {}", annotation, e))
        }),
    }
}
