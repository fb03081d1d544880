use std::sync::Arc;

use celgate_protocol::{AdmissionRequest, EvaluationMode, ValidationAction};
use serde_json::Value;

use super::{
    match_failure, reported_resource, EngineCore, EngineRequest, MatchDecision, NamespaceResolver,
    RequestPayload,
};
use crate::cel::libs::Libraries;
use crate::compiled::{CompiledValidatingPolicy, Evaluation, ValidationOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineResult, EvalResult};
use crate::matching::Matcher;
use crate::provider::Provider;
use crate::response::{EngineResponse, PolicyResponse, RuleResponse, RuleType, Stopwatch};

type ValidatingProvider = Arc<dyn Provider<CompiledValidatingPolicy> + Send + Sync>;

/// Runs validating policies against admission requests or JSON payloads.
pub struct ValidatingEngine {
    provider: ValidatingProvider,
    core: EngineCore,
}

impl ValidatingEngine {
    pub fn new(provider: ValidatingProvider, namespaces: NamespaceResolver, config: EngineConfig) -> Self {
        Self {
            provider,
            core: EngineCore::new(namespaces, config),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.core.matcher = matcher;
        self
    }

    /// Evaluate every candidate policy, optionally narrowed by `predicate`.
    ///
    /// Admission requests see Kubernetes-mode policies; JSON payloads see
    /// JSON-mode policies, which skip the matcher.
    pub fn handle(
        &self,
        request: &EngineRequest,
        predicate: Option<&dyn Fn(&CompiledValidatingPolicy) -> bool>,
    ) -> EngineResult<EngineResponse> {
        let policies: Vec<_> = self
            .provider
            .fetch()?
            .into_iter()
            .filter(|p| predicate.map_or(true, |keep| keep(p.as_ref())))
            .collect();
        let libraries = self.core.libraries(request);
        match &request.payload {
            RequestPayload::Admission(admission) => {
                Ok(self.handle_admission(admission, &policies, &libraries))
            }
            RequestPayload::Json(payload) => Ok(self.handle_json(payload, &policies, &libraries)),
        }
    }

    fn handle_admission(
        &self,
        request: &AdmissionRequest,
        policies: &[Arc<CompiledValidatingPolicy>],
        libraries: &Libraries,
    ) -> EngineResponse {
        let (attributes, namespace) = self.core.prepare(request);
        let mut response = EngineResponse::new(reported_resource(request));
        for policy in policies {
            if policy.body.mode != EvaluationMode::Kubernetes {
                continue;
            }
            let autogen = match self.core.decide(
                &policy.criteria,
                policy.body.autogen.iter().map(|v| &v.criteria),
                &attributes,
                namespace.as_ref(),
            ) {
                MatchDecision::Matched(autogen) => autogen,
                MatchDecision::NotMatched => continue,
                MatchDecision::Failed(e) => {
                    response.policies.extend(match_failure(
                        policy.name(),
                        policy.kind(),
                        policy.failure_policy(),
                        &policy.actions,
                        RuleType::Validation,
                        e,
                    ));
                    continue;
                }
            };
            let stopwatch = Stopwatch::start();
            let evaluation = policy.evaluate(&attributes, namespace.as_ref(), autogen, libraries);
            let variant = autogen
                .and_then(|i| policy.body.autogen.get(i))
                .map(|v| v.variant);
            if let Some(rule) = rule_response(policy, evaluation, &stopwatch) {
                let rule = match variant {
                    Some(variant) => rule.with_property("autogen", variant),
                    None => rule,
                };
                response.policies.push(PolicyResponse::new(
                    policy.name(),
                    policy.kind(),
                    policy.actions.clone(),
                    rule,
                ));
            }
        }
        response
    }

    fn handle_json(
        &self,
        payload: &Value,
        policies: &[Arc<CompiledValidatingPolicy>],
        libraries: &Libraries,
    ) -> EngineResponse {
        let mut response = EngineResponse::new(payload.clone());
        for policy in policies {
            if policy.body.mode != EvaluationMode::Json {
                continue;
            }
            let stopwatch = Stopwatch::start();
            let evaluation = policy.evaluate_json(payload, libraries);
            if let Some(rule) = rule_response(policy, evaluation, &stopwatch) {
                response.policies.push(PolicyResponse::new(
                    policy.name(),
                    policy.kind(),
                    policy.actions.clone(),
                    rule,
                ));
            }
        }
        response
    }
}

fn rule_response(
    policy: &CompiledValidatingPolicy,
    evaluation: EvalResult<Evaluation<ValidationOutcome>>,
    stopwatch: &Stopwatch,
) -> Option<RuleResponse> {
    let name = policy.name();
    let rule = match evaluation {
        Ok(Evaluation::NotMatched) => {
            log::debug!("validating policy {} skipped by match conditions", name);
            return None;
        }
        Ok(Evaluation::Excepted(exceptions)) => {
            RuleResponse::excepted(name, RuleType::Validation, exceptions)
        }
        Ok(Evaluation::Evaluated(outcome)) if outcome.allowed => {
            RuleResponse::pass(name, RuleType::Validation, "")
        }
        Ok(Evaluation::Evaluated(outcome)) => {
            let rule = if policy.actions == [ValidationAction::Warn] {
                RuleResponse::warn(name, RuleType::Validation, outcome.message)
            } else {
                RuleResponse::fail(name, RuleType::Validation, outcome.message)
            };
            let rule = rule.with_properties(outcome.audit_annotations);
            if outcome.reason.is_empty() {
                rule
            } else {
                rule.with_property("reason", outcome.reason)
            }
        }
        Err(e) => {
            log::debug!("validating policy {} errored: {}", name, e);
            RuleResponse::error(name, RuleType::Validation, e.to_string())
        }
    };
    Some(rule.with_stats(stopwatch.stats()))
}
