use std::sync::Arc;

use celgate_protocol::AdmissionRequest;

use super::{
    match_failure, reported_resource, EngineCore, EngineRequest, MatchDecision, NamespaceResolver,
    RequestPayload,
};
use crate::compiled::{CompiledMutatingPolicy, Evaluation};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::matching::{Attributes, Matcher};
use crate::provider::Provider;
use crate::response::{EngineResponse, PolicyResponse, RuleResponse, RuleType, Stopwatch};
use crate::typeconv::TypeConverterManager;

type MutatingProvider = Arc<dyn Provider<CompiledMutatingPolicy> + Send + Sync>;

/// Applies mutating policies in order, each to the previous one's output.
pub struct MutatingEngine {
    provider: MutatingProvider,
    core: EngineCore,
    converters: TypeConverterManager,
}

impl MutatingEngine {
    pub fn new(provider: MutatingProvider, namespaces: NamespaceResolver, config: EngineConfig) -> Self {
        Self {
            provider,
            core: EngineCore::new(namespaces, config),
            converters: TypeConverterManager::new(),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.core.matcher = matcher;
        self
    }

    /// Mutate the request object.
    ///
    /// The response carries the final object and the JSON patch from the
    /// original to it. A failing policy contributes nothing to the object.
    pub fn handle(
        &self,
        request: &EngineRequest,
        predicate: Option<&dyn Fn(&CompiledMutatingPolicy) -> bool>,
    ) -> EngineResult<EngineResponse> {
        let RequestPayload::Admission(admission) = &request.payload else {
            return Err(EngineError::Request(
                "mutating policies require an admission request".to_string(),
            ));
        };
        let original = admission.object.clone().filter(|o| !o.is_null());
        let policies = self.provider.fetch()?;
        let libraries = self.core.libraries(request);
        let (mut attributes, namespace) = self.core.prepare(admission);
        let converter = self.converters.converter(&attributes.kind);

        let mut response = EngineResponse::new(reported_resource(admission));
        let mut current = original.clone();
        for policy in policies.iter().filter(|p| predicate.map_or(true, |keep| keep(p.as_ref()))) {
            attributes.object = current.clone();
            match self.core.decide(&policy.criteria, std::iter::empty(), &attributes, namespace.as_ref()) {
                MatchDecision::Matched(_) => {}
                MatchDecision::NotMatched => continue,
                MatchDecision::Failed(e) => {
                    response.policies.extend(match_failure(
                        policy.name(),
                        policy.kind(),
                        policy.failure_policy(),
                        &policy.actions,
                        RuleType::Mutation,
                        e,
                    ));
                    continue;
                }
            }
            let stopwatch = Stopwatch::start();
            let name = policy.name();
            let Some(object) = current.as_ref() else {
                response.policies.push(PolicyResponse::new(
                    name,
                    policy.kind(),
                    policy.actions.clone(),
                    RuleResponse::error(name, RuleType::Mutation, "admission request has no object to mutate"),
                ));
                continue;
            };
            let rule = match policy.evaluate(&attributes, namespace.as_ref(), &converter, &libraries) {
                Ok(Evaluation::NotMatched) => continue,
                Ok(Evaluation::Excepted(exceptions)) => {
                    RuleResponse::excepted(name, RuleType::Mutation, exceptions)
                }
                Ok(Evaluation::Evaluated(patched)) => {
                    let message = if &patched == object {
                        "no changes"
                    } else {
                        "mutation applied"
                    };
                    current = Some(patched);
                    RuleResponse::pass(name, RuleType::Mutation, message)
                }
                Err(e) => {
                    log::debug!("mutating policy {} errored: {}", name, e);
                    RuleResponse::error(name, RuleType::Mutation, e.to_string())
                }
            };
            response.policies.push(PolicyResponse::new(
                name,
                policy.kind(),
                policy.actions.clone(),
                rule.with_stats(stopwatch.stats()),
            ));
        }

        if let (Some(original), Some(current)) = (original, current) {
            if !response.policies.is_empty() {
                let patch = json_patch::diff(&original, &current);
                response.patch = (!patch.0.is_empty()).then_some(patch);
                response.patched_resource = Some(current);
            }
        }
        Ok(response)
    }

    /// Names of matching policies that also mutate existing resources.
    pub fn matched_mutate_existing_policies(
        &self,
        request: &AdmissionRequest,
    ) -> EngineResult<Vec<String>> {
        let (attributes, namespace) = self.core.prepare(request);
        let mut names = Vec::new();
        for policy in self.provider.fetch()? {
            if !policy.body.mutate_existing {
                continue;
            }
            if self.matches_quietly(&policy, &attributes, namespace.as_ref()) {
                names.push(policy.name().to_string());
            }
        }
        Ok(names)
    }

    fn matches_quietly(
        &self,
        policy: &CompiledMutatingPolicy,
        attributes: &Attributes,
        namespace: Option<&celgate_protocol::Namespace>,
    ) -> bool {
        match self.core.matches(&policy.criteria, attributes, namespace) {
            Ok(matched) => matched,
            Err(e) => {
                log::warn!("mutating policy {} failed to match: {}", policy.name(), e);
                false
            }
        }
    }
}
