use std::sync::Arc;

use celgate_protocol::object_meta;

use super::{
    match_failure, reported_resource, EngineCore, EngineRequest, MatchDecision, NamespaceResolver,
    RequestPayload,
};
use crate::cel::libs::GenerateContext;
use crate::compiled::{CompiledGeneratingPolicy, Evaluation};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::matching::{Attributes, Matcher};
use crate::provider::Provider;
use crate::response::{EngineResponse, PolicyResponse, RuleResponse, RuleType, Stopwatch};

type GeneratingProvider = Arc<dyn Provider<CompiledGeneratingPolicy> + Send + Sync>;

/// Creates downstream resources for triggering requests.
pub struct GeneratingEngine {
    provider: GeneratingProvider,
    core: EngineCore,
    restore_cache: bool,
}

impl GeneratingEngine {
    pub fn new(provider: GeneratingProvider, namespaces: NamespaceResolver, config: EngineConfig) -> Self {
        Self {
            provider,
            core: EngineCore::new(namespaces, config),
            restore_cache: false,
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.core.matcher = matcher;
        self
    }

    /// Also report downstream resources that already existed.
    pub fn with_restore_cache(mut self, restore_cache: bool) -> Self {
        self.restore_cache = restore_cache;
        self
    }

    pub fn handle(
        &self,
        request: &EngineRequest,
        predicate: Option<&dyn Fn(&CompiledGeneratingPolicy) -> bool>,
    ) -> EngineResult<EngineResponse> {
        let RequestPayload::Admission(admission) = &request.payload else {
            return Err(EngineError::Request(
                "generating policies require an admission request".to_string(),
            ));
        };
        let policies = self.provider.fetch()?;
        let libraries = self.core.libraries(request);
        let (attributes, namespace) = self.core.prepare(admission);

        let mut response = EngineResponse::new(reported_resource(admission));
        for policy in policies.iter().filter(|p| predicate.map_or(true, |keep| keep(p.as_ref()))) {
            match self.core.decide(&policy.criteria, std::iter::empty(), &attributes, namespace.as_ref()) {
                MatchDecision::Matched(_) => {}
                MatchDecision::NotMatched => continue,
                MatchDecision::Failed(e) => {
                    response.policies.extend(match_failure(
                        policy.name(),
                        policy.kind(),
                        policy.failure_policy(),
                        &policy.actions,
                        RuleType::Generation,
                        e,
                    ));
                    continue;
                }
            }
            let stopwatch = Stopwatch::start();
            let name = policy.name();
            let context = self.generate_context(name, &attributes);
            let evaluation = policy.evaluate(
                &attributes,
                namespace.as_ref(),
                context,
                &self.core.config.generation,
                &libraries,
            );
            let rule = match evaluation {
                Ok(Evaluation::NotMatched) => continue,
                Ok(Evaluation::Excepted(exceptions)) => {
                    RuleResponse::excepted(name, RuleType::Generation, exceptions)
                }
                Ok(Evaluation::Evaluated(outcome)) => {
                    let message = format!("generated {} resource(s)", outcome.generated.len());
                    RuleResponse::pass(name, RuleType::Generation, message)
                        .with_generated_resources(outcome.generated)
                }
                Err(e) => {
                    log::debug!("generating policy {} errored: {}", name, e);
                    RuleResponse::error(name, RuleType::Generation, e.to_string())
                }
            };
            response.policies.push(PolicyResponse::new(
                name,
                policy.kind(),
                policy.actions.clone(),
                rule.with_stats(stopwatch.stats()),
            ));
        }
        Ok(response)
    }

    /// Provenance for one trigger. A trigger without a uid is identified by
    /// name, namespace and kind alone, never by the request uid, so a retried
    /// admission finds what the first attempt generated.
    fn generate_context(&self, policy: &str, attributes: &Attributes) -> GenerateContext {
        let trigger_uid = attributes
            .object
            .as_ref()
            .or(attributes.old_object.as_ref())
            .map(object_meta)
            .unwrap_or_default()
            .uid;
        GenerateContext {
            policy_name: policy.to_string(),
            trigger_name: attributes.name.clone(),
            trigger_namespace: attributes.namespace.clone(),
            trigger_api_version: attributes.kind.api_version(),
            trigger_group: attributes.kind.group.clone(),
            trigger_kind: attributes.kind.kind.clone(),
            trigger_uid,
            restore_cache: self.restore_cache,
        }
    }
}
