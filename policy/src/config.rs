//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::autogen::{default_controllers, lookup_controller};
use crate::cel::libs::GenerateContext;
use crate::error::ConfigError;

pub const DEFAULT_OUTCOMES_ANNOTATION: &str = "celgate.io/image-verification-outcomes";

/// Settings shared by compilers and engines.
///
/// ```
/// use celgate_policy::EngineConfig;
///
/// let config = EngineConfig::from_yaml(r#"
/// forceFailurePolicyIgnore: true
/// autogenControllers: [deployments]
/// evaluationTimeoutMs: 250
/// "#).unwrap();
/// assert!(config.force_failure_policy_ignore);
/// assert_eq!(config.timeout().unwrap().as_millis(), 250);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Treat every policy as `failurePolicy: Ignore`.
    pub force_failure_policy_ignore: bool,
    /// Controllers autogen derives rules for, unless a policy lists its own.
    pub autogen_controllers: Vec<String>,
    /// Annotation carrying image verification outcomes between phases.
    pub image_verification_outcomes_annotation: String,
    /// Deadline applied to a request that carries none.
    pub evaluation_timeout_ms: Option<u64>,
    pub generation: GenerationLabels,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            force_failure_policy_ignore: false,
            autogen_controllers: default_controllers(),
            image_verification_outcomes_annotation: DEFAULT_OUTCOMES_ANNOTATION.to_string(),
            evaluation_timeout_ms: None,
            generation: GenerationLabels::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(unknown) = self
            .autogen_controllers
            .iter()
            .find(|c| lookup_controller(c).is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "unknown autogen controller {:?}",
                unknown
            )));
        }
        if self.image_verification_outcomes_annotation.is_empty() {
            return Err(ConfigError::Invalid(
                "imageVerificationOutcomesAnnotation must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.evaluation_timeout_ms.map(Duration::from_millis)
    }
}

/// Provenance label keys stamped on generated resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationLabels {
    pub policy_label: String,
    pub trigger_uid_label: String,
    pub trigger_name_label: String,
    pub trigger_namespace_label: String,
    pub trigger_kind_label: String,
}

impl Default for GenerationLabels {
    fn default() -> Self {
        Self {
            policy_label: "generate.celgate.io/policy-name".to_string(),
            trigger_uid_label: "generate.celgate.io/trigger-uid".to_string(),
            trigger_name_label: "generate.celgate.io/trigger-name".to_string(),
            trigger_namespace_label: "generate.celgate.io/trigger-namespace".to_string(),
            trigger_kind_label: "generate.celgate.io/trigger-kind".to_string(),
        }
    }
}

impl GenerationLabels {
    /// Provenance labels for a resource generated under `ctx`.
    ///
    /// A trigger without a uid gets no uid label; its name, namespace and
    /// kind identify it instead.
    pub fn provenance(&self, ctx: &GenerateContext) -> Vec<(String, String)> {
        let mut labels = vec![(self.policy_label.clone(), ctx.policy_name.clone())];
        if !ctx.trigger_uid.is_empty() {
            labels.push((self.trigger_uid_label.clone(), ctx.trigger_uid.clone()));
        }
        labels.extend([
            (self.trigger_name_label.clone(), ctx.trigger_name.clone()),
            (self.trigger_namespace_label.clone(), ctx.trigger_namespace.clone()),
            (self.trigger_kind_label.clone(), ctx.trigger_kind.clone()),
        ]);
        labels
    }

    /// True if `resource` carries the provenance of `ctx`'s policy and trigger.
    pub fn is_owned_by(&self, resource: &serde_json::Value, ctx: &GenerateContext) -> bool {
        let labels = &resource["metadata"]["labels"];
        let label = |key: &str| labels[key].as_str().unwrap_or_default();
        label(&self.policy_label) == ctx.policy_name
            && label(&self.trigger_uid_label) == ctx.trigger_uid
            && label(&self.trigger_name_label) == ctx.trigger_name
            && label(&self.trigger_namespace_label) == ctx.trigger_namespace
            && label(&self.trigger_kind_label) == ctx.trigger_kind
    }
}
