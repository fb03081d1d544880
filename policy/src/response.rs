//! Engine responses: per-rule results grouped by policy, plus the
//! admission verdict and report summary derived from them.

use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use celgate_protocol::{PolicyException, ValidationAction};
use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Pass,
    Fail,
    Warn,
    Error,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RuleType {
    Validation,
    Mutation,
    Generation,
    ImageVerify,
}

/// When a rule ran and for how long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    /// Unix seconds at evaluation start.
    pub timestamp: u64,
    pub processing_time_us: u64,
}

impl ExecutionStats {
    pub fn since(started: Instant, started_at: SystemTime) -> Self {
        Self {
            timestamp: started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            processing_time_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        }
    }
}

/// Starts the clock for [`ExecutionStats`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Stopwatch {
    started: Instant,
    started_at: SystemTime,
}

impl Stopwatch {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    pub(crate) fn stats(&self) -> ExecutionStats {
        ExecutionStats::since(self.started, self.started_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub name: String,
    pub rule_type: RuleType,
    pub message: String,
    pub status: RuleStatus,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<PolicyException>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub generated_resources: Vec<Value>,
    pub stats: ExecutionStats,
}

impl RuleResponse {
    pub fn new(
        name: impl Into<String>,
        rule_type: RuleType,
        status: RuleStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            rule_type,
            message: message.into(),
            status,
            properties: BTreeMap::new(),
            exceptions: Vec::new(),
            generated_resources: Vec::new(),
            stats: ExecutionStats::default(),
        }
    }

    pub fn pass(name: impl Into<String>, rule_type: RuleType, message: impl Into<String>) -> Self {
        Self::new(name, rule_type, RuleStatus::Pass, message)
    }

    pub fn fail(name: impl Into<String>, rule_type: RuleType, message: impl Into<String>) -> Self {
        Self::new(name, rule_type, RuleStatus::Fail, message)
    }

    pub fn warn(name: impl Into<String>, rule_type: RuleType, message: impl Into<String>) -> Self {
        Self::new(name, rule_type, RuleStatus::Warn, message)
    }

    pub fn error(name: impl Into<String>, rule_type: RuleType, message: impl Into<String>) -> Self {
        Self::new(name, rule_type, RuleStatus::Error, message)
    }

    pub fn skip(name: impl Into<String>, rule_type: RuleType, message: impl Into<String>) -> Self {
        Self::new(name, rule_type, RuleStatus::Skip, message)
    }

    /// A skip caused by `exceptions`.
    pub fn excepted(name: impl Into<String>, rule_type: RuleType, exceptions: Vec<PolicyException>) -> Self {
        let keys: Vec<String> = exceptions.iter().map(|e| e.metadata.key()).collect();
        Self::skip(
            name,
            rule_type,
            format!("rule is skipped due to policy exception: {}", keys.join(", ")),
        )
        .with_exceptions(exceptions)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_exceptions(mut self, exceptions: Vec<PolicyException>) -> Self {
        self.exceptions = exceptions;
        self
    }

    pub fn with_generated_resources(mut self, resources: Vec<Value>) -> Self {
        self.generated_resources = resources;
        self
    }

    pub fn with_stats(mut self, stats: ExecutionStats) -> Self {
        self.stats = stats;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResponse {
    pub policy: String,
    pub kind: String,
    pub actions: Vec<ValidationAction>,
    pub rules: Vec<RuleResponse>,
}

impl PolicyResponse {
    pub fn new(policy: &str, kind: &str, actions: Vec<ValidationAction>, rule: RuleResponse) -> Self {
        Self {
            policy: policy.to_string(),
            kind: kind.to_string(),
            actions,
            rules: vec![rule],
        }
    }
}

/// Everything one engine call produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    pub resource: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patched_resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
    pub policies: Vec<PolicyResponse>,
}

/// The admission decision for a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResponseSummary {
    pub pass: usize,
    pub fail: usize,
    pub warn: usize,
    pub error: usize,
    pub skip: usize,
}

impl EngineResponse {
    pub fn new(resource: Value) -> Self {
        Self {
            resource,
            ..Default::default()
        }
    }

    pub fn policy(&self, name: &str) -> Option<&PolicyResponse> {
        self.policies.iter().find(|p| p.policy == name)
    }

    pub fn rules(&self) -> impl Iterator<Item = (&PolicyResponse, &RuleResponse)> {
        self.policies
            .iter()
            .flat_map(|p| p.rules.iter().map(move |r| (p, r)))
    }

    /// Fold the rule results into an allow/deny decision.
    ///
    /// Failures and errors block under `Deny`, become warnings under
    /// `Warn` and are only recorded under `Audit`.
    pub fn verdict(&self) -> Verdict {
        let mut denials = Vec::new();
        let mut warnings = Vec::new();
        for (policy, rule) in self.rules() {
            let text = format!("{}: {}", policy.policy, rule.message);
            match rule.status {
                RuleStatus::Fail | RuleStatus::Error => {
                    if policy.actions.contains(&ValidationAction::Deny) {
                        denials.push(text);
                    } else if policy.actions.contains(&ValidationAction::Warn) {
                        warnings.push(text);
                    } else {
                        log::info!("audit: {}", text);
                    }
                }
                RuleStatus::Warn => warnings.push(text),
                RuleStatus::Pass | RuleStatus::Skip => {}
            }
        }
        Verdict {
            allowed: denials.is_empty(),
            warnings,
            message: denials.join("; "),
        }
    }

    pub fn summary(&self) -> ResponseSummary {
        let mut summary = ResponseSummary::default();
        for (_, rule) in self.rules() {
            match rule.status {
                RuleStatus::Pass => summary.pass += 1,
                RuleStatus::Fail => summary.fail += 1,
                RuleStatus::Warn => summary.warn += 1,
                RuleStatus::Error => summary.error += 1,
                RuleStatus::Skip => summary.skip += 1,
            }
        }
        summary
    }
}
