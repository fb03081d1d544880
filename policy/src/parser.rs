//! Multi-document YAML loading for policy manifests.

use serde::Deserialize;
use serde_yaml::Value;

use celgate_protocol::{
    GeneratingPolicy, ImageValidatingPolicy, MutatingPolicy, PolicyException, ValidatingPolicy,
    KIND_GENERATING_POLICY, KIND_IMAGE_VALIDATING_POLICY, KIND_MUTATING_POLICY,
    KIND_POLICY_EXCEPTION, KIND_VALIDATING_POLICY,
};

use crate::error::{PolicyError, Result};

/// Documents of a manifest, grouped by kind in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicySet {
    pub validating: Vec<ValidatingPolicy>,
    pub mutating: Vec<MutatingPolicy>,
    pub generating: Vec<GeneratingPolicy>,
    pub image: Vec<ImageValidatingPolicy>,
    pub exceptions: Vec<PolicyException>,
}

impl PolicySet {
    pub fn len(&self) -> usize {
        self.validating.len()
            + self.mutating.len()
            + self.generating.len()
            + self.image.len()
            + self.exceptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse a `---` separated manifest.
///
/// Empty documents are skipped. Any kind other than the four policy kinds
/// and `PolicyException` is rejected.
pub fn parse_documents(yaml: &str) -> Result<PolicySet> {
    let mut set = PolicySet::default();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            KIND_VALIDATING_POLICY => set.validating.push(serde_yaml::from_value(value)?),
            KIND_MUTATING_POLICY => set.mutating.push(serde_yaml::from_value(value)?),
            KIND_GENERATING_POLICY => set.generating.push(serde_yaml::from_value(value)?),
            KIND_IMAGE_VALIDATING_POLICY => set.image.push(serde_yaml::from_value(value)?),
            KIND_POLICY_EXCEPTION => set.exceptions.push(serde_yaml::from_value(value)?),
            _ => return Err(PolicyError::UnsupportedKind(kind)),
        }
        log::trace!("parsed {} document", set.len());
    }
    Ok(set)
}
