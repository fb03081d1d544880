//! Label selector parsing and evaluation.

use std::collections::BTreeMap;

use celgate_protocol::{LabelSelector, LabelSelectorOperator};

use crate::error::SelectorError;

const MAX_NAME_LENGTH: usize = 63;
const MAX_PREFIX_LENGTH: usize = 253;

/// A validated label selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Matches every label set.
    Everything,
    /// All requirements must hold.
    Requirements(Vec<Requirement>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    pub values: Vec<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            LabelSelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            LabelSelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            LabelSelectorOperator::Exists => value.is_some(),
            LabelSelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl Selector {
    /// Validate `selector`. `None` and an empty selector both match everything.
    pub fn parse(selector: Option<&LabelSelector>) -> Result<Self, SelectorError> {
        let Some(selector) = selector else {
            return Ok(Selector::Everything);
        };
        if selector.is_empty() {
            return Ok(Selector::Everything);
        }

        let mut requirements = Vec::with_capacity(
            selector.match_labels.len() + selector.match_expressions.len(),
        );
        for (key, value) in &selector.match_labels {
            validate_key(key)?;
            validate_value(value)?;
            requirements.push(Requirement {
                key: key.clone(),
                operator: LabelSelectorOperator::In,
                values: vec![value.clone()],
            });
        }
        for expr in &selector.match_expressions {
            validate_key(&expr.key)?;
            let operator = format!("{:?}", expr.operator);
            match expr.operator {
                LabelSelectorOperator::In | LabelSelectorOperator::NotIn => {
                    if expr.values.is_empty() {
                        return Err(SelectorError::MissingValues {
                            key: expr.key.clone(),
                            operator,
                        });
                    }
                }
                LabelSelectorOperator::Exists | LabelSelectorOperator::DoesNotExist => {
                    if !expr.values.is_empty() {
                        return Err(SelectorError::UnexpectedValues {
                            key: expr.key.clone(),
                            operator,
                        });
                    }
                }
            }
            for value in &expr.values {
                validate_value(value)?;
            }
            requirements.push(Requirement {
                key: expr.key.clone(),
                operator: expr.operator,
                values: expr.values.clone(),
            });
        }
        Ok(Selector::Requirements(requirements))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Selector::Everything => true,
            Selector::Requirements(reqs) => reqs.iter().all(|r| r.matches(labels)),
        }
    }

    pub fn is_everything(&self) -> bool {
        matches!(self, Selector::Everything)
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason: &str| SelectorError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || prefix.len() > MAX_PREFIX_LENGTH {
                return Err(invalid("prefix part must be a non-empty DNS subdomain"));
            }
            if !is_dns_subdomain(prefix) {
                return Err(invalid("prefix part must be a lowercase RFC 1123 subdomain"));
            }
            name
        }
        None => key,
    };
    if name.is_empty() {
        return Err(invalid("name part must be non-empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(invalid("name part must be no more than 63 characters"));
    }
    if !is_qualified_token(name) {
        return Err(invalid(
            "name part must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), SelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(SelectorError::InvalidValue {
            value: value.to_string(),
            reason: "must be no more than 63 characters".to_string(),
        });
    }
    if !is_qualified_token(value) {
        return Err(SelectorError::InvalidValue {
            value: value.to_string(),
            reason: "a valid label must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character".to_string(),
        });
    }
    Ok(())
}

fn is_qualified_token(s: &str) -> bool {
    let bytes = s.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn is_dns_subdomain(s: &str) -> bool {
    s.split('.').all(|label| {
        let bytes = label.as_bytes();
        match (bytes.first(), bytes.last()) {
            (Some(first), Some(last)) => {
                (first.is_ascii_lowercase() || first.is_ascii_digit())
                    && (last.is_ascii_lowercase() || last.is_ascii_digit())
                    && bytes
                        .iter()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
            }
            _ => false,
        }
    })
}
