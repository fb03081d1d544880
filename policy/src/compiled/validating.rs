use std::collections::BTreeMap;

use celgate_protocol::{EvaluationMode, Namespace, ValidatingPolicySpec};
use serde_json::Value;

use super::{failure_message, gate, CompiledPolicy, Evaluation, Gate, PolicyPrograms};
use crate::cel::libs::Libraries;
use crate::cel::convert::type_name;
use crate::cel::{Bindings, CelExpression, Scope};
use crate::error::{EvalError, EvalResult};
use crate::matching::{Attributes, MatchCriteria};

pub type CompiledValidatingPolicy = CompiledPolicy<ValidatingPolicySpec, ValidatingBody>;

#[derive(Debug)]
pub struct CompiledValidation {
    pub expression: CelExpression,
    pub message: String,
    pub message_expression: Option<CelExpression>,
    pub reason: String,
}

#[derive(Debug)]
pub struct CompiledAuditAnnotation {
    pub key: String,
    pub value: CelExpression,
}

/// A pod-controller variant derived from a Pod-level policy.
#[derive(Debug)]
pub struct AutogenVariant {
    pub variant: &'static str,
    pub criteria: MatchCriteria,
    pub programs: PolicyPrograms,
    pub validations: Vec<CompiledValidation>,
    pub audit_annotations: Vec<CompiledAuditAnnotation>,
}

#[derive(Debug)]
pub struct ValidatingBody {
    pub mode: EvaluationMode,
    pub validations: Vec<CompiledValidation>,
    pub audit_annotations: Vec<CompiledAuditAnnotation>,
    pub autogen: Vec<AutogenVariant>,
}

/// Result of running the assertions of a validating policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub allowed: bool,
    pub message: String,
    pub reason: String,
    pub audit_annotations: BTreeMap<String, String>,
}

impl CompiledValidatingPolicy {
    /// Evaluate against an admission request.
    ///
    /// `autogen` selects the derived variant the matcher matched, if any.
    pub fn evaluate(
        &self,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
        autogen: Option<usize>,
        libraries: &Libraries,
    ) -> EvalResult<Evaluation<ValidationOutcome>> {
        let bindings = Bindings::kubernetes(attributes, namespace);
        match autogen.and_then(|i| self.body.autogen.get(i)) {
            Some(variant) => self.run(
                &bindings,
                &variant.programs,
                &variant.validations,
                &variant.audit_annotations,
                libraries,
            ),
            None => self.run(
                &bindings,
                &self.programs,
                &self.body.validations,
                &self.body.audit_annotations,
                libraries,
            ),
        }
    }

    /// Evaluate against a bare JSON payload bound as `object`.
    pub fn evaluate_json(
        &self,
        payload: &Value,
        libraries: &Libraries,
    ) -> EvalResult<Evaluation<ValidationOutcome>> {
        self.run(
            &Bindings::json(payload),
            &self.programs,
            &self.body.validations,
            &self.body.audit_annotations,
            libraries,
        )
    }

    fn run(
        &self,
        bindings: &Bindings,
        programs: &PolicyPrograms,
        validations: &[CompiledValidation],
        audit_annotations: &[CompiledAuditAnnotation],
        libraries: &Libraries,
    ) -> EvalResult<Evaluation<ValidationOutcome>> {
        let scope = Scope::new(bindings, libraries, &programs.variables);
        match gate(programs, &self.exceptions, &scope)? {
            Gate::Proceed => {}
            Gate::Skip => return Ok(Evaluation::NotMatched),
            Gate::Excepted(exceptions) => return Ok(Evaluation::Excepted(exceptions)),
        }

        for (i, validation) in validations.iter().enumerate() {
            let label = format!("validations[{}]", i);
            if scope.execute_bool(&label, &validation.expression, &[])? {
                continue;
            }
            let message = failure_message(
                &scope,
                &format!("{}.messageExpression", label),
                &validation.message,
                validation.message_expression.as_ref(),
                &validation.expression,
                &[],
            )?;
            return Ok(Evaluation::Evaluated(ValidationOutcome {
                allowed: false,
                message,
                reason: validation.reason.clone(),
                audit_annotations: evaluate_audit_annotations(&scope, audit_annotations)?,
            }));
        }

        Ok(Evaluation::Evaluated(ValidationOutcome {
            allowed: true,
            ..Default::default()
        }))
    }
}

fn evaluate_audit_annotations(
    scope: &Scope<'_>,
    annotations: &[CompiledAuditAnnotation],
) -> EvalResult<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for annotation in annotations {
        let label = format!("auditAnnotations[{}]", annotation.key);
        match scope.execute(&label, &annotation.value, &[])? {
            cel_interpreter::Value::Null => {}
            cel_interpreter::Value::String(s) if s.is_empty() => {}
            cel_interpreter::Value::String(s) => {
                values.insert(annotation.key.clone(), s.as_str().to_string());
            }
            other => {
                return Err(EvalError::UnexpectedType {
                    context: label,
                    expected: "string",
                    got: type_name(&other).to_string(),
                })
            }
        }
    }
    Ok(values)
}
