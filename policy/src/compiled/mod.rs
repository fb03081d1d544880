//! Compiled policies and the evaluation state machine they share.
//!
//! Every kind runs the same sequence against one request:
//! match conditions, then exceptions, then the kind-specific body.
//! Variables are resolved lazily by the [`Scope`] the sequence runs in.

pub mod generating;
pub mod image;
pub mod mutating;
pub mod validating;

use celgate_protocol::{
    FailurePolicy, PolicyDocument, PolicyException, PolicySpec, ValidationAction,
};

use crate::cel::{CelExpression, NamedProgram, Scope};
use crate::error::{EvalError, EvalResult};
use crate::matching::MatchCriteria;

pub use generating::{CompiledGeneratingPolicy, GeneratingBody, GenerationOutcome};
pub use image::{CompiledImagePolicy, ImageBody, ImageMatcher, ImageOutcome};
pub use mutating::{CompiledMutatingPolicy, CompiledMutation, MutatingBody};
pub use validating::{
    AutogenVariant, CompiledAuditAnnotation, CompiledValidatingPolicy, CompiledValidation,
    ValidatingBody, ValidationOutcome,
};

/// Programs shared by every kind: the gate and the lazy variables.
#[derive(Debug)]
pub struct PolicyPrograms {
    pub failure_policy: FailurePolicy,
    pub match_conditions: Vec<NamedProgram>,
    pub variables: Vec<NamedProgram>,
}

/// An exception with its own compiled conditions.
#[derive(Debug)]
pub struct CompiledException {
    pub exception: PolicyException,
    pub conditions: Vec<NamedProgram>,
}

/// An immutable compiled policy of any kind.
///
/// Built once per policy and exception-set generation. A change produces
/// a new value; nothing here is mutated after compilation.
#[derive(Debug)]
pub struct CompiledPolicy<P, B> {
    pub policy: PolicyDocument<P>,
    pub criteria: MatchCriteria,
    pub actions: Vec<ValidationAction>,
    pub programs: PolicyPrograms,
    pub exceptions: Vec<CompiledException>,
    pub body: B,
}

impl<P: PolicySpec, B> CompiledPolicy<P, B> {
    pub fn name(&self) -> &str {
        self.policy.name()
    }

    pub fn kind(&self) -> &'static str {
        P::KIND
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.programs.failure_policy
    }
}

/// Lookup by name, used by providers.
pub trait NamedPolicy {
    fn policy_name(&self) -> &str;
}

impl<P: PolicySpec, B> NamedPolicy for CompiledPolicy<P, B> {
    fn policy_name(&self) -> &str {
        self.name()
    }
}

/// What a policy made of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation<T> {
    /// A match condition was false (or errored under `Ignore`), or the
    /// body found nothing to act on.
    NotMatched,
    /// Every condition of these exceptions held.
    Excepted(Vec<PolicyException>),
    Evaluated(T),
}

impl<T> Evaluation<T> {
    pub fn evaluated(&self) -> Option<&T> {
        match self {
            Evaluation::Evaluated(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_matched(&self) -> bool {
        !matches!(self, Evaluation::NotMatched)
    }
}

/// Result of running match conditions and exceptions.
#[derive(Debug)]
pub(crate) enum Gate {
    Proceed,
    Skip,
    Excepted(Vec<PolicyException>),
}

/// Run match conditions then exception conditions.
///
/// A false condition skips even when another condition errored. Errors
/// without a false condition follow the failure policy. Exception
/// condition errors are always returned.
pub(crate) fn gate(
    programs: &PolicyPrograms,
    exceptions: &[CompiledException],
    scope: &Scope<'_>,
) -> EvalResult<Gate> {
    let mut failed: Option<EvalError> = None;
    for condition in &programs.match_conditions {
        let label = format!("matchConditions[{}]", condition.name);
        match scope.execute_bool(&label, &condition.expression, &[]) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("match condition {} is false", condition.name);
                return Ok(Gate::Skip);
            }
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                failed.get_or_insert(EvalError::MatchCondition {
                    name: condition.name.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
    if let Some(error) = failed {
        match programs.failure_policy {
            FailurePolicy::Fail => return Err(error),
            FailurePolicy::Ignore => {
                log::debug!("ignoring match condition error: {}", error);
                return Ok(Gate::Skip);
            }
        }
    }

    let mut applied = Vec::new();
    'exceptions: for compiled in exceptions {
        for condition in &compiled.conditions {
            let label = format!(
                "exception {} matchConditions[{}]",
                compiled.exception.name(),
                condition.name
            );
            match scope.execute_bool(&label, &condition.expression, &[]) {
                Ok(true) => {}
                Ok(false) => continue 'exceptions,
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    return Err(EvalError::ExceptionCondition {
                        exception: compiled.exception.name().to_string(),
                        condition: condition.name.clone(),
                        message: e.to_string(),
                    })
                }
            }
        }
        applied.push(compiled.exception.clone());
    }
    if applied.is_empty() {
        Ok(Gate::Proceed)
    } else {
        Ok(Gate::Excepted(applied))
    }
}

/// Message for a failed assertion: the message expression when it yields
/// text, else the static message, else the assertion source.
pub(crate) fn failure_message(
    scope: &Scope<'_>,
    label: &str,
    message: &str,
    message_expression: Option<&CelExpression>,
    expression: &CelExpression,
    overrides: &[(&str, cel_interpreter::Value)],
) -> EvalResult<String> {
    if let Some(program) = message_expression {
        match scope.execute_string(label, program, overrides) {
            Ok(text) if !text.trim().is_empty() => return Ok(text),
            Ok(_) => {}
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => return Ok(format!("failed to evaluate message expression: {}", e)),
        }
    }
    if !message.is_empty() {
        return Ok(message.to_string());
    }
    Ok(format!("failed expression: {}", expression.source()))
}
