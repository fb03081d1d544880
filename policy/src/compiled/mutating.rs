use celgate_protocol::{MutatingPolicySpec, Namespace};
use json_patch::Patch;
use serde_json::Value;

use super::{gate, CompiledPolicy, Evaluation, Gate};
use crate::cel::convert::{to_cel, to_json};
use crate::cel::libs::Libraries;
use crate::cel::{Bindings, CelExpression, Scope, VAR_OBJECT};
use crate::error::{EvalError, EvalResult};
use crate::matching::Attributes;
use crate::typeconv::TypeConverter;

pub type CompiledMutatingPolicy = CompiledPolicy<MutatingPolicySpec, MutatingBody>;

#[derive(Debug)]
pub enum CompiledMutation {
    /// Yields a list of RFC 6902 operations.
    JsonPatch(CelExpression),
    /// Yields a partial object merged into the target.
    ApplyConfiguration(CelExpression),
}

#[derive(Debug)]
pub struct MutatingBody {
    pub mutations: Vec<CompiledMutation>,
    pub mutate_existing: bool,
}

impl CompiledMutatingPolicy {
    /// Apply every mutation in order and return the patched object.
    ///
    /// Each mutation sees the output of the previous one as `object`.
    /// The first failing mutation aborts the rest.
    pub fn evaluate(
        &self,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
        converter: &TypeConverter,
        libraries: &Libraries,
    ) -> EvalResult<Evaluation<Value>> {
        let Some(object) = attributes.object.as_ref() else {
            return Err(EvalError::Prepare("mutation requires an object".to_string()));
        };
        let bindings = Bindings::kubernetes(attributes, namespace);
        let scope = Scope::new(&bindings, libraries, &self.programs.variables);
        match gate(&self.programs, &self.exceptions, &scope)? {
            Gate::Proceed => {}
            Gate::Skip => return Ok(Evaluation::NotMatched),
            Gate::Excepted(exceptions) => return Ok(Evaluation::Excepted(exceptions)),
        }

        let mut current = object.clone();
        for (i, mutation) in self.body.mutations.iter().enumerate() {
            let label = format!("mutations[{}]", i);
            let overrides = [(VAR_OBJECT, to_cel(&current))];
            current = match mutation {
                CompiledMutation::JsonPatch(program) => {
                    let result = scope.execute(&label, program, &overrides)?;
                    let operations = to_json(&result).map_err(|e| EvalError::execution(&label, e))?;
                    apply_json_patch(current, operations)
                        .map_err(|e| EvalError::Patch(format!("{}: {}", label, e)))?
                }
                CompiledMutation::ApplyConfiguration(program) => {
                    let result = scope.execute(&label, program, &overrides)?;
                    let partial = to_json(&result).map_err(|e| EvalError::execution(&label, e))?;
                    if !partial.is_object() {
                        return Err(EvalError::Patch(format!(
                            "{}: apply configuration must be an object",
                            label
                        )));
                    }
                    converter.apply(&current, &partial)
                }
            };
        }
        Ok(Evaluation::Evaluated(current))
    }
}

fn apply_json_patch(mut target: Value, operations: Value) -> Result<Value, String> {
    let patch: Patch = serde_json::from_value(operations).map_err(|e| e.to_string())?;
    json_patch::patch(&mut target, &patch.0).map_err(|e| e.to_string())?;
    Ok(target)
}
