use std::sync::{Arc, Mutex};

use celgate_protocol::{GeneratingPolicySpec, Namespace};
use serde_json::Value;

use super::{gate, CompiledPolicy, Evaluation, Gate};
use crate::cel::libs::{GenerateContext, Libraries};
use crate::cel::{Bindings, CelExpression, Scope};
use crate::config::GenerationLabels;
use crate::error::{EvalError, EvalResult};
use crate::matching::Attributes;

pub type CompiledGeneratingPolicy = CompiledPolicy<GeneratingPolicySpec, GeneratingBody>;

#[derive(Debug)]
pub struct GeneratingBody {
    pub generations: Vec<CelExpression>,
    pub synchronize: bool,
}

/// Resources created (or reported existing) by one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutcome {
    pub generated: Vec<Value>,
}

impl CompiledGeneratingPolicy {
    /// Run the generate expressions for one trigger.
    ///
    /// Each expression is expected to call `generate`, which creates the
    /// downstream resources unless they already exist for this trigger.
    /// An error stops the remaining expressions.
    pub fn evaluate(
        &self,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
        context: GenerateContext,
        labels: &GenerationLabels,
        libraries: &Libraries,
    ) -> EvalResult<Evaluation<GenerationOutcome>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let libraries = libraries
            .clone()
            .with_generation(context, labels.clone(), sink.clone());
        let bindings = Bindings::kubernetes(attributes, namespace);
        let scope = Scope::new(&bindings, &libraries, &self.programs.variables);
        match gate(&self.programs, &self.exceptions, &scope)? {
            Gate::Proceed => {}
            Gate::Skip => return Ok(Evaluation::NotMatched),
            Gate::Excepted(exceptions) => return Ok(Evaluation::Excepted(exceptions)),
        }

        for (i, program) in self.body.generations.iter().enumerate() {
            let label = format!("generate[{}]", i);
            match scope.execute(&label, program, &[]) {
                Ok(_) => {}
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => return Err(EvalError::Generation(e.to_string())),
            }
        }

        let generated = sink
            .lock()
            .map(|g| g.clone())
            .map_err(|_| EvalError::Generation("generated resource list poisoned".to_string()))?;
        Ok(Evaluation::Evaluated(GenerationOutcome { generated }))
    }
}
