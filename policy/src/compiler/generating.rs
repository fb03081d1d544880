use celgate_protocol::{
    GeneratingPolicy, GeneratingPolicySpec, PolicyException, PolicySpec, ValidationAction,
};

use super::{Compiler, CompilerOptions, ExpressionCompiler};
use crate::cel::libs::LibrarySet;
use crate::compiled::{CompiledGeneratingPolicy, CompiledPolicy, GeneratingBody};
use crate::error::{CompileErrors, FieldError};
use crate::matching::MatchCriteria;

#[derive(Debug, Clone, Default)]
pub struct GeneratingCompiler {
    options: CompilerOptions,
}

impl GeneratingCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }
}

impl Compiler for GeneratingCompiler {
    type Spec = GeneratingPolicySpec;
    type Output = CompiledGeneratingPolicy;

    fn compile(
        &self,
        policy: &GeneratingPolicy,
        exceptions: &[PolicyException],
    ) -> Result<CompiledGeneratingPolicy, CompileErrors> {
        let spec = &policy.spec;
        let mut compiler =
            ExpressionCompiler::new(false).with_environment(LibrarySet::Generation, &[]);
        compiler.require_name(policy);

        let programs = compiler.programs(spec, &self.options);
        if spec.generate.is_empty() {
            compiler.error(FieldError::required(
                "spec.generate",
                "at least one generate expression is required",
            ));
        }
        let generations = spec
            .generate
            .iter()
            .enumerate()
            .filter_map(|(i, g)| {
                compiler.expression(&format!("spec.generate[{}].expression", i), &g.expression)
            })
            .collect();
        let exceptions =
            compiler.exceptions(policy.name(), GeneratingPolicySpec::KIND, exceptions);

        compiler.finish(CompiledPolicy {
            policy: policy.clone(),
            criteria: MatchCriteria::new(spec.match_constraints.as_ref()),
            actions: vec![ValidationAction::Deny],
            programs,
            exceptions,
            body: GeneratingBody {
                generations,
                synchronize: spec.synchronize(),
            },
        })
    }
}
