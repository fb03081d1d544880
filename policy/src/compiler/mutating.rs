use celgate_protocol::{
    MutatingPolicy, MutatingPolicySpec, PatchType, PolicyException, PolicySpec, ValidationAction,
};

use super::{Compiler, CompilerOptions, ExpressionCompiler};
use crate::compiled::{CompiledMutatingPolicy, CompiledMutation, CompiledPolicy, MutatingBody};
use crate::error::{CompileErrors, FieldError};
use crate::matching::MatchCriteria;

#[derive(Debug, Clone, Default)]
pub struct MutatingCompiler {
    options: CompilerOptions,
}

impl MutatingCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }
}

impl Compiler for MutatingCompiler {
    type Spec = MutatingPolicySpec;
    type Output = CompiledMutatingPolicy;

    fn compile(
        &self,
        policy: &MutatingPolicy,
        exceptions: &[PolicyException],
    ) -> Result<CompiledMutatingPolicy, CompileErrors> {
        let spec = &policy.spec;
        let mut compiler = ExpressionCompiler::new(false);
        compiler.require_name(policy);

        let programs = compiler.programs(spec, &self.options);
        if spec.mutations.is_empty() {
            compiler.error(FieldError::required(
                "spec.mutations",
                "at least one mutation is required",
            ));
        }
        let mut mutations = Vec::with_capacity(spec.mutations.len());
        for (i, mutation) in spec.mutations.iter().enumerate() {
            let (field, source) = match mutation.patch_type {
                PatchType::JsonPatch => ("jsonPatch", mutation.json_patch.as_ref()),
                PatchType::ApplyConfiguration => {
                    ("applyConfiguration", mutation.apply_configuration.as_ref())
                }
            };
            let path = format!("spec.mutations[{}].{}", i, field);
            let Some(source) = source else {
                compiler.error(FieldError::required(
                    &path,
                    format!("{} is required for patch type {:?}", field, mutation.patch_type),
                ));
                continue;
            };
            if let Some(program) = compiler.expression(&format!("{}.expression", path), &source.expression) {
                mutations.push(match mutation.patch_type {
                    PatchType::JsonPatch => CompiledMutation::JsonPatch(program),
                    PatchType::ApplyConfiguration => CompiledMutation::ApplyConfiguration(program),
                });
            }
        }
        let exceptions = compiler.exceptions(policy.name(), MutatingPolicySpec::KIND, exceptions);

        compiler.finish(CompiledPolicy {
            policy: policy.clone(),
            criteria: MatchCriteria::new(spec.match_constraints.as_ref()),
            actions: vec![ValidationAction::Deny],
            programs,
            exceptions,
            body: MutatingBody {
                mutations,
                mutate_existing: spec.mutate_existing(),
            },
        })
    }
}
