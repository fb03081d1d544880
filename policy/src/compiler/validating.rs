use celgate_protocol::{
    EvaluationMode, PolicyException, PolicySpec, ValidatingPolicy, ValidatingPolicySpec,
};

use super::{failure_policy, Compiler, CompilerOptions, ExpressionCompiler};
use crate::autogen::compute_rules;
use crate::compiled::{AutogenVariant, CompiledPolicy, CompiledValidatingPolicy, ValidatingBody};
use crate::error::{CompileErrors, FieldError};
use crate::matching::MatchCriteria;

#[derive(Debug, Clone, Default)]
pub struct ValidatingCompiler {
    options: CompilerOptions,
}

impl ValidatingCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }
}

impl Compiler for ValidatingCompiler {
    type Spec = ValidatingPolicySpec;
    type Output = CompiledValidatingPolicy;

    fn compile(
        &self,
        policy: &ValidatingPolicy,
        exceptions: &[PolicyException],
    ) -> Result<CompiledValidatingPolicy, CompileErrors> {
        let spec = &policy.spec;
        let mode = spec.evaluation_mode();
        let mut compiler = ExpressionCompiler::new(mode == EvaluationMode::Json);
        compiler.require_name(policy);

        let programs = compiler.programs(spec, &self.options);
        if spec.validations.is_empty() && spec.audit_annotations.is_empty() {
            compiler.error(FieldError::required(
                "spec.validations",
                "at least one validation or audit annotation is required",
            ));
        }
        let validations = compiler.validations("spec.validations", &spec.validations);
        let audit_annotations =
            compiler.audit_annotations("spec.auditAnnotations", &spec.audit_annotations);
        let exceptions = compiler.exceptions(policy.name(), ValidatingPolicySpec::KIND, exceptions);

        // Derived variants rewrite already-validated expressions; report
        // their problems only when the authored policy itself is clean.
        let mut autogen = Vec::new();
        if compiler.errors().is_empty() {
            for rule in compute_rules(spec, &self.options.autogen_controllers) {
                let mut derived = ExpressionCompiler::new(false);
                let path = format!("autogen[{}]", rule.variant);
                let programs = derived.programs_from(
                    &path,
                    &rule.match_conditions,
                    &rule.variables,
                    failure_policy(spec.failure_policy(), &self.options),
                );
                let validations =
                    derived.validations(&format!("{}.validations", path), &rule.validations);
                let audit_annotations = derived
                    .audit_annotations(&format!("{}.auditAnnotations", path), &rule.audit_annotations);
                for error in derived.errors().iter() {
                    compiler.error(error.clone());
                }
                autogen.push(AutogenVariant {
                    variant: rule.variant,
                    criteria: MatchCriteria::new(Some(&rule.match_constraints)),
                    programs,
                    validations,
                    audit_annotations,
                });
            }
        }

        compiler.finish(CompiledPolicy {
            policy: policy.clone(),
            criteria: MatchCriteria::new(spec.match_constraints.as_ref()),
            actions: spec.validation_actions(),
            programs,
            exceptions,
            body: ValidatingBody {
                mode,
                validations,
                audit_annotations,
                autogen,
            },
        })
    }
}
