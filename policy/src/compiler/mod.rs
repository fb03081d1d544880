//! Policy compilers: raw documents in, immutable compiled policies out.
//!
//! A compiler never stops at the first problem. Every expression is
//! compiled and every failure is recorded against the field it came from,
//! so a policy either compiles completely or reports all of its errors.

pub mod generating;
pub mod image;
pub mod mutating;
pub mod validating;

use std::collections::HashSet;

use celgate_protocol::{
    AuditAnnotation, FailurePolicy, MatchCondition, PolicyDocument, PolicyException, PolicySpec,
    Validation, Variable,
};
use crate::autogen::default_controllers;
use crate::cel::libs::LibrarySet;
use crate::cel::{
    CelExpression, NamedProgram, BUILTIN_FUNCTIONS, VAR_NAMESPACE_OBJECT, VAR_OBJECT,
    VAR_OLD_OBJECT, VAR_REQUEST,
};
use crate::compiled::{
    CompiledAuditAnnotation, CompiledException, CompiledValidation, PolicyPrograms,
};
use crate::config::EngineConfig;
use crate::error::{CompileErrors, FieldError};

pub use generating::GeneratingCompiler;
pub use image::ImageCompiler;
pub use mutating::MutatingCompiler;
pub use validating::ValidatingCompiler;

/// Compiles one policy kind together with the exceptions that name it.
pub trait Compiler {
    type Spec: PolicySpec + Clone;
    type Output;

    fn compile(
        &self,
        policy: &PolicyDocument<Self::Spec>,
        exceptions: &[PolicyException],
    ) -> Result<Self::Output, CompileErrors>;
}

/// Settings every compiler receives at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerOptions {
    /// Compile every policy as `failurePolicy: Ignore`.
    pub force_failure_policy_ignore: bool,
    pub autogen_controllers: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            force_failure_policy_ignore: false,
            autogen_controllers: default_controllers(),
        }
    }
}

impl From<&EngineConfig> for CompilerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            force_failure_policy_ignore: config.force_failure_policy_ignore,
            autogen_controllers: config.autogen_controllers.clone(),
        }
    }
}

/// Accumulates compiled programs and field errors for one policy.
pub(crate) struct ExpressionCompiler {
    /// Variables visible to non-variable programs.
    declared: Vec<String>,
    /// Payload policies only see `object`.
    json_mode: bool,
    /// Top-level identifiers bound at evaluation time.
    roots: Vec<&'static str>,
    libraries: LibrarySet,
    errors: CompileErrors,
}

const ADMISSION_ROOTS: &[&str] = &[VAR_OBJECT, VAR_OLD_OBJECT, VAR_REQUEST, VAR_NAMESPACE_OBJECT];

impl ExpressionCompiler {
    pub(crate) fn new(json_mode: bool) -> Self {
        let roots = if json_mode {
            vec![VAR_OBJECT]
        } else {
            ADMISSION_ROOTS.to_vec()
        };
        Self {
            declared: Vec::new(),
            json_mode,
            roots,
            libraries: LibrarySet::Base,
            errors: CompileErrors::default(),
        }
    }

    /// Declare extra bindings and the function library of a policy kind.
    pub(crate) fn with_environment(mut self, libraries: LibrarySet, roots: &[&'static str]) -> Self {
        self.libraries = libraries;
        self.roots.extend_from_slice(roots);
        self
    }

    pub(crate) fn error(&mut self, error: FieldError) {
        self.errors.push(error);
    }

    pub(crate) fn finish<T>(self, value: T) -> Result<T, CompileErrors> {
        self.errors.into_result(value)
    }

    pub(crate) fn errors(&self) -> &CompileErrors {
        &self.errors
    }

    pub(crate) fn require_name<S>(&mut self, policy: &PolicyDocument<S>) {
        if policy.name().is_empty() {
            self.error(FieldError::required("metadata.name", "policy name is required"));
        }
    }

    /// Compile a required expression visible to every declared variable.
    pub(crate) fn expression(&mut self, path: &str, source: &str) -> Option<CelExpression> {
        let visible = self.declared.clone();
        self.compile_checked(path, source, &visible)
    }

    /// Compile an optional expression; empty means absent.
    pub(crate) fn optional_expression(&mut self, path: &str, source: &str) -> Option<CelExpression> {
        if source.trim().is_empty() {
            return None;
        }
        self.expression(path, source)
    }

    fn compile_checked(
        &mut self,
        path: &str,
        source: &str,
        visible: &[String],
    ) -> Option<CelExpression> {
        if source.trim().is_empty() {
            self.error(FieldError::required(path, "expression is required"));
            return None;
        }
        let compiled = match CelExpression::compile(source) {
            Ok(compiled) => compiled,
            Err(e) => {
                self.error(FieldError::invalid(path, source, format!("compilation failed: {}", e)));
                return None;
            }
        };
        let mut ok = true;
        for root in compiled.identifiers() {
            if self.roots.contains(&root.as_str()) {
                continue;
            }
            let detail = if self.json_mode && ADMISSION_ROOTS.contains(&root.as_str()) {
                format!("undeclared reference to \"{}\" in JSON evaluation mode", root)
            } else {
                format!("undeclared reference to \"{}\"", root)
            };
            self.error(FieldError::invalid(path, source, detail));
            ok = false;
        }
        for function in compiled.functions() {
            let name = function.as_str();
            if BUILTIN_FUNCTIONS.contains(&name) || self.libraries.functions().any(|f| f == name) {
                continue;
            }
            self.error(FieldError::invalid(
                path,
                source,
                format!("undeclared reference to function \"{}\"", name),
            ));
            ok = false;
        }
        for name in compiled.variable_refs() {
            if visible.iter().any(|v| v == name) {
                continue;
            }
            let detail = if self.declared.iter().any(|v| v == name) {
                format!("variable \"{}\" is referenced before its declaration", name)
            } else {
                format!("undeclared variable \"{}\"", name)
            };
            self.error(FieldError::invalid(path, source, detail));
            ok = false;
        }
        ok.then_some(compiled)
    }

    /// Compile the gate and variables of `spec`.
    pub(crate) fn programs<S: PolicySpec>(
        &mut self,
        spec: &S,
        options: &CompilerOptions,
    ) -> PolicyPrograms {
        self.programs_from(
            "spec",
            spec.match_conditions(),
            spec.variables(),
            failure_policy(spec.failure_policy(), options),
        )
    }

    pub(crate) fn programs_from(
        &mut self,
        path: &str,
        conditions: &[MatchCondition],
        variables: &[Variable],
        failure_policy: FailurePolicy,
    ) -> PolicyPrograms {
        self.declared = variables
            .iter()
            .filter(|v| !v.name.is_empty())
            .map(|v| v.name.clone())
            .collect();
        let match_conditions =
            self.match_conditions(&format!("{}.matchConditions", path), conditions);
        let variables = self.variables(&format!("{}.variables", path), variables);
        PolicyPrograms {
            failure_policy,
            match_conditions,
            variables,
        }
    }

    pub(crate) fn match_conditions(
        &mut self,
        path: &str,
        conditions: &[MatchCondition],
    ) -> Vec<NamedProgram> {
        let mut seen = HashSet::new();
        let mut programs = Vec::with_capacity(conditions.len());
        for (i, condition) in conditions.iter().enumerate() {
            let item = format!("{}[{}]", path, i);
            if condition.name.is_empty() {
                self.error(FieldError::required(format!("{}.name", item), "name is required"));
            } else if !seen.insert(condition.name.as_str()) {
                self.error(FieldError::invalid(
                    format!("{}.name", item),
                    &condition.name,
                    "duplicate match condition name",
                ));
            }
            if let Some(expression) =
                self.expression(&format!("{}.expression", item), &condition.expression)
            {
                programs.push(NamedProgram {
                    name: condition.name.clone(),
                    expression,
                });
            }
        }
        programs
    }

    /// Variables in declaration order; each sees only earlier ones.
    pub(crate) fn variables(&mut self, path: &str, variables: &[Variable]) -> Vec<NamedProgram> {
        let mut earlier: Vec<String> = Vec::new();
        let mut programs = Vec::with_capacity(variables.len());
        for (i, variable) in variables.iter().enumerate() {
            let item = format!("{}[{}]", path, i);
            if variable.name.is_empty() {
                self.error(FieldError::required(format!("{}.name", item), "name is required"));
            } else if earlier.contains(&variable.name) {
                self.error(FieldError::invalid(
                    format!("{}.name", item),
                    &variable.name,
                    "duplicate variable name",
                ));
            }
            let compiled =
                self.compile_checked(&format!("{}.expression", item), &variable.expression, &earlier);
            if !variable.name.is_empty() {
                earlier.push(variable.name.clone());
            }
            if let Some(expression) = compiled {
                programs.push(NamedProgram {
                    name: variable.name.clone(),
                    expression,
                });
            }
        }
        programs
    }

    pub(crate) fn validations(
        &mut self,
        path: &str,
        validations: &[Validation],
    ) -> Vec<CompiledValidation> {
        let mut compiled = Vec::with_capacity(validations.len());
        for (i, validation) in validations.iter().enumerate() {
            let item = format!("{}[{}]", path, i);
            let expression = self.expression(&format!("{}.expression", item), &validation.expression);
            let message_expression = self.optional_expression(
                &format!("{}.messageExpression", item),
                &validation.message_expression,
            );
            if let Some(expression) = expression {
                compiled.push(CompiledValidation {
                    expression,
                    message: validation.message.clone(),
                    message_expression,
                    reason: validation.reason.clone(),
                });
            }
        }
        compiled
    }

    pub(crate) fn audit_annotations(
        &mut self,
        path: &str,
        annotations: &[AuditAnnotation],
    ) -> Vec<CompiledAuditAnnotation> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(annotations.len());
        for (i, annotation) in annotations.iter().enumerate() {
            let item = format!("{}[{}]", path, i);
            if annotation.key.is_empty() {
                self.error(FieldError::required(format!("{}.key", item), "key is required"));
            } else if !seen.insert(annotation.key.as_str()) {
                self.error(FieldError::invalid(
                    format!("{}.key", item),
                    &annotation.key,
                    "duplicate audit annotation key",
                ));
            }
            if let Some(value) =
                self.expression(&format!("{}.valueExpression", item), &annotation.value_expression)
            {
                compiled.push(CompiledAuditAnnotation {
                    key: annotation.key.clone(),
                    value,
                });
            }
        }
        compiled
    }

    /// Compile the conditions of the exceptions that name this policy.
    pub(crate) fn exceptions(
        &mut self,
        policy: &str,
        kind: &str,
        exceptions: &[PolicyException],
    ) -> Vec<CompiledException> {
        exceptions
            .iter()
            .filter(|e| e.applies_to(policy, kind))
            .map(|exception| {
                let path = format!("exceptions[{}].spec.matchConditions", exception.name());
                CompiledException {
                    conditions: self.match_conditions(&path, &exception.spec.match_conditions),
                    exception: exception.clone(),
                }
            })
            .collect()
    }
}

pub(crate) fn failure_policy(declared: FailurePolicy, options: &CompilerOptions) -> FailurePolicy {
    if options.force_failure_policy_ignore {
        FailurePolicy::Ignore
    } else {
        declared
    }
}
