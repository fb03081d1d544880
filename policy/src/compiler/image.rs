use std::collections::HashSet;

use celgate_protocol::{
    ImageValidatingPolicy, ImageValidatingPolicySpec, PolicyException, PolicySpec,
};
use serde::Serialize;
use serde_json::{Map, Value};

use super::{Compiler, CompilerOptions, ExpressionCompiler};
use crate::cel::libs::LibrarySet;
use crate::cel::{NamedProgram, VAR_ATTESTATIONS, VAR_ATTESTORS, VAR_IMAGE, VAR_IMAGES};
use crate::compiled::image::VAR_REF;
use crate::compiled::{CompiledImagePolicy, CompiledPolicy, ImageBody, ImageMatcher};
use crate::error::{CompileErrors, FieldError};
use crate::matching::MatchCriteria;
use crate::pattern::compile_pattern;

#[derive(Debug, Clone, Default)]
pub struct ImageCompiler {
    options: CompilerOptions,
}

impl ImageCompiler {
    pub fn new(options: CompilerOptions) -> Self {
        Self { options }
    }
}

impl Compiler for ImageCompiler {
    type Spec = ImageValidatingPolicySpec;
    type Output = CompiledImagePolicy;

    fn compile(
        &self,
        policy: &ImageValidatingPolicy,
        exceptions: &[PolicyException],
    ) -> Result<CompiledImagePolicy, CompileErrors> {
        let spec = &policy.spec;
        let mut compiler = ExpressionCompiler::new(false).with_environment(
            LibrarySet::Image,
            &[VAR_IMAGES, VAR_IMAGE, VAR_ATTESTORS, VAR_ATTESTATIONS, VAR_REF],
        );
        compiler.require_name(policy);

        let programs = compiler.programs(spec, &self.options);

        let mut image_matchers = Vec::with_capacity(spec.match_image_references.len());
        for (i, reference) in spec.match_image_references.iter().enumerate() {
            let path = format!("spec.matchImageReferences[{}]", i);
            match (reference.glob.is_empty(), reference.expression.is_empty()) {
                (false, true) => match compile_pattern(&reference.glob) {
                    Ok(pattern) => image_matchers.push(ImageMatcher::Glob(pattern)),
                    Err(e) => compiler.error(FieldError::invalid(
                        format!("{}.glob", path),
                        &reference.glob,
                        e.to_string(),
                    )),
                },
                (true, false) => {
                    if let Some(program) =
                        compiler.expression(&format!("{}.expression", path), &reference.expression)
                    {
                        image_matchers.push(ImageMatcher::Expression(program));
                    }
                }
                _ => compiler.error(FieldError::invalid(
                    path,
                    "",
                    "exactly one of glob or expression must be set",
                )),
            }
        }

        let mut seen = HashSet::new();
        let mut extractors = Vec::with_capacity(spec.image_extractors.len());
        for (i, extractor) in spec.image_extractors.iter().enumerate() {
            let path = format!("spec.images[{}]", i);
            if extractor.name.is_empty() {
                compiler.error(FieldError::required(format!("{}.name", path), "name is required"));
            } else if !seen.insert(extractor.name.as_str()) {
                compiler.error(FieldError::invalid(
                    format!("{}.name", path),
                    &extractor.name,
                    "duplicate image extractor name",
                ));
            }
            if let Some(expression) =
                compiler.expression(&format!("{}.expression", path), &extractor.expression)
            {
                extractors.push(NamedProgram {
                    name: extractor.name.clone(),
                    expression,
                });
            }
        }

        let attestors = keyed_by_name(
            &mut compiler,
            "spec.attestors",
            spec.attestors.iter().map(|a| (a.name.as_str(), a)),
        );
        let attestations = keyed_by_name(
            &mut compiler,
            "spec.attestations",
            spec.attestations.iter().map(|a| (a.name.as_str(), a)),
        );

        if spec.validations.is_empty() {
            compiler.error(FieldError::required(
                "spec.validations",
                "at least one validation is required",
            ));
        }
        let validations = compiler.validations("spec.validations", &spec.validations);
        let exceptions =
            compiler.exceptions(policy.name(), ImageValidatingPolicySpec::KIND, exceptions);

        compiler.finish(CompiledPolicy {
            policy: policy.clone(),
            criteria: MatchCriteria::new(spec.match_constraints.as_ref()),
            actions: spec.validation_actions(),
            programs,
            exceptions,
            body: ImageBody {
                image_matchers,
                extractors,
                attestors,
                attestations,
                validations,
            },
        })
    }
}

/// Serialize named entries into a JSON map keyed by name.
fn keyed_by_name<'a, T, I>(compiler: &mut ExpressionCompiler, path: &str, entries: I) -> Value
where
    T: Serialize + 'a,
    I: Iterator<Item = (&'a str, &'a T)>,
{
    let mut map = Map::new();
    for (i, (name, entry)) in entries.enumerate() {
        let name_path = format!("{}[{}].name", path, i);
        if name.is_empty() {
            compiler.error(FieldError::required(name_path, "name is required"));
            continue;
        }
        if map.contains_key(name) {
            compiler.error(FieldError::invalid(name_path, name, "duplicate name"));
            continue;
        }
        match serde_json::to_value(entry) {
            Ok(value) => {
                map.insert(name.to_string(), value);
            }
            Err(e) => compiler.error(FieldError::internal(name_path, e.to_string())),
        }
    }
    Value::Object(map)
}
