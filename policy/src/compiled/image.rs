use std::collections::BTreeMap;
use std::sync::Arc;

use cel_interpreter::Value;
use celgate_protocol::{ImageValidatingPolicySpec, Namespace};

use super::validating::CompiledValidation;
use super::{failure_message, gate, CompiledPolicy, Evaluation, Gate};
use crate::cel::convert::{string_map, to_cel, type_name};
use crate::cel::libs::Libraries;
use crate::cel::{
    Bindings, CelExpression, NamedProgram, Scope, VAR_ATTESTATIONS, VAR_ATTESTORS, VAR_IMAGE,
    VAR_IMAGES,
};
use crate::error::{EvalError, EvalResult};
use crate::matching::Attributes;
use crate::pattern::CompiledPattern;

pub type CompiledImagePolicy = CompiledPolicy<ImageValidatingPolicySpec, ImageBody>;

/// Variable bound to the candidate reference in image match expressions.
pub const VAR_REF: &str = "ref";

const CONTAINER_FIELDS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

const POD_SPEC_PATHS: &[&[&str]] = &[
    &["spec"],
    &["spec", "template", "spec"],
    &["spec", "jobTemplate", "spec", "template", "spec"],
];

#[derive(Debug)]
pub enum ImageMatcher {
    Glob(CompiledPattern),
    Expression(CelExpression),
}

#[derive(Debug)]
pub struct ImageBody {
    /// Empty means every extracted image is verified.
    pub image_matchers: Vec<ImageMatcher>,
    pub extractors: Vec<NamedProgram>,
    /// Attestors keyed by name, bound as `attestors`.
    pub attestors: serde_json::Value,
    /// Attestations keyed by name, bound as `attestations`.
    pub attestations: serde_json::Value,
    pub validations: Vec<CompiledValidation>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageOutcome {
    pub allowed: bool,
    pub message: String,
    /// Every image the validations ran against.
    pub images: Vec<String>,
    pub failed_image: Option<String>,
}

impl CompiledImagePolicy {
    /// Verify the images of one request.
    ///
    /// Validations run once per selected image with `image` bound; all of
    /// them must hold for every image. A request without selected images
    /// is not matched.
    pub fn evaluate(
        &self,
        attributes: &Attributes,
        namespace: Option<&Namespace>,
        libraries: &Libraries,
    ) -> EvalResult<Evaluation<ImageOutcome>> {
        let libraries = libraries.clone().with_images();
        let mut images = attributes
            .object
            .as_ref()
            .map(extract_default_images)
            .unwrap_or_default();
        let bindings = Bindings::kubernetes(attributes, namespace)
            .with(VAR_IMAGES, images_value(&images))
            .with(VAR_ATTESTORS, to_cel(&self.body.attestors))
            .with(VAR_ATTESTATIONS, to_cel(&self.body.attestations));
        let scope = Scope::new(&bindings, &libraries, &self.programs.variables);
        match gate(&self.programs, &self.exceptions, &scope)? {
            Gate::Proceed => {}
            Gate::Skip => return Ok(Evaluation::NotMatched),
            Gate::Excepted(exceptions) => return Ok(Evaluation::Excepted(exceptions)),
        }

        for extractor in &self.body.extractors {
            let label = format!("images[{}]", extractor.name);
            let value = scope.execute(&label, &extractor.expression, &[])?;
            images.insert(extractor.name.clone(), string_list(&label, &value)?);
        }

        let mut selected = BTreeMap::new();
        let mut unique: Vec<String> = Vec::new();
        for (name, refs) in &images {
            let mut kept = Vec::new();
            for reference in refs {
                if self.selects(&scope, reference)? {
                    kept.push(reference.clone());
                    if !unique.contains(reference) {
                        unique.push(reference.clone());
                    }
                }
            }
            selected.insert(name.clone(), kept);
        }
        if unique.is_empty() {
            log::debug!("policy {} selected no images", self.name());
            return Ok(Evaluation::NotMatched);
        }

        let selected = images_value(&selected);
        for image in &unique {
            let overrides = [
                (VAR_IMAGES, selected.clone()),
                (VAR_IMAGE, Value::String(Arc::new(image.clone()))),
            ];
            for (i, validation) in self.body.validations.iter().enumerate() {
                let label = format!("validations[{}]", i);
                if scope.execute_bool(&label, &validation.expression, &overrides)? {
                    continue;
                }
                let message = failure_message(
                    &scope,
                    &format!("{}.messageExpression", label),
                    &validation.message,
                    validation.message_expression.as_ref(),
                    &validation.expression,
                    &overrides,
                )?;
                return Ok(Evaluation::Evaluated(ImageOutcome {
                    allowed: false,
                    message,
                    images: unique.clone(),
                    failed_image: Some(image.clone()),
                }));
            }
        }

        Ok(Evaluation::Evaluated(ImageOutcome {
            allowed: true,
            message: String::new(),
            images: unique,
            failed_image: None,
        }))
    }

    fn selects(&self, scope: &Scope<'_>, reference: &str) -> EvalResult<bool> {
        if self.body.image_matchers.is_empty() {
            return Ok(true);
        }
        for (i, matcher) in self.body.image_matchers.iter().enumerate() {
            let selected = match matcher {
                ImageMatcher::Glob(pattern) => pattern.matches(reference),
                ImageMatcher::Expression(program) => scope.execute_bool(
                    &format!("matchImageReferences[{}]", i),
                    program,
                    &[(VAR_REF, Value::String(Arc::new(reference.to_string())))],
                )?,
            };
            if selected {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Container images of a pod or pod-template-bearing object, by field.
pub fn extract_default_images(object: &serde_json::Value) -> BTreeMap<String, Vec<String>> {
    let mut images: BTreeMap<String, Vec<String>> = CONTAINER_FIELDS
        .iter()
        .map(|field| (field.to_string(), Vec::new()))
        .collect();
    for path in POD_SPEC_PATHS {
        let Some(pod_spec) = path.iter().try_fold(object, |v, key| v.get(key)) else {
            continue;
        };
        for field in CONTAINER_FIELDS {
            let Some(containers) = pod_spec.get(field).and_then(|c| c.as_array()) else {
                continue;
            };
            let refs = images.entry(field.to_string()).or_default();
            refs.extend(
                containers
                    .iter()
                    .filter_map(|c| c.get("image").and_then(|i| i.as_str()))
                    .map(str::to_string),
            );
        }
    }
    images
}

fn images_value(images: &BTreeMap<String, Vec<String>>) -> Value {
    string_map(images.iter().map(|(name, refs)| {
        let list = refs
            .iter()
            .map(|r| Value::String(Arc::new(r.clone())))
            .collect::<Vec<_>>();
        (name.clone(), Value::List(Arc::new(list)))
    }))
}

fn string_list(label: &str, value: &Value) -> EvalResult<Vec<String>> {
    let unexpected = |got: &Value| EvalError::UnexpectedType {
        context: label.to_string(),
        expected: "list of strings",
        got: type_name(got).to_string(),
    };
    match value {
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.as_str().to_string()),
                other => Err(unexpected(other)),
            })
            .collect(),
        other => Err(unexpected(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_from_pod() {
        let pod = json!({"spec": {
            "containers": [{"name": "app", "image": "ghcr.io/acme/app:v1"}],
            "initContainers": [{"name": "init", "image": "busybox"}]
        }});
        let images = extract_default_images(&pod);
        assert_eq!(images["containers"], vec!["ghcr.io/acme/app:v1"]);
        assert_eq!(images["initContainers"], vec!["busybox"]);
        assert!(images["ephemeralContainers"].is_empty());
    }

    #[test]
    fn test_extract_from_templates() {
        let deployment = json!({"spec": {"template": {"spec": {
            "containers": [{"name": "app", "image": "nginx:1.25"}]
        }}}});
        assert_eq!(extract_default_images(&deployment)["containers"], vec!["nginx:1.25"]);

        let cronjob = json!({"spec": {"jobTemplate": {"spec": {"template": {"spec": {
            "containers": [{"name": "job", "image": "alpine"}]
        }}}}}});
        assert_eq!(extract_default_images(&cronjob)["containers"], vec!["alpine"]);
    }
}
