//! CEL function libraries backed by the request's context capability.
//!
//! Functions registered here:
//!
//! | function | returns |
//! |---|---|
//! | `getResource(apiVersion, resource, namespace, name)` | object |
//! | `listResources(apiVersion, resource, namespace)` | list object |
//! | `postResource(apiVersion, resource, namespace, data)` | created object |
//! | `globalContext(name, projection)` | any |
//! | `httpGet(url)` | any |
//! | `imageData(ref)` | map |
//! | `parseImageReference(ref)` | map |
//! | `parseServiceAccount(username)` | map |
//! | `generate(namespace, resources)` | bool (generating policies) |
//! | `verifyImageSignatures(image, attestors)` | int (image policies) |
//! | `verifyAttestationSignatures(image, attestation, attestors)` | bool (image policies) |
//! | `extractPayload(image, attestation)` | any (image policies) |

use std::sync::{Arc, Mutex};

use cel_interpreter::extractors::Arguments;
use cel_interpreter::{Context, ExecutionError, Value};
use serde_json::json;

use super::convert::{to_cel, to_json};
use super::image_ref::{parse_service_account, ImageReference};
use super::Cancellation;
use crate::config::GenerationLabels;
use crate::error::{ContextError, ContextResult};

/// Capabilities CEL libraries use to reach outside the evaluation.
///
/// One implementation per environment: a live cluster client, or the
/// in-memory [`crate::FakeContext`] for offline evaluation.
pub trait ContextInterface: Send + Sync {
    fn get_resource(
        &self,
        api_version: &str,
        resource: &str,
        namespace: &str,
        name: &str,
    ) -> ContextResult<serde_json::Value>;

    fn list_resources(
        &self,
        api_version: &str,
        resource: &str,
        namespace: &str,
    ) -> ContextResult<serde_json::Value>;

    fn post_resource(
        &self,
        api_version: &str,
        resource: &str,
        namespace: &str,
        data: &serde_json::Value,
    ) -> ContextResult<serde_json::Value>;

    fn get_global_reference(&self, name: &str, projection: &str) -> ContextResult<serde_json::Value>;

    fn http_get(&self, url: &str) -> ContextResult<serde_json::Value>;

    fn get_image_data(&self, image: &str) -> ContextResult<serde_json::Value>;

    /// Look up a resource by kind, used for the generation existence check.
    fn find_resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> ContextResult<Option<serde_json::Value>>;

    fn create_resource(&self, resource: &serde_json::Value) -> ContextResult<serde_json::Value>;

    /// Names of the attestors whose signature over `image` verified.
    fn verify_image_signatures(
        &self,
        image: &str,
        attestors: &[serde_json::Value],
    ) -> ContextResult<Vec<String>>;

    fn verify_attestation_signatures(
        &self,
        image: &str,
        attestation: &serde_json::Value,
        attestors: &[serde_json::Value],
    ) -> ContextResult<bool>;

    fn extract_payload(
        &self,
        image: &str,
        attestation: &serde_json::Value,
    ) -> ContextResult<serde_json::Value>;
}

/// Identity of the policy and trigger a generation runs for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateContext {
    pub policy_name: String,
    pub trigger_name: String,
    pub trigger_namespace: String,
    pub trigger_api_version: String,
    pub trigger_group: String,
    pub trigger_kind: String,
    pub trigger_uid: String,
    /// Also report downstream resources that already exist.
    pub restore_cache: bool,
}

/// Which optional function groups to register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySet {
    Base,
    Generation,
    Image,
}

const BASE_FUNCTIONS: &[&str] = &[
    "getResource",
    "listResources",
    "postResource",
    "globalContext",
    "httpGet",
    "imageData",
    "parseImageReference",
    "parseServiceAccount",
];

impl LibrarySet {
    /// Names of the functions this set registers beyond the CEL builtins.
    pub fn functions(self) -> impl Iterator<Item = &'static str> {
        let extra: &[&str] = match self {
            LibrarySet::Base => &[],
            LibrarySet::Generation => &["generate"],
            LibrarySet::Image => &[
                "verifyImageSignatures",
                "verifyAttestationSignatures",
                "extractPayload",
            ],
        };
        BASE_FUNCTIONS.iter().chain(extra).copied()
    }
}

/// Function libraries bound to one evaluation.
#[derive(Clone)]
pub struct Libraries {
    context: Arc<dyn ContextInterface>,
    cancellation: Cancellation,
    set: LibrarySet,
    generation: Option<Generation>,
}

#[derive(Clone)]
struct Generation {
    context: GenerateContext,
    labels: GenerationLabels,
    generated: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl Libraries {
    pub fn new(context: Arc<dyn ContextInterface>, cancellation: Cancellation) -> Self {
        Self {
            context,
            cancellation,
            set: LibrarySet::Base,
            generation: None,
        }
    }

    pub fn with_images(mut self) -> Self {
        self.set = LibrarySet::Image;
        self
    }

    /// Enable `generate`, recording outputs into `sink`.
    pub fn with_generation(
        mut self,
        context: GenerateContext,
        labels: GenerationLabels,
        sink: Arc<Mutex<Vec<serde_json::Value>>>,
    ) -> Self {
        self.set = LibrarySet::Generation;
        self.generation = Some(Generation {
            context,
            labels,
            generated: sink,
        });
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn register(&self, ctx: &mut Context<'static>) {
        self.register_resource(ctx);
        self.register_lookups(ctx);
        self.register_parsers(ctx);
        match self.set {
            LibrarySet::Base => {}
            LibrarySet::Generation => {
                if let Some(generation) = &self.generation {
                    self.register_generate(ctx, generation.clone());
                }
            }
            LibrarySet::Image => self.register_image_verification(ctx),
        }
    }

    fn register_resource(&self, ctx: &mut Context<'static>) {
        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("getResource", move |Arguments(args): Arguments| {
            const NAME: &str = "getResource";
            guard(NAME, &cancel)?;
            let [api_version, resource, namespace, name] = string_args::<4>(NAME, &args)?;
            let object = c
                .get_resource(&api_version, &resource, &namespace, &name)
                .map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&object))
        });

        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("listResources", move |Arguments(args): Arguments| {
            const NAME: &str = "listResources";
            guard(NAME, &cancel)?;
            let [api_version, resource, namespace] = string_args::<3>(NAME, &args)?;
            let list = c
                .list_resources(&api_version, &resource, &namespace)
                .map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&list))
        });

        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("postResource", move |Arguments(args): Arguments| {
            const NAME: &str = "postResource";
            guard(NAME, &cancel)?;
            let [api_version, resource, namespace] = string_args::<3>(NAME, &args[..args.len().min(3)])?;
            let data = json_arg(NAME, &args, 3)?;
            let created = c
                .post_resource(&api_version, &resource, &namespace, &data)
                .map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&created))
        });
    }

    fn register_lookups(&self, ctx: &mut Context<'static>) {
        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("globalContext", move |Arguments(args): Arguments| {
            const NAME: &str = "globalContext";
            guard(NAME, &cancel)?;
            let [name, projection] = string_args::<2>(NAME, &args)?;
            let value = c
                .get_global_reference(&name, &projection)
                .map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&value))
        });

        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("httpGet", move |Arguments(args): Arguments| {
            const NAME: &str = "httpGet";
            guard(NAME, &cancel)?;
            let [url] = string_args::<1>(NAME, &args)?;
            let body = c.http_get(&url).map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&body))
        });

        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("imageData", move |Arguments(args): Arguments| {
            const NAME: &str = "imageData";
            guard(NAME, &cancel)?;
            let [image] = string_args::<1>(NAME, &args)?;
            let data = c.get_image_data(&image).map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&data))
        });
    }

    fn register_parsers(&self, ctx: &mut Context<'static>) {
        ctx.add_function("parseImageReference", |Arguments(args): Arguments| {
            const NAME: &str = "parseImageReference";
            let [reference] = string_args::<1>(NAME, &args)?;
            let parsed = ImageReference::parse(&reference).map_err(|e| fail(NAME, e))?;
            let value = serde_json::to_value(parsed).map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&value))
        });

        ctx.add_function("parseServiceAccount", |Arguments(args): Arguments| {
            const NAME: &str = "parseServiceAccount";
            let [username] = string_args::<1>(NAME, &args)?;
            let value = match parse_service_account(&username) {
                Some((namespace, name)) => json!({"namespace": namespace, "name": name}),
                None => json!({"namespace": "", "name": ""}),
            };
            Ok::<Value, ExecutionError>(to_cel(&value))
        });
    }

    fn register_generate(&self, ctx: &mut Context<'static>, generation: Generation) {
        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("generate", move |Arguments(args): Arguments| {
            const NAME: &str = "generate";
            guard(NAME, &cancel)?;
            let [namespace] = string_args::<1>(NAME, &args[..args.len().min(1)])?;
            let resources = match json_arg(NAME, &args, 1)? {
                serde_json::Value::Array(items) => items,
                single @ serde_json::Value::Object(_) => vec![single],
                other => return Err(fail(NAME, format!("expected list of resources, got {}", other))),
            };
            for resource in resources {
                guard(NAME, &cancel)?;
                let outcome = generate_one(c.as_ref(), &generation, &namespace, resource)
                    .map_err(|e| fail(NAME, e))?;
                if let Some(recorded) = outcome {
                    generation
                        .generated
                        .lock()
                        .map_err(|_| fail(NAME, "generated resource sink poisoned"))?
                        .push(recorded);
                }
            }
            Ok::<Value, ExecutionError>(Value::Bool(true))
        });
    }

    fn register_image_verification(&self, ctx: &mut Context<'static>) {
        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("verifyImageSignatures", move |Arguments(args): Arguments| {
            const NAME: &str = "verifyImageSignatures";
            guard(NAME, &cancel)?;
            let [image] = string_args::<1>(NAME, &args[..args.len().min(1)])?;
            let attestors = list_arg(NAME, &args, 1)?;
            let verified = c
                .verify_image_signatures(&image, &attestors)
                .map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(Value::Int(verified.len() as i64))
        });

        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("verifyAttestationSignatures", move |Arguments(args): Arguments| {
            const NAME: &str = "verifyAttestationSignatures";
            guard(NAME, &cancel)?;
            let [image] = string_args::<1>(NAME, &args[..args.len().min(1)])?;
            let attestation = json_arg(NAME, &args, 1)?;
            let attestors = list_arg(NAME, &args, 2)?;
            let ok = c
                .verify_attestation_signatures(&image, &attestation, &attestors)
                .map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(Value::Bool(ok))
        });

        let (c, cancel) = (self.context.clone(), self.cancellation.clone());
        ctx.add_function("extractPayload", move |Arguments(args): Arguments| {
            const NAME: &str = "extractPayload";
            guard(NAME, &cancel)?;
            let [image] = string_args::<1>(NAME, &args[..args.len().min(1)])?;
            let attestation = json_arg(NAME, &args, 1)?;
            let payload = c
                .extract_payload(&image, &attestation)
                .map_err(|e| fail(NAME, e))?;
            Ok::<Value, ExecutionError>(to_cel(&payload))
        });
    }
}

/// Create one downstream resource unless a copy with our provenance exists.
///
/// Returns the resource to report, if any.
fn generate_one(
    ctx: &dyn ContextInterface,
    generation: &Generation,
    namespace: &str,
    mut resource: serde_json::Value,
) -> ContextResult<Option<serde_json::Value>> {
    let api_version = str_field(&resource, &["apiVersion"]).to_string();
    let kind = str_field(&resource, &["kind"]).to_string();
    let name = str_field(&resource, &["metadata", "name"]).to_string();
    if api_version.is_empty() || kind.is_empty() || name.is_empty() {
        return Err(ContextError::Failed(
            "generated resource requires apiVersion, kind and metadata.name".to_string(),
        ));
    }

    let Some(object) = resource.as_object_mut() else {
        return Err(ContextError::Failed("generated resource must be an object".to_string()));
    };
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| ContextError::Failed("metadata must be an object".to_string()))?;
    // The argument decides the namespace for both the lookup and the create.
    if namespace.is_empty() {
        metadata.remove("namespace");
    } else {
        metadata.insert("namespace".to_string(), json!(namespace));
    }
    let labels = metadata
        .entry("labels")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| ContextError::Failed("metadata.labels must be an object".to_string()))?;
    for (key, value) in generation.labels.provenance(&generation.context) {
        labels.insert(key, json!(value));
    }

    if let Some(existing) = ctx.find_resource(&api_version, &kind, namespace, &name)? {
        if generation.labels.is_owned_by(&existing, &generation.context) {
            log::debug!(
                "generate: {}/{} {} already exists for trigger {}",
                api_version,
                kind,
                name,
                generation.context.trigger_uid
            );
            return Ok(generation.context.restore_cache.then_some(existing));
        }
        let resource = if namespace.is_empty() {
            format!("{} {}", kind, name)
        } else {
            format!("{} {}/{}", kind, namespace, name)
        };
        return Err(ContextError::Unmanaged {
            resource,
            policy: generation.context.policy_name.clone(),
        });
    }

    ctx.create_resource(&resource).map(Some)
}

fn str_field<'a>(value: &'a serde_json::Value, path: &[&str]) -> &'a str {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

fn guard(name: &str, cancellation: &Cancellation) -> Result<(), ExecutionError> {
    cancellation.check().map_err(|e| fail(name, e))
}

fn fail(name: &str, error: impl ToString) -> ExecutionError {
    ExecutionError::function_error(name, error.to_string())
}

fn string_args<const N: usize>(name: &str, args: &[Value]) -> Result<[String; N], ExecutionError> {
    if args.len() != N {
        return Err(fail(
            name,
            format!("expected {} string arguments, got {}", N, args.len()),
        ));
    }
    let mut out: [String; N] = std::array::from_fn(|_| String::new());
    for (slot, arg) in out.iter_mut().zip(args) {
        match arg {
            Value::String(s) => *slot = s.as_str().to_string(),
            other => {
                return Err(fail(
                    name,
                    format!("expected string argument, got {}", super::convert::type_name(other)),
                ))
            }
        }
    }
    Ok(out)
}

fn json_arg(name: &str, args: &[Value], index: usize) -> Result<serde_json::Value, ExecutionError> {
    let arg = args
        .get(index)
        .ok_or_else(|| fail(name, format!("missing argument {}", index + 1)))?;
    to_json(arg).map_err(|e| fail(name, e))
}

fn list_arg(name: &str, args: &[Value], index: usize) -> Result<Vec<serde_json::Value>, ExecutionError> {
    match json_arg(name, args, index)? {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Null => Ok(Vec::new()),
        single => Ok(vec![single]),
    }
}
