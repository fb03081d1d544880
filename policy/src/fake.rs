//! In-memory [`ContextInterface`] for offline evaluation and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde_json::{json, Value};

use celgate_protocol::object_meta;

use crate::cel::libs::ContextInterface;
use crate::error::{ContextError, ContextResult};

type ResourceKey = (String, String, String, String);

#[derive(Debug, Default)]
struct FakeState {
    /// Keyed by apiVersion, resource plural, namespace and name.
    resources: BTreeMap<ResourceKey, Value>,
    generated: Vec<Value>,
    globals: HashMap<String, Value>,
    http: HashMap<String, Value>,
    images: HashMap<String, Value>,
    /// Attestor names whose signature verifies, per image.
    signatures: HashMap<String, Vec<String>>,
    /// Attestation payloads by image and attestation name.
    payloads: HashMap<(String, String), Value>,
    calls: HashMap<&'static str, usize>,
}

/// A cluster, registry and HTTP stand-in held entirely in memory.
#[derive(Debug, Default)]
pub struct FakeContext {
    state: Mutex<FakeState>,
}

impl FakeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a resource. Its namespace and name come from its metadata.
    pub fn with_resource(mut self, api_version: &str, resource: &str, object: Value) -> Self {
        let meta = object_meta(&object);
        self.state_mut().resources.insert(
            (api_version.to_string(), resource.to_string(), meta.namespace, meta.name),
            object,
        );
        self
    }

    pub fn with_global(mut self, name: &str, value: Value) -> Self {
        self.state_mut().globals.insert(name.to_string(), value);
        self
    }

    pub fn with_http(mut self, url: &str, response: Value) -> Self {
        self.state_mut().http.insert(url.to_string(), response);
        self
    }

    pub fn with_image_data(mut self, image: &str, data: Value) -> Self {
        self.state_mut().images.insert(image.to_string(), data);
        self
    }

    /// Mark `image` as signed by the named attestors.
    pub fn with_signature(mut self, image: &str, attestors: &[&str]) -> Self {
        self.state_mut()
            .signatures
            .entry(image.to_string())
            .or_default()
            .extend(attestors.iter().map(|a| a.to_string()));
        self
    }

    pub fn with_attestation(mut self, image: &str, attestation: &str, payload: Value) -> Self {
        self.state_mut()
            .payloads
            .insert((image.to_string(), attestation.to_string()), payload);
        self
    }

    /// Resources created through `generate`, in creation order.
    pub fn generated(&self) -> Vec<Value> {
        self.lock().map(|s| s.generated.clone()).unwrap_or_default()
    }

    /// How many times the named capability was invoked.
    pub fn calls(&self, function: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.calls.get(function).copied())
            .unwrap_or(0)
    }

    fn state_mut(&mut self) -> &mut FakeState {
        match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock(&self) -> ContextResult<MutexGuard<'_, FakeState>> {
        self.state
            .lock()
            .map_err(|_| ContextError::Failed("fake context lock poisoned".to_string()))
    }

    /// Lock and count one call of `function`.
    fn enter(&self, function: &'static str) -> ContextResult<MutexGuard<'_, FakeState>> {
        let mut state = self.lock()?;
        *state.calls.entry(function).or_default() += 1;
        Ok(state)
    }
}

fn attestor_names(attestors: &[Value]) -> impl Iterator<Item = &str> {
    attestors
        .iter()
        .filter_map(|a| a.get("name").and_then(Value::as_str))
}

impl ContextInterface for FakeContext {
    fn get_resource(
        &self,
        api_version: &str,
        resource: &str,
        namespace: &str,
        name: &str,
    ) -> ContextResult<Value> {
        let state = self.enter("getResource")?;
        let key = (
            api_version.to_string(),
            resource.to_string(),
            namespace.to_string(),
            name.to_string(),
        );
        state.resources.get(&key).cloned().ok_or_else(|| ContextError::NotFound {
            kind: resource.to_string(),
            name: name.to_string(),
        })
    }

    fn list_resources(&self, api_version: &str, resource: &str, namespace: &str) -> ContextResult<Value> {
        let state = self.enter("listResources")?;
        let items: Vec<Value> = state
            .resources
            .iter()
            .filter(|((v, r, ns, _), _)| {
                v == api_version && r == resource && (namespace.is_empty() || ns == namespace)
            })
            .map(|(_, object)| object.clone())
            .collect();
        Ok(json!({"apiVersion": api_version, "kind": "List", "items": items}))
    }

    fn post_resource(
        &self,
        _api_version: &str,
        _resource: &str,
        _namespace: &str,
        data: &Value,
    ) -> ContextResult<Value> {
        let _state = self.enter("postResource")?;
        Ok(data.clone())
    }

    fn get_global_reference(&self, name: &str, projection: &str) -> ContextResult<Value> {
        let state = self.enter("globalContext")?;
        let entry = state.globals.get(name).ok_or_else(|| ContextError::NotFound {
            kind: "global context entry".to_string(),
            name: name.to_string(),
        })?;
        if projection.is_empty() {
            return Ok(entry.clone());
        }
        entry.get(projection).cloned().ok_or_else(|| ContextError::NotFound {
            kind: format!("projection of {}", name),
            name: projection.to_string(),
        })
    }

    fn http_get(&self, url: &str) -> ContextResult<Value> {
        let state = self.enter("httpGet")?;
        state
            .http
            .get(url)
            .cloned()
            .ok_or_else(|| ContextError::Failed(format!("GET {}: connection refused", url)))
    }

    fn get_image_data(&self, image: &str) -> ContextResult<Value> {
        let state = self.enter("imageData")?;
        state.images.get(image).cloned().ok_or_else(|| ContextError::NotFound {
            kind: "image".to_string(),
            name: image.to_string(),
        })
    }

    fn find_resource(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> ContextResult<Option<Value>> {
        let state = self.enter("findResource")?;
        Ok(state
            .resources
            .iter()
            .find(|((v, _, ns, n), object)| {
                v == api_version && ns == namespace && n == name && object["kind"] == kind
            })
            .map(|(_, object)| object.clone()))
    }

    fn create_resource(&self, resource: &Value) -> ContextResult<Value> {
        let mut state = self.enter("createResource")?;
        let api_version = resource["apiVersion"].as_str().unwrap_or_default().to_string();
        let plural = format!("{}s", resource["kind"].as_str().unwrap_or_default().to_lowercase());
        let meta = object_meta(resource);
        let key = (api_version, plural, meta.namespace, meta.name);
        if state.resources.contains_key(&key) {
            return Err(ContextError::AlreadyExists(meta_key(&key)));
        }
        state.resources.insert(key, resource.clone());
        state.generated.push(resource.clone());
        Ok(resource.clone())
    }

    fn verify_image_signatures(&self, image: &str, attestors: &[Value]) -> ContextResult<Vec<String>> {
        let state = self.enter("verifyImageSignatures")?;
        let signed = state.signatures.get(image);
        Ok(attestor_names(attestors)
            .filter(|name| signed.is_some_and(|s| s.iter().any(|a| a == name)))
            .map(str::to_string)
            .collect())
    }

    fn verify_attestation_signatures(
        &self,
        image: &str,
        attestation: &Value,
        attestors: &[Value],
    ) -> ContextResult<bool> {
        let state = self.enter("verifyAttestationSignatures")?;
        let name = attestation["name"].as_str().unwrap_or_default();
        if !state.payloads.contains_key(&(image.to_string(), name.to_string())) {
            return Ok(false);
        }
        let signed = state.signatures.get(image);
        Ok(attestor_names(attestors).any(|a| signed.is_some_and(|s| s.iter().any(|x| x == a))))
    }

    fn extract_payload(&self, image: &str, attestation: &Value) -> ContextResult<Value> {
        let state = self.enter("extractPayload")?;
        let name = attestation["name"].as_str().unwrap_or_default();
        state
            .payloads
            .get(&(image.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ContextError::NotFound {
                kind: "attestation".to_string(),
                name: format!("{}@{}", name, image),
            })
    }
}

fn meta_key((api_version, resource, namespace, name): &ResourceKey) -> String {
    if namespace.is_empty() {
        format!("{} {} {}", api_version, resource, name)
    } else {
        format!("{} {} {}/{}", api_version, resource, namespace, name)
    }
}
