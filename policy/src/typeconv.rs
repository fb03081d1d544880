//! Structured merge support for apply-configuration mutations.
//!
//! A [`TypeConverter`] knows, per object kind, which lists are keyed (and
//! by what field) so partial objects merge into the target the way a
//! server-side apply would. Lists without a known key are replaced.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use celgate_protocol::GroupVersionKind;
use serde_json::Value;

use crate::autogen::lookup_controller;

/// Merge keys of pod spec lists, relative to the pod spec.
const POD_SPEC_MERGE_KEYS: &[(&str, &str)] = &[
    ("containers", "name"),
    ("initContainers", "name"),
    ("ephemeralContainers", "name"),
    ("volumes", "name"),
    ("imagePullSecrets", "name"),
    ("hostAliases", "ip"),
    ("containers.env", "name"),
    ("containers.ports", "containerPort"),
    ("containers.volumeMounts", "mountPath"),
    ("containers.volumeDevices", "devicePath"),
    ("initContainers.env", "name"),
    ("initContainers.ports", "containerPort"),
    ("initContainers.volumeMounts", "mountPath"),
    ("ephemeralContainers.env", "name"),
    ("ephemeralContainers.volumeMounts", "mountPath"),
];

/// List merge keys for one kind, addressed by dotted field path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeConverter {
    merge_keys: HashMap<String, String>,
}

impl TypeConverter {
    /// A converter for `gvk`; unknown kinds treat every list as atomic.
    pub fn for_kind(gvk: &GroupVersionKind) -> Self {
        let Some(pod_spec) = pod_spec_path(gvk) else {
            return Self::default();
        };
        let merge_keys = POD_SPEC_MERGE_KEYS
            .iter()
            .map(|(path, key)| (format!("{}.{}", pod_spec, path), key.to_string()))
            .collect();
        Self { merge_keys }
    }

    pub fn merge_key(&self, path: &str) -> Option<&str> {
        self.merge_keys.get(path).map(String::as_str)
    }

    /// Merge `patch` into `target`. `null` in the patch deletes a field.
    pub fn apply(&self, target: &Value, patch: &Value) -> Value {
        let mut merged = target.clone();
        self.merge_into(&mut merged, patch, "");
        merged
    }

    fn merge_into(&self, target: &mut Value, patch: &Value, path: &str) {
        match (target, patch) {
            (Value::Object(fields), Value::Object(patch_fields)) => {
                for (key, value) in patch_fields {
                    if value.is_null() {
                        fields.remove(key);
                        continue;
                    }
                    let child_path = join(path, key);
                    match fields.get_mut(key) {
                        Some(existing) => self.merge_into(existing, value, &child_path),
                        None => {
                            fields.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
            (Value::Array(items), Value::Array(patch_items)) => match self.merge_key(path) {
                Some(key) => {
                    for patch_item in patch_items {
                        let id = patch_item.get(key);
                        let existing = id.and_then(|id| {
                            items.iter_mut().find(|item| item.get(key) == Some(id))
                        });
                        match existing {
                            Some(item) => self.merge_into(item, patch_item, path),
                            None => items.push(patch_item.clone()),
                        }
                    }
                }
                None => *items = patch_items.clone(),
            },
            (target, patch) => *target = patch.clone(),
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn pod_spec_path(gvk: &GroupVersionKind) -> Option<&'static str> {
    if gvk.group.is_empty() && gvk.kind == "Pod" {
        return Some("spec");
    }
    let controller = lookup_controller(&format!("{}s", gvk.kind.to_ascii_lowercase()))?;
    if controller.group != gvk.group {
        return None;
    }
    Some(if controller.kind == "CronJob" {
        "spec.jobTemplate.spec.template.spec"
    } else {
        "spec.template.spec"
    })
}

/// Caches one [`TypeConverter`] per group/version/kind.
#[derive(Debug, Default)]
pub struct TypeConverterManager {
    converters: RwLock<HashMap<GroupVersionKind, Arc<TypeConverter>>>,
}

impl TypeConverterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn converter(&self, gvk: &GroupVersionKind) -> Arc<TypeConverter> {
        if let Ok(converters) = self.converters.read() {
            if let Some(converter) = converters.get(gvk) {
                return converter.clone();
            }
        }
        let converter = Arc::new(TypeConverter::for_kind(gvk));
        if let Ok(mut converters) = self.converters.write() {
            converters.insert(gvk.clone(), converter.clone());
        }
        converter
    }
}
