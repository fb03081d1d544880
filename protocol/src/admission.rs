//! Admission review request types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::meta::{GroupVersionKind, GroupVersionResource};

/// The operation an admission request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the requesting user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserInfo {
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// An API operation submitted for review before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    #[serde(default)]
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub operation: Operation,
    #[serde(default)]
    pub user_info: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<serde_json::Value>,
    #[serde(default)]
    pub dry_run: bool,
}

impl AdmissionRequest {
    /// Build a request for `object`, deriving kind, name and namespace from it.
    pub fn for_object(
        operation: Operation,
        resource: GroupVersionResource,
        object: serde_json::Value,
    ) -> Self {
        let api_version = object
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let kind = object.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        let meta = crate::meta::object_meta(&object);
        Self {
            uid: String::new(),
            kind: GroupVersionKind::from_api_version(api_version, kind),
            resource,
            sub_resource: String::new(),
            request_kind: None,
            request_resource: None,
            name: meta.name,
            namespace: meta.namespace,
            operation,
            user_info: UserInfo::default(),
            object: Some(object),
            old_object: None,
            dry_run: false,
        }
    }

    pub fn with_old_object(mut self, old_object: serde_json::Value) -> Self {
        self.old_object = Some(old_object);
        self
    }

    pub fn with_user(mut self, username: &str, groups: &[&str]) -> Self {
        self.user_info.username = username.to_string();
        self.user_info.groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }
}
