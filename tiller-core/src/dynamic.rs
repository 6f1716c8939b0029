//! Contains types for handling object kinds not known at compile-time.
//!
//! The store and the gateway's admission chain operate exclusively on
//! [`DynamicObject`]s; the typed `Api<K>` surface converts at the boundary.
pub use crate::api_resource::ApiResource;
use crate::{
    api_resource::Scope,
    metadata::{ObjectMeta, TypeMeta},
    resource::Resource,
};

use serde::{de::DeserializeOwned, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Failed to convert a `DynamicObject` to or from a typed resource
#[derive(Debug, Error)]
#[error("failed to convert DynamicObject: {source}")]
pub struct ParseDynamicObjectError {
    #[from]
    source: serde_json::Error,
}

/// A dynamic representation of a tiller object
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct DynamicObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys (`spec`, `status`, ...)
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create a DynamicObject with minimal values set from an ApiResource
    #[must_use]
    pub fn new(name: &str, resource: &ApiResource) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    /// Attach dynamic data to a DynamicObject
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to a DynamicObject
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Convert a typed resource into its dynamic representation.
    ///
    /// The `TypeMeta` is stamped from the compile-time kind information, so
    /// callers never hand-write `apiVersion`/`kind` pairs.
    pub fn from_typed<K>(obj: &K) -> Result<Self, ParseDynamicObjectError>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut value = serde_json::to_value(obj)?;
        let metadata = match value.get_mut("metadata") {
            Some(meta) => serde_json::from_value(meta.take())?,
            None => ObjectMeta::default(),
        };
        if let serde_json::Value::Object(ref mut map) = value {
            map.remove("metadata");
        }
        Ok(Self {
            types: Some(K::type_meta(&())),
            metadata,
            data: value,
        })
    }

    /// Attempt to convert this `DynamicObject` to a typed resource
    pub fn try_parse<K: Resource + DeserializeOwned>(&self) -> Result<K, ParseDynamicObjectError> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    /// Borrow the `spec` subtree, if present
    pub fn spec(&self) -> Option<&serde_json::Value> {
        self.data.get("spec")
    }

    /// Borrow the `status` subtree, if present
    pub fn status(&self) -> Option<&serde_json::Value> {
        self.data.get("status")
    }

    /// Replace the `status` subtree
    pub fn set_status(&mut self, status: serde_json::Value) {
        if let serde_json::Value::Object(ref mut map) = self.data {
            map.insert("status".into(), status);
        }
    }
}

impl Resource for DynamicObject {
    type DynamicType = ApiResource;

    fn group(dt: &ApiResource) -> Cow<'_, str> {
        dt.group.as_str().into()
    }

    fn version(dt: &ApiResource) -> Cow<'_, str> {
        dt.version.as_str().into()
    }

    fn kind(dt: &ApiResource) -> Cow<'_, str> {
        dt.kind.as_str().into()
    }

    fn api_version(dt: &ApiResource) -> Cow<'_, str> {
        dt.api_version.as_str().into()
    }

    fn scope(dt: &ApiResource) -> Scope {
        dt.scope
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
