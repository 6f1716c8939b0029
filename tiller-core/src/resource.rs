//! Accessor trait implemented by every stored kind.
use crate::{
    api_resource::Scope,
    metadata::{ObjectMeta, OwnerReference, TypeMeta},
};
use std::{borrow::Cow, collections::BTreeMap};

/// An accessor trait for a tiller resource.
///
/// Types that know their kind information at compile time select
/// `DynamicType = ()`; [`DynamicObject`](crate::dynamic::DynamicObject)
/// carries an [`ApiResource`](crate::api_resource::ApiResource) instead.
pub trait Resource {
    /// Type information for kinds not known at compile time
    type DynamicType: Send + Sync + 'static;

    /// Returns the kind of this object
    fn kind(dt: &Self::DynamicType) -> Cow<'_, str>;
    /// Returns the API group of this object
    fn group(dt: &Self::DynamicType) -> Cow<'_, str>;
    /// Returns the version of this object
    fn version(dt: &Self::DynamicType) -> Cow<'_, str>;
    /// Returns the scope of this object's kind
    fn scope(dt: &Self::DynamicType) -> Scope;

    /// Returns the apiVersion of this object
    fn api_version(dt: &Self::DynamicType) -> Cow<'_, str> {
        let group = Self::group(dt);
        if group.is_empty() {
            return Self::version(dt);
        }
        let mut group = group.into_owned();
        group.push('/');
        group.push_str(&Self::version(dt));
        group.into()
    }

    /// Metadata that all persisted resources have
    fn meta(&self) -> &ObjectMeta;
    /// Metadata that all persisted resources have
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// The `TypeMeta` for this kind
    fn type_meta(dt: &Self::DynamicType) -> TypeMeta {
        TypeMeta {
            api_version: Self::api_version(dt).to_string(),
            kind: Self::kind(dt).to_string(),
        }
    }

    /// Generates a controller owner reference pointing to this resource.
    ///
    /// Returns `None` until the object has been persisted (name and uid set).
    fn controller_owner_ref(&self, dt: &Self::DynamicType) -> Option<OwnerReference> {
        let meta = self.meta();
        Some(OwnerReference {
            api_version: Self::api_version(dt).to_string(),
            kind: Self::kind(dt).to_string(),
            name: meta.name.clone()?,
            uid: meta.uid.clone()?,
            controller: true,
        })
    }
}

/// Helper methods for resources.
pub trait ResourceExt: Resource {
    /// Returns the name of the resource, falling back on an empty string
    fn name_any(&self) -> String;
    /// Returns the namespace of the resource
    fn namespace(&self) -> Option<String>;
    /// Returns the resource version, if persisted
    fn resource_version(&self) -> Option<String>;
    /// Returns the uid, if persisted
    fn uid(&self) -> Option<String>;
    /// Exposes the labels
    fn labels(&self) -> &BTreeMap<String, String>;
    /// Exposes the finalizer list
    fn finalizers(&self) -> &Vec<String>;
    /// Returns the controller owner reference, if one is set
    fn controller_owner(&self) -> Option<&OwnerReference>;
    /// Whether deletion has been requested for this object
    fn is_deleting(&self) -> bool;
}

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta().labels
    }

    fn finalizers(&self) -> &Vec<String> {
        &self.meta().finalizers
    }

    fn controller_owner(&self) -> Option<&OwnerReference> {
        self.meta().owner_references.iter().find(|r| r.controller)
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}
