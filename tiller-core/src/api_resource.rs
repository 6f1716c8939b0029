//! Runtime information about an API resource kind.
use crate::{gvk::GroupVersionKind, resource::Resource};
use serde::{Deserialize, Serialize};

/// Whether a kind lives in a namespace or at cluster level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Objects of the kind carry a namespace
    Namespaced,
    /// Objects of the kind are cluster-global (e.g. `Node`)
    Cluster,
}

/// Information about a kind, usable for dynamic dispatch on `kind`.
///
/// The gateway's kind registry is a lookup table of these; components that
/// handle objects of unknown compile-time type branch on an `ApiResource`
/// rather than on concrete types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiResource {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
    /// The `group/version` wire form
    pub api_version: String,
    /// Singular PascalCase kind name
    pub kind: String,
    /// Scope of the kind
    pub scope: Scope,
}

impl ApiResource {
    /// Creates an ApiResource by type-erasing a statically known kind
    pub fn erase<K: Resource<DynamicType = ()>>() -> Self {
        Self {
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            scope: K::scope(&()),
        }
    }

    /// Creates an ApiResource from a GroupVersionKind, assuming namespaced
    /// scope unless overridden with [`ApiResource::cluster_scoped`]
    pub fn from_gvk(gvk: &GroupVersionKind) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
            scope: Scope::Namespaced,
        }
    }

    /// Marks the resource as cluster-scoped
    #[must_use]
    pub fn cluster_scoped(mut self) -> Self {
        self.scope = Scope::Cluster;
        self
    }

    /// The `(api_version, kind)` pair keying the store's per-kind state
    pub fn kind_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}
