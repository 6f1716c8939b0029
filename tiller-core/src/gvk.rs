//! Type information structs for API group/version/kind discrimination.
use crate::metadata::TypeMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to parse a `TypeMeta` into a [`GroupVersionKind`]
#[derive(Debug, Error)]
#[error("failed to parse group version: {0}")]
pub struct ParseGroupVersionError(String);

/// Core information about a family of API objects
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl GroupVersionKind {
    /// Construct from explicit group, version and kind
    pub fn gvk(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// The `apiVersion` wire form: `group/version`, or bare `version` for
    /// the legacy core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl TryFrom<&TypeMeta> for GroupVersionKind {
    type Error = ParseGroupVersionError;

    fn try_from(tm: &TypeMeta) -> Result<Self, Self::Error> {
        let (group, version) = match tm.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None if !tm.api_version.is_empty() => ("", tm.api_version.as_str()),
            None => return Err(ParseGroupVersionError(tm.api_version.clone())),
        };
        if version.is_empty() || version.contains('/') {
            return Err(ParseGroupVersionError(tm.api_version.clone()));
        }
        Ok(Self::gvk(group, version, &tm.kind))
    }
}
