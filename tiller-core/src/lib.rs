//! Crate with the types and traits shared by every tiller component.
//!
//! This crate is the store-less half of the control plane: the object
//! envelope, the built-in kinds, label selection, the watch event type and
//! the error taxonomy. The same information is re-exported from `tiller`
//! under `tiller::core`.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod api_resource;
pub use api_resource::{ApiResource, Scope};

pub mod dynamic;
pub use dynamic::DynamicObject;

pub mod gvk;
pub use gvk::GroupVersionKind;

pub mod kinds;

pub mod labels;
pub use labels::{Expression, Selector};

pub mod metadata;
pub use metadata::{ListMeta, ObjectMeta, OwnerReference, TypeMeta};

pub mod object;
pub use object::ObjectList;

pub mod params;
pub use params::{DeleteParams, ListParams};

mod resource;
pub use resource::{Resource, ResourceExt};

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::{ErrorResponse, Reason};

/// Convenient alias for `Result<T, ErrorResponse>`
pub type Result<T, E = ErrorResponse> = std::result::Result<T, E>;
