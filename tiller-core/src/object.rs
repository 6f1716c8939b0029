//! Generic object list wrapper returned by list calls.
use crate::metadata::ListMeta;
use serde::{Deserialize, Serialize};

/// A generic list of objects of one kind
///
/// Produced by list queries; its `metadata.resource_version` is the store
/// revision the snapshot was taken at, suitable for starting a watch.
#[derive(Serialize, Deserialize, Debug)]
pub struct ObjectList<T>
where
    T: Clone,
{
    /// Only really used for its `resourceVersion`
    pub metadata: ListMeta,

    /// The items we are actually interested in
    #[serde(bound(deserialize = "Vec<T>: Deserialize<'de>"))]
    pub items: Vec<T>,
}

impl<T: Clone> ObjectList<T> {
    /// Returns an Iterator over the elements of this ObjectList
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: Clone> IntoIterator for ObjectList<T> {
    type IntoIter = std::vec::IntoIter<Self::Item>;
    type Item = T;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T: Clone> IntoIterator for &'a ObjectList<T> {
    type IntoIter = std::slice::Iter<'a, T>;
    type Item = &'a T;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
