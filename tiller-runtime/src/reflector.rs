//! An in-memory cache of a watched collection.
//!
//! The cache is not authoritative: it is rebuilt from List/Watch and may be
//! stale. Reconcilers that need certainty re-read through the API and rely
//! on the store's compare-and-swap writes.
use crate::watcher;
use ahash::HashMap;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tiller_core::{Resource, ResourceExt};

/// Identifies one object within a watched collection (the kind is implied
/// by the collection)
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ObjectRef {
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectRef {
    /// Reference a named object in an optional namespace
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(String::from),
            name: name.to_string(),
        }
    }

    /// The reference of an object
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

type Cache<K> = Arc<RwLock<HashMap<ObjectRef, Arc<K>>>>;

/// The writable side of a reflector cache.
///
/// Exclusive: exactly one watcher feeds a writer, since `Restarted` events
/// replace the cache wholesale.
pub struct Writer<K> {
    cache: Cache<K>,
}

impl<K> Default for Writer<K> {
    fn default() -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::default())),
        }
    }
}

impl<K: Resource + Clone> Writer<K> {
    /// Return a read handle to the cache
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            cache: self.cache.clone(),
        }
    }

    /// Applies a single watcher event to the cache
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Applied(obj) => {
                self.cache
                    .write()
                    .insert(ObjectRef::from_obj(obj), Arc::new(obj.clone()));
            }
            watcher::Event::Deleted(obj) => {
                self.cache.write().remove(&ObjectRef::from_obj(obj));
            }
            watcher::Event::Restarted(objs) => {
                let replacement: HashMap<ObjectRef, Arc<K>> = objs
                    .iter()
                    .map(|obj| (ObjectRef::from_obj(obj), Arc::new(obj.clone())))
                    .collect();
                *self.cache.write() = replacement;
            }
        }
    }
}

/// A readable cache of objects of kind `K`.
///
/// Cloning produces another handle onto the same backing cache.
pub struct Store<K> {
    cache: Cache<K>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<K> Store<K> {
    /// Retrieve the cached entry for a reference, if present
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        self.cache.read().get(key).cloned()
    }

    /// References of everything currently cached
    pub fn refs(&self) -> Vec<ObjectRef> {
        self.cache.read().keys().cloned().collect()
    }

    /// A full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.cache.read().values().cloned().collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::Event;
    use tiller_core::kinds::WorkloadUnit;

    fn unit(name: &str) -> WorkloadUnit {
        let mut unit = WorkloadUnit::new(name);
        unit.metadata.namespace = Some("default".into());
        unit
    }

    #[test]
    fn applies_and_removes() {
        let mut writer = Writer::default();
        let store = writer.as_reader();
        writer.apply_watcher_event(&Event::Applied(unit("a")));
        assert_eq!(store.len(), 1);
        assert!(store.get(&ObjectRef::new(Some("default"), "a")).is_some());

        writer.apply_watcher_event(&Event::Deleted(unit("a")));
        assert!(store.is_empty());
    }

    #[test]
    fn restart_replaces_the_cache_atomically() {
        let mut writer = Writer::default();
        let store = writer.as_reader();
        writer.apply_watcher_event(&Event::Applied(unit("stale")));
        writer.apply_watcher_event(&Event::Restarted(vec![unit("a"), unit("b")]));
        assert_eq!(store.len(), 2);
        // objects absent from the restart are treated as deleted
        assert!(store.get(&ObjectRef::new(Some("default"), "stale")).is_none());
    }
}
