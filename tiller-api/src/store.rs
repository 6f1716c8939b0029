//! The in-process object store: linearizable, versioned and watchable.
//!
//! All cluster state lives here, behind a single writer lock; every mutation
//! bumps a global revision and appends to a bounded per-kind event log from
//! which watch streams replay. The store knows nothing about authorization
//! or admission; the [`Gateway`](crate::gateway::Gateway) is its only
//! caller.
use ahash::HashMap;
use chrono::Utc;
use futures::Stream;
use parking_lot::RwLock;
use std::{collections::VecDeque, fmt, sync::Arc};
use tiller_core::{ApiResource, DynamicObject, ErrorResponse, Result, Scope, WatchEvent};

/// Identifies one object in the store
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ObjectKey {
    /// The `(api_version, kind)` pair, as produced by
    /// [`ApiResource::kind_key`]
    pub kind_key: String,
    /// Namespace for namespaced kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a named object of a kind
    pub fn new(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Self {
        let namespace = match resource.scope {
            Scope::Namespaced => namespace.map(String::from),
            Scope::Cluster => None,
        };
        Self {
            kind_key: resource.kind_key(),
            namespace,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind_key, ns, self.name),
            None => write!(f, "{} {}", self.kind_key, self.name),
        }
    }
}

struct EventLog {
    /// Retained `(revision, event)` pairs, oldest first
    events: VecDeque<(u64, WatchEvent<DynamicObject>)>,
    /// Highest revision dropped by compaction; watches from at or below
    /// this point fail with `Expired`
    compacted_to: u64,
    /// Signals the latest revision recorded for this kind
    notify: tokio::sync::watch::Sender<u64>,
}

impl EventLog {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            compacted_to: 0,
            notify: tokio::sync::watch::channel(0).0,
        }
    }
}

struct Inner {
    revision: u64,
    objects: HashMap<ObjectKey, DynamicObject>,
    logs: HashMap<String, EventLog>,
}

/// The single source of truth for all cluster objects.
///
/// Writes are conditional on the object's current `resourceVersion`
/// (compare-and-swap); this per-object check is the only synchronization
/// primitive the rest of the control plane relies on.
pub struct ObjectStore {
    inner: RwLock<Inner>,
    history_limit: usize,
}

impl ObjectStore {
    /// An empty store retaining `history_limit` watch events per kind
    pub fn new(history_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                revision: 0,
                objects: HashMap::default(),
                logs: HashMap::default(),
            }),
            history_limit,
        })
    }

    /// The revision of the most recent write
    pub fn latest_revision(&self) -> u64 {
        self.inner.read().revision
    }

    /// Fetch a single object
    pub fn get(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.inner.read().objects.get(key).cloned()
    }

    /// Snapshot all objects of a kind, optionally restricted to a
    /// namespace, together with the revision the snapshot was taken at
    pub fn list(&self, kind_key: &str, namespace: Option<&str>) -> (Vec<DynamicObject>, u64) {
        let inner = self.inner.read();
        let mut items: Vec<DynamicObject> = inner
            .objects
            .iter()
            .filter(|(key, _)| {
                key.kind_key == kind_key
                    && namespace.is_none_or(|ns| key.namespace.as_deref() == Some(ns))
            })
            .map(|(_, obj)| obj.clone())
            .collect();
        items.sort_by(|a, b| {
            (a.metadata.namespace.as_deref(), a.metadata.name.as_deref())
                .cmp(&(b.metadata.namespace.as_deref(), b.metadata.name.as_deref()))
        });
        (items, inner.revision)
    }

    /// Persist a new object; fails with `AlreadyExists` if the key is taken
    pub fn insert(&self, key: ObjectKey, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.inner.write();
        if inner.objects.contains_key(&key) {
            return Err(ErrorResponse::already_exists(format!("{key} already exists")));
        }
        inner.revision += 1;
        let revision = inner.revision;
        obj.metadata.resource_version = Some(revision.to_string());
        inner.objects.insert(key.clone(), obj.clone());
        self.record(&mut inner, &key.kind_key, revision, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    /// Replace an object, conditional on `expected_revision`.
    ///
    /// A write whose `expected_revision` does not match the stored object's
    /// current `resourceVersion` fails with `Conflict` and has no effect.
    /// If the replacement is marked deleting and its finalizer list is
    /// empty, the object is physically erased instead and a `Deleted` event
    /// is emitted.
    pub fn update(&self, key: ObjectKey, mut obj: DynamicObject, expected_revision: &str) -> Result<DynamicObject> {
        let mut inner = self.inner.write();
        let current = inner
            .objects
            .get(&key)
            .ok_or_else(|| ErrorResponse::not_found(format!("{key} not found")))?;
        let current_revision = current.metadata.resource_version.clone().unwrap_or_default();
        if current_revision != expected_revision {
            return Err(ErrorResponse::conflict(format!(
                "{key}: resourceVersion {expected_revision} is stale (current {current_revision})"
            )));
        }
        inner.revision += 1;
        let revision = inner.revision;
        obj.metadata.resource_version = Some(revision.to_string());

        if obj.metadata.deletion_timestamp.is_some() && obj.metadata.finalizers.is_empty() {
            inner.objects.remove(&key);
            self.record(&mut inner, &key.kind_key, revision, WatchEvent::Deleted(obj.clone()));
        } else {
            inner.objects.insert(key.clone(), obj.clone());
            self.record(&mut inner, &key.kind_key, revision, WatchEvent::Modified(obj.clone()));
        }
        Ok(obj)
    }

    /// Request deletion of an object.
    ///
    /// With finalizers present this only stamps `deletionTimestamp` (a
    /// `Modified` event); the object is physically erased once the last
    /// finalizer is removed. Without finalizers the object is erased
    /// immediately.
    pub fn delete(&self, key: &ObjectKey, precondition_revision: Option<&str>) -> Result<DynamicObject> {
        let mut inner = self.inner.write();
        let current = inner
            .objects
            .get(key)
            .ok_or_else(|| ErrorResponse::not_found(format!("{key} not found")))?
            .clone();
        if let Some(expected) = precondition_revision {
            let current_revision = current.metadata.resource_version.clone().unwrap_or_default();
            if current_revision != expected {
                return Err(ErrorResponse::conflict(format!(
                    "{key}: resourceVersion {expected} is stale (current {current_revision})"
                )));
            }
        }

        if current.metadata.deletion_timestamp.is_some() {
            // Deletion already in progress; waiting on finalizers
            return Ok(current);
        }

        inner.revision += 1;
        let revision = inner.revision;
        let mut obj = current;
        obj.metadata.resource_version = Some(revision.to_string());

        if obj.metadata.finalizers.is_empty() {
            inner.objects.remove(key);
            obj.metadata.deletion_timestamp = Some(Utc::now());
            self.record(&mut inner, &key.kind_key, revision, WatchEvent::Deleted(obj.clone()));
        } else {
            obj.metadata.deletion_timestamp = Some(Utc::now());
            inner.objects.insert(key.clone(), obj.clone());
            self.record(&mut inner, &key.kind_key, revision, WatchEvent::Modified(obj.clone()));
        }
        Ok(obj)
    }

    fn record(&self, inner: &mut Inner, kind_key: &str, revision: u64, event: WatchEvent<DynamicObject>) {
        let log = inner
            .logs
            .entry(kind_key.to_string())
            .or_insert_with(EventLog::new);
        log.events.push_back((revision, event));
        while log.events.len() > self.history_limit {
            if let Some((dropped, _)) = log.events.pop_front() {
                log.compacted_to = dropped;
            }
        }
        log.notify.send_replace(revision);
    }

    fn subscribe(&self, kind_key: &str) -> tokio::sync::watch::Receiver<u64> {
        let mut inner = self.inner.write();
        inner
            .logs
            .entry(kind_key.to_string())
            .or_insert_with(EventLog::new)
            .notify
            .subscribe()
    }

    /// Events with revision strictly greater than `after`, or `Expired` if
    /// compaction has dropped part of that range
    fn events_since(&self, kind_key: &str, after: u64) -> Result<Vec<(u64, WatchEvent<DynamicObject>)>> {
        let inner = self.inner.read();
        let Some(log) = inner.logs.get(kind_key) else {
            return Ok(Vec::new());
        };
        if after < log.compacted_to {
            return Err(ErrorResponse::expired(format!(
                "revision {after} compacted (oldest retained is {})",
                log.compacted_to + 1
            )));
        }
        Ok(log
            .events
            .iter()
            .filter(|(revision, _)| *revision > after)
            .cloned()
            .collect())
    }

    /// An ordered, gap-free stream of events for one kind, starting after
    /// `from_revision`.
    ///
    /// The stream terminates with an `Expired` error when the requested
    /// window has been compacted away; the caller must re-list and start a
    /// fresh watch from the list revision.
    pub fn watch(
        self: Arc<Self>,
        kind_key: &str,
        from_revision: u64,
    ) -> impl Stream<Item = Result<WatchEvent<DynamicObject>>> + Send {
        let kind_key = kind_key.to_string();
        async_stream::stream! {
            let mut rx = self.subscribe(&kind_key);
            let mut last = from_revision;
            loop {
                match self.events_since(&kind_key, last) {
                    Ok(batch) => {
                        for (revision, event) in batch {
                            last = revision;
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
                if *rx.borrow_and_update() > last {
                    continue;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
