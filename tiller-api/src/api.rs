//! The typed API surface over the gateway.
use crate::client::Client;
use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, marker::PhantomData};
use tiller_core::{
    ApiResource, DeleteParams, DynamicObject, ErrorResponse, ListMeta, ListParams, ObjectList,
    Resource, Result, WatchEvent,
};

/// A typed handle on one kind, optionally scoped to a namespace.
///
/// The dynamic representation is an implementation detail of the gateway;
/// this is the surface controllers and agents program against.
#[derive(Clone)]
pub struct Api<K> {
    client: Client,
    namespace: Option<String>,
    resource: ApiResource,
    _phantom: PhantomData<K>,
}

impl<K> Api<K>
where
    K: Resource<DynamicType = ()>,
{
    /// A handle scoped to one namespace
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: Some(namespace.to_string()),
            resource: ApiResource::erase::<K>(),
            _phantom: PhantomData,
        }
    }

    /// A cluster-wide handle: cluster-scoped kinds, or namespaced kinds
    /// across every namespace
    pub fn all(client: Client) -> Self {
        Self {
            client,
            namespace: None,
            resource: ApiResource::erase::<K>(),
            _phantom: PhantomData,
        }
    }

    /// The namespace this handle is scoped to
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl<K> Api<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug,
{
    fn to_dynamic(&self, obj: &K) -> Result<DynamicObject> {
        DynamicObject::from_typed(obj).map_err(|err| ErrorResponse::invalid(err.to_string()))
    }

    fn from_dynamic(&self, obj: DynamicObject) -> Result<K> {
        obj.try_parse()
            .map_err(|err| ErrorResponse::invalid(format!("stored object failed to parse: {err}")))
    }

    /// Fetch one object by name
    pub async fn get(&self, name: &str) -> Result<K> {
        let obj = self.client.gateway().get(
            self.client.identity(),
            &self.resource.kind,
            self.namespace.as_deref(),
            name,
        )?;
        self.from_dynamic(obj)
    }

    /// Fetch one object, mapping `NotFound` to `None`
    pub async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        match self.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.reason == tiller_core::Reason::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Snapshot the collection this handle is scoped to
    pub async fn list(&self, params: &ListParams) -> Result<ObjectList<K>> {
        let (items, revision) = self.client.gateway().list(
            self.client.identity(),
            &self.resource.kind,
            self.namespace.as_deref(),
            params,
        )?;
        let items = items
            .into_iter()
            .map(|obj| self.from_dynamic(obj))
            .collect::<Result<Vec<_>>>()?;
        Ok(ObjectList {
            metadata: ListMeta {
                resource_version: Some(revision.to_string()),
            },
            items,
        })
    }

    /// Persist a new object
    pub async fn create(&self, obj: &K) -> Result<K> {
        let dynamic = self.to_dynamic(obj)?;
        let created = self
            .client
            .gateway()
            .create(self.client.identity(), self.namespace.as_deref(), dynamic)?;
        self.from_dynamic(created)
    }

    /// Replace an object's client-owned state (CAS on `resourceVersion`)
    pub async fn replace(&self, obj: &K) -> Result<K> {
        let dynamic = self.to_dynamic(obj)?;
        let updated = self
            .client
            .gateway()
            .update(self.client.identity(), self.namespace.as_deref(), dynamic)?;
        self.from_dynamic(updated)
    }

    /// Replace an object's controller-owned state (CAS on
    /// `resourceVersion`)
    pub async fn replace_status(&self, obj: &K) -> Result<K> {
        let dynamic = self.to_dynamic(obj)?;
        let updated = self
            .client
            .gateway()
            .update_status(self.client.identity(), self.namespace.as_deref(), dynamic)?;
        self.from_dynamic(updated)
    }

    /// Request deletion of an object by name
    pub async fn delete(&self, name: &str) -> Result<K> {
        self.delete_with(name, &DeleteParams::default()).await
    }

    /// Request deletion with explicit parameters
    pub async fn delete_with(&self, name: &str, params: &DeleteParams) -> Result<K> {
        let deleted = self.client.gateway().delete(
            self.client.identity(),
            &self.resource.kind,
            self.namespace.as_deref(),
            name,
            params,
        )?;
        self.from_dynamic(deleted)
    }

    /// Voluntarily evict a workload unit, subject to disruption budgets
    pub async fn evict(&self, name: &str) -> Result<()> {
        let namespace = self
            .namespace
            .as_deref()
            .ok_or_else(|| ErrorResponse::invalid("evict requires a namespaced handle"))?;
        self.client
            .gateway()
            .evict(self.client.identity(), namespace, name)?;
        Ok(())
    }

    /// Stream events for this collection, starting after `from_revision`.
    ///
    /// The stream ends after yielding an `Expired` error; re-list and
    /// resume from the fresh list revision.
    pub fn watch(&self, from_revision: u64) -> Result<impl Stream<Item = Result<WatchEvent<K>>> + Send>
    where
        K: Send + 'static,
    {
        let stream = self.client.gateway().watch(
            self.client.identity(),
            &self.resource.kind,
            self.namespace.clone(),
            from_revision,
        )?;
        Ok(stream.map(|item| {
            item.and_then(|event| {
                let parsed = event.object().try_parse::<K>().map_err(|err| {
                    ErrorResponse::invalid(format!("stored object failed to parse: {err}"))
                })?;
                Ok(event.map(|_| parsed))
            })
        }))
    }
}
