//! Finalizer helper for reconcilers that must clean up before deletion.
//!
//! A client delete is itself an object mutation: the gateway stamps
//! `deletionTimestamp` and leaves the object in place while finalizers
//! remain. This helper manages one finalizer entry so a reconciler's
//! cleanup is guaranteed to run before the object is physically erased.
use crate::controller::Action;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, future::Future, sync::Arc};
use tiller_api::Api;
use tiller_core::{ErrorResponse, Resource, ResourceExt};

/// The reconciliation the helper selected for this pass
pub enum Event<K> {
    /// Converge actual state toward the object's desired state.
    ///
    /// Must be idempotent: it re-runs on every wake of a live object.
    Apply(Arc<K>),
    /// The object is being deleted; remove everything the reconciler owns.
    ///
    /// Must be idempotent and must succeed before the finalizer (and with
    /// it, the object) can go away.
    Cleanup(Arc<K>),
}

/// Reconcile `obj` while maintaining `finalizer_name` on it.
///
/// Flow: a live object without the finalizer gets it added (via a
/// compare-and-swap replace; the write retriggers reconciliation); a live
/// object with it runs [`Event::Apply`]; a deleting object with it runs
/// [`Event::Cleanup`] and, only on success, removes the finalizer so the
/// store can erase the object; a deleting object without it is done.
///
/// Losing the compare-and-swap to a concurrent writer surfaces as a
/// `Conflict`, which the controller loop retries with backoff.
pub async fn finalizer<K, ReconcileFut>(
    api: &Api<K>,
    finalizer_name: &str,
    obj: Arc<K>,
    reconcile: impl FnOnce(Event<K>) -> ReconcileFut,
) -> Result<Action, ErrorResponse>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug,
    ReconcileFut: Future<Output = Result<Action, ErrorResponse>>,
{
    let present = obj.finalizers().iter().any(|f| f == finalizer_name);
    match (present, obj.is_deleting()) {
        (true, false) => reconcile(Event::Apply(obj)).await,
        (true, true) => {
            // cleanup must succeed before it is safe to drop the finalizer
            let action = reconcile(Event::Cleanup(obj.clone())).await?;
            let mut updated = (*obj).clone();
            updated.meta_mut().finalizers.retain(|f| f != finalizer_name);
            api.replace(&updated).await?;
            Ok(action)
        }
        (false, false) => {
            let mut updated = (*obj).clone();
            updated.meta_mut().finalizers.push(finalizer_name.to_string());
            api.replace(&updated).await?;
            // no point applying now; the write causes a fresh reconciliation
            Ok(Action::await_change())
        }
        (false, true) => Ok(Action::await_change()),
    }
}
