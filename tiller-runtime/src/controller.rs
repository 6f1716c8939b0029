//! The shared reconciliation loop every controller instance runs on.
//!
//! On each wake (a watch event or the periodic resync timer, which exists
//! precisely to repair missed events) the loop hands the object's current
//! cached state to the reconciler, which re-reads whatever else it needs,
//! diffs against desired state and issues the minimal corrective writes.
//! Reconcilers must be idempotent: replaying an unchanged state must
//! produce zero additional writes.
//!
//! A reconciliation error never stops the loop; the object is requeued
//! with jittered exponential backoff and everything else proceeds.
use crate::{
    reflector::{ObjectRef, Store, Writer},
    requeue::RequeueQueue,
    utils::error_backoff,
    watcher::{watcher, Event},
};
use ahash::HashMap;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, future::Future, pin::pin, sync::Arc, time::Duration};
use tiller_api::Api;
use tiller_core::{ErrorResponse, ListParams, Resource};
use tracing::{debug, warn};

/// What a reconciler wants to happen next for the object it just handled
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Do nothing until a watch event or the resync timer wakes the object
    /// again
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    /// Wake the object again after `duration`, even without changes
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// The requested requeue delay, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Static controller configuration, fixed at process start
#[derive(Clone, Debug)]
pub struct Config {
    /// Interval of the full-state resync that repairs missed watch events
    pub resync_interval: Duration,
    /// First retry delay after a reconciliation error
    pub error_backoff_base: Duration,
    /// Retry delay cap for persistently failing objects
    pub error_backoff_max: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(300),
            error_backoff_base: Duration::from_millis(500),
            error_backoff_max: Duration::from_secs(60),
        }
    }
}

/// A reconciliation loop over one watched collection
pub struct Controller<K> {
    api: Api<K>,
    params: ListParams,
    config: Config,
}

impl<K> Controller<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static,
{
    /// A controller over everything the api handle is scoped to
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            params: ListParams::default(),
            config: Config::default(),
        }
    }

    /// Restrict the watched collection
    #[must_use]
    pub fn with_params(mut self, params: ListParams) -> Self {
        self.params = params;
        self
    }

    /// Override loop timings
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Runs the loop until the process ends.
    ///
    /// `reconcile` is called with the object's latest cached state;
    /// `error_policy` decides the retry delay for a failed object (an
    /// [`Action::await_change`] result defers to the loop's own
    /// exponential backoff).
    pub async fn run<Ctx, ReconcileFut>(
        self,
        reconcile: impl Fn(Arc<K>, Arc<Ctx>) -> ReconcileFut,
        error_policy: impl Fn(Arc<K>, &ErrorResponse, Arc<Ctx>) -> Action,
        ctx: Arc<Ctx>,
    ) where
        Ctx: Send + Sync + 'static,
        ReconcileFut: Future<Output = Result<Action, ErrorResponse>>,
    {
        let mut events = pin!(watcher(self.api.clone(), self.params.clone()));
        let mut writer = Writer::<K>::default();
        let store: Store<K> = writer.as_reader();
        let mut queue: RequeueQueue<ObjectRef> = RequeueQueue::new();
        let mut failures: HashMap<ObjectRef, u32> = HashMap::default();

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick fires immediately; the watcher's initial restart
        // already enqueues everything
        resync.tick().await;

        loop {
            tokio::select! {
                Some(event) = events.next() => {
                    writer.apply_watcher_event(&event);
                    match &event {
                        Event::Applied(obj) | Event::Deleted(obj) => {
                            queue.insert(ObjectRef::from_obj(obj), Duration::ZERO);
                        }
                        Event::Restarted(objs) => {
                            for obj in objs {
                                queue.insert(ObjectRef::from_obj(obj), Duration::ZERO);
                            }
                        }
                    }
                }
                _ = resync.tick() => {
                    debug!(count = store.len(), "resync: requeueing full cached state");
                    for obj_ref in store.refs() {
                        queue.insert(obj_ref, Duration::ZERO);
                    }
                }
                obj_ref = queue.next() => {
                    let Some(obj) = store.get(&obj_ref) else {
                        // deleted since it was queued; cleanup, if any, ran
                        // through its finalizer while the object still existed
                        failures.remove(&obj_ref);
                        continue;
                    };
                    match reconcile(obj.clone(), ctx.clone()).await {
                        Ok(action) => {
                            failures.remove(&obj_ref);
                            if let Some(delay) = action.requeue_after() {
                                queue.insert(obj_ref, delay);
                            }
                        }
                        Err(err) => {
                            let count = failures.entry(obj_ref.clone()).or_insert(0);
                            *count += 1;
                            warn!(object = %obj_ref, error = %err, failures = *count, "reconciliation failed, requeueing");
                            let delay = error_policy(obj, &err, ctx.clone())
                                .requeue_after()
                                .unwrap_or_else(|| error_backoff(
                                    *count,
                                    self.config.error_backoff_base,
                                    self.config.error_backoff_max,
                                ));
                            queue.insert(obj_ref, delay);
                        }
                    }
                }
            }
        }
    }
}
