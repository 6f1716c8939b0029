//! Watches a collection for changes, with error recovery.
//!
//! The watcher is level-triggered: it opens with a full list (emitted as
//! [`Event::Restarted`]) and re-lists whenever the underlying watch stream
//! expires or fails, so consumers can always rebuild complete state instead
//! of trusting deltas. Transient errors are retried internally with
//! jittered exponential backoff.
use crate::utils::{default_backoff, next_delay};
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::{stream::BoxStream, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tiller_api::Api;
use tiller_core::{ListParams, Reason, Resource, Result, WatchEvent};
use tracing::{debug, warn};

/// Watch events returned from the [`watcher`]
#[derive(Debug, Clone)]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted.
    ///
    /// NOTE: not reliable for managing persistent state elsewhere, since
    /// deletions may be missed across a re-list. Use finalizers instead.
    Deleted(K),
    /// The stream was (re)started; the payload is the complete current
    /// collection. Objects previously applied but absent from the payload
    /// must be treated as deleted.
    Restarted(Vec<K>),
}

/// The internal finite state machine driving the [`watcher`]
enum State<K> {
    /// Next poll performs the initial or recovery list
    Empty,
    /// The list succeeded; next poll opens the watch stream
    Listed { revision: u64 },
    /// Events are flowing
    Watching {
        stream: BoxStream<'static, Result<WatchEvent<K>>>,
    },
}

/// Progresses the watcher one step, returning `(event, next_state)`.
///
/// Trampolined by [`step`]: a `None` event means "no output yet, poll
/// again with the new state".
async fn step_trampolined<K>(
    api: &Api<K>,
    params: &ListParams,
    state: State<K>,
    backoff: &mut ExponentialBackoff,
) -> (Option<Event<K>>, State<K>)
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug + Send + 'static,
{
    match state {
        State::Empty => match api.list(params).await {
            Ok(list) => {
                backoff.reset();
                let revision = list
                    .metadata
                    .resource_version
                    .as_deref()
                    .and_then(|rv| rv.parse().ok())
                    .unwrap_or_default();
                (Some(Event::Restarted(list.items)), State::Listed { revision })
            }
            Err(err) => {
                warn!(error = %err, "failed to list, backing off");
                tokio::time::sleep(next_delay(backoff)).await;
                (None, State::Empty)
            }
        },
        State::Listed { revision } => match api.watch(revision) {
            Ok(stream) => (None, State::Watching { stream: stream.boxed() }),
            Err(err) => {
                warn!(error = %err, "failed to start watch, backing off");
                tokio::time::sleep(next_delay(backoff)).await;
                (None, State::Empty)
            }
        },
        State::Watching { mut stream } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj)) | Ok(WatchEvent::Modified(obj))) => {
                backoff.reset();
                (Some(Event::Applied(obj)), State::Watching { stream })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                backoff.reset();
                (Some(Event::Deleted(obj)), State::Watching { stream })
            }
            Some(Err(err)) if err.reason == Reason::Expired => {
                // we desynced past the store's retained history; the only
                // correct recovery is a full re-list
                debug!(error = %err, "watch expired, re-listing");
                (None, State::Empty)
            }
            Some(Err(err)) => {
                warn!(error = %err, "watch stream failed, backing off");
                tokio::time::sleep(next_delay(backoff)).await;
                (None, State::Empty)
            }
            None => {
                tokio::time::sleep(next_delay(backoff)).await;
                (None, State::Empty)
            }
        },
    }
}

/// Trampoline helper for [`step_trampolined`]
async fn step<K>(
    api: &Api<K>,
    params: &ListParams,
    mut state: State<K>,
    backoff: &mut ExponentialBackoff,
) -> (Event<K>, State<K>)
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug + Send + 'static,
{
    loop {
        match step_trampolined(api, params, state, backoff).await {
            (Some(event), new_state) => return (event, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a collection continuously, recovering from expiry and errors.
///
/// After any gap the stream emits a fresh [`Event::Restarted`] so a
/// consumer that replaces its state atomically on restarts converges to
/// the same end state as if no disconnection occurred.
pub fn watcher<K>(api: Api<K>, params: ListParams) -> impl Stream<Item = Event<K>> + Send
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static,
{
    futures::stream::unfold(
        (api, params, State::Empty, default_backoff()),
        |(api, params, state, mut backoff)| async {
            let (event, state) = step(&api, &params, state, &mut backoff).await;
            Some((event, (api, params, state, backoff)))
        },
    )
}
