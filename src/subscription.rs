//! `executeSubscription` (spec §4.8, component 9): translate `transport.ws`
//! frames into normalize+notify cycles. Not subscription multiplexing — one
//! call here drives exactly one transport stream (spec §1 Non-goals).

use std::rc::Rc;

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::documents::fingerprint::HotCache;
use crate::documents::normalize::normalize;
use crate::error::{CacheError, CombinedError};
use crate::graph::Graph;
use crate::planner::{Plan, Variables};
use crate::watch::WatcherRegistry;

/// A running subscription. Dropping this does not cancel it — call
/// `unsubscribe()`, mirroring `QueryHandle`/`FragmentHandle` (spec §4.7
/// "cancellation via handle unsubscription").
pub struct SubscriptionHandle {
    task: tokio::task::JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        self.task.abort();
    }
}

/// Spawn a task (via `tokio::task::spawn_local`, so this must run inside a
/// `LocalSet`) that normalizes each frame from `frames` and dispatches the
/// coalesced dirty set to `registry` — one normalize+flush+notify cycle per
/// frame, exactly as `executeQuery`/`executeMutation` do for a single
/// response.
pub fn execute_subscription<S>(
    graph: Rc<Graph>,
    hot_cache: Rc<HotCache>,
    registry: Rc<WatcherRegistry>,
    document: String,
    plan: Rc<Plan>,
    variables: Variables,
    frames: S,
    on_error: Rc<dyn Fn(CacheError)>,
) -> SubscriptionHandle
where
    S: Stream<Item = Result<Value, CombinedError>> + Unpin + 'static,
{
    let task = tokio::task::spawn_local(async move {
        let mut frames = frames;
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(data) => match normalize(&graph, &hot_cache, &document, &plan, &variables, &data) {
                    Ok(_) => {
                        let dirty = graph.flush();
                        registry.notify_flush(&dirty);
                    }
                    Err(err) => on_error(err),
                },
                Err(combined) => on_error(CacheError::from(combined)),
            }
        }
    });
    SubscriptionHandle { task }
}
