//! Watcher dispatch and take-latest network dedup (spec §4.7).
//!
//! Two independent mechanisms live here: [`WatcherRegistry`] re-materializes
//! and notifies watchers after a graph flush, and [`NetworkScheduler`]
//! coalesces concurrent network calls per operation family.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::documents::fingerprint::DepSet;
use crate::error::{CacheError, CombinedError, StaleResponse, TelemetryEvent};

pub type WatcherId = u64;

/// What one watcher re-runs on dispatch: re-materialize and return the
/// rendered value, the dependency set it touched, and a fingerprint used to
/// suppress no-op emissions.
type Rematerialize = dyn Fn() -> Result<(Value, DepSet, String), CacheError>;

struct WatcherEntry {
    id: WatcherId,
    deps: RefCell<DepSet>,
    rematerialize: Box<Rematerialize>,
    last_fingerprint: RefCell<Option<String>>,
    on_data: Rc<dyn Fn(Value)>,
    on_error: Rc<dyn Fn(CacheError)>,
}

/// Owns every live `watchQuery`/`watchFragment` subscription for one client
/// instance (spec §4.7).
pub struct WatcherRegistry {
    next_id: Cell<WatcherId>,
    watchers: RefCell<IndexMap<WatcherId, Rc<WatcherEntry>>>,
    on_telemetry: Option<Rc<dyn Fn(TelemetryEvent)>>,
}

impl WatcherRegistry {
    pub fn new(on_telemetry: Option<Rc<dyn Fn(TelemetryEvent)>>) -> Self {
        Self {
            next_id: Cell::new(0),
            watchers: RefCell::new(IndexMap::new()),
            on_telemetry,
        }
    }

    pub fn register(
        &self,
        rematerialize: impl Fn() -> Result<(Value, DepSet, String), CacheError> + 'static,
        on_data: Rc<dyn Fn(Value)>,
        on_error: Rc<dyn Fn(CacheError)>,
    ) -> WatcherId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let entry = Rc::new(WatcherEntry {
            id,
            deps: RefCell::new(DepSet::new()),
            rematerialize: Box::new(rematerialize),
            last_fingerprint: RefCell::new(None),
            on_data,
            on_error,
        });
        self.watchers.borrow_mut().insert(id, entry);
        id
    }

    pub fn unsubscribe(&self, id: WatcherId) {
        self.watchers.borrow_mut().shift_remove(&id);
    }

    pub fn clear(&self) {
        self.watchers.borrow_mut().clear();
    }

    /// Run a watcher immediately, outside of a flush dispatch (used for
    /// `watchQuery`'s `immediate` option and for the first run after
    /// `register`).
    pub fn emit_now(&self, id: WatcherId) {
        self.run_one(id);
    }

    /// Re-materialize every watcher whose dependency set intersects `dirty`
    /// (spec §4.7: "for each watcher whose dependency set intersects the
    /// dirty set, re-materialize").
    pub fn notify_flush(&self, dirty: &DepSet) {
        let ids: Vec<WatcherId> = self
            .watchers
            .borrow()
            .iter()
            .filter(|(_, w)| w.deps.borrow().iter().any(|dep| dirty.contains(dep)))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.run_one(id);
        }
    }

    /// Re-materialize every registered watcher unconditionally, regardless
    /// of its dependency set — used by `evictAll` (spec §4.7: "query
    /// watchers emit `undefined`... fragment watchers emit `undefined`").
    pub fn notify_all(&self) {
        let ids: Vec<WatcherId> = self.watchers.borrow().keys().copied().collect();
        for id in ids {
            self.run_one(id);
        }
    }

    fn run_one(&self, id: WatcherId) {
        let entry = self.watchers.borrow().get(&id).cloned();
        let Some(entry) = entry else { return };
        match (entry.rematerialize)() {
            Ok((data, deps, fingerprint)) => {
                *entry.deps.borrow_mut() = deps;
                let changed = entry.last_fingerprint.borrow().as_deref() != Some(fingerprint.as_str());
                if changed {
                    *entry.last_fingerprint.borrow_mut() = Some(fingerprint);
                    self.invoke(&entry, || (entry.on_data)(data));
                }
            }
            Err(err) => {
                let on_error = entry.on_error.clone();
                self.invoke(&entry, || on_error(err));
            }
        }
    }

    /// A watcher callback is isolated (spec §7 `NotifyFailure`): a panic or
    /// error inside it must not prevent the rest of the dispatch from
    /// running. Surfaced as telemetry rather than propagated.
    fn invoke(&self, entry: &WatcherEntry, call: impl FnOnce()) {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(call)).is_err() {
            if let Some(telemetry) = &self.on_telemetry {
                telemetry(TelemetryEvent::NotifyFailure(format!("watcher {} callback panicked", entry.id)));
            }
        }
    }
}

/// The outcome of [`NetworkScheduler::run`]: the settled value (or error),
/// plus whether this call's result is the authoritative terminal result for
/// its concurrency scope. `stale` carries the internal reason when it isn't
/// (`publish` is `false`) — never surfaced as a `CacheError`, since the
/// caller still gets its own fetched value in `result`.
pub struct TakeLatestOutcome {
    pub result: Result<Value, CacheError>,
    pub publish: bool,
    pub(crate) stale: Option<StaleResponse>,
}

struct InflightEntry {
    result: RefCell<Option<(Result<Value, CacheError>, bool)>>,
    notify: tokio::sync::Notify,
}

/// Take-latest per operation family (spec §4.7, §8 scenario 4).
///
/// Two independent mechanisms: exact-duplicate concurrent calls for the same
/// family (same document + variables + concurrency scope) single-flight —
/// only the first caller ("leader") actually invokes `fetch`, later callers
/// ("followers") await its result. Separately, a `concurrencyScope` can
/// group calls with *different* variables (paginated continuations) so that
/// only the most recently started call's result is treated as authoritative;
/// `allow_replay_on_stale` bypasses that so every continuation page still
/// publishes and can be folded into its canonical connection.
#[derive(Default)]
pub struct NetworkScheduler {
    inflight: RefCell<IndexMap<String, Rc<InflightEntry>>>,
    scopes: RefCell<IndexMap<String, Rc<Cell<u64>>>>,
}

impl NetworkScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope_generation(&self, scope: &str) -> Rc<Cell<u64>> {
        self.scopes
            .borrow_mut()
            .entry(scope.to_string())
            .or_insert_with(|| Rc::new(Cell::new(0)))
            .clone()
    }

    pub async fn run(
        &self,
        family: &str,
        concurrency_scope: &str,
        allow_replay_on_stale: bool,
        fetch: impl std::future::Future<Output = Result<Value, CombinedError>>,
    ) -> TakeLatestOutcome {
        if let Some(entry) = self.inflight.borrow().get(family).cloned() {
            loop {
                if let Some((result, publish)) = entry.result.borrow().clone() {
                    let stale = (!publish).then_some(StaleResponse);
                    return TakeLatestOutcome { result, publish, stale };
                }
                entry.notify.notified().await;
            }
        }

        let entry = Rc::new(InflightEntry {
            result: RefCell::new(None),
            notify: tokio::sync::Notify::new(),
        });
        self.inflight.borrow_mut().insert(family.to_string(), entry.clone());

        let generation = self.scope_generation(concurrency_scope);
        let my_generation = generation.get() + 1;
        generation.set(my_generation);

        let result = fetch.await.map_err(CacheError::from);
        let publish = allow_replay_on_stale || my_generation == generation.get();

        self.inflight.borrow_mut().shift_remove(family);
        *entry.result.borrow_mut() = Some((result.clone(), publish));
        entry.notify.notify_waiters();

        let stale = (!publish).then_some(StaleResponse);
        TakeLatestOutcome { result, publish, stale }
    }

    pub fn clear(&self) {
        self.inflight.borrow_mut().clear();
        self.scopes.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell as StdRefCell;

    #[tokio::test]
    async fn take_latest_leader_and_follower_see_same_result() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let scheduler = Rc::new(NetworkScheduler::new());

                let leader = {
                    let scheduler = scheduler.clone();
                    tokio::task::spawn_local(async move {
                        scheduler
                            .run("fam", "fam", false, async {
                                tokio::task::yield_now().await;
                                Ok(json!({"x": 2}))
                            })
                            .await
                            .result
                    })
                };
                // Let the leader register itself as in-flight before the
                // follower joins the same family.
                tokio::task::yield_now().await;
                let follower = {
                    let scheduler = scheduler.clone();
                    tokio::task::spawn_local(async move {
                        scheduler
                            .run("fam", "fam", false, async { unreachable!("follower must not fetch") })
                            .await
                            .result
                    })
                };

                assert_eq!(leader.await.unwrap().unwrap(), json!({"x": 2}));
                assert_eq!(follower.await.unwrap().unwrap(), json!({"x": 2}));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn suppressed_replay_carries_a_stale_reason() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let scheduler = Rc::new(NetworkScheduler::new());

                let slow = {
                    let scheduler = scheduler.clone();
                    tokio::task::spawn_local(async move {
                        scheduler
                            .run("fam-slow", "scope", false, async {
                                tokio::task::yield_now().await;
                                tokio::task::yield_now().await;
                                Ok(json!({"x": 1}))
                            })
                            .await
                    })
                };
                tokio::task::yield_now().await;

                let fast = {
                    let scheduler = scheduler.clone();
                    tokio::task::spawn_local(async move { scheduler.run("fam-fast", "scope", false, async { Ok(json!({"x": 2})) }).await })
                };

                let slow = slow.await.unwrap();
                let fast = fast.await.unwrap();

                assert!(fast.publish);
                assert!(fast.stale.is_none(), "the winning generation is never marked stale");
                assert!(!slow.publish, "the slow call's generation was superseded by the faster one");
                assert!(slow.stale.is_some());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn watcher_notify_isolates_panicking_callback() {
        let failures = Rc::new(StdRefCell::new(0));
        let failures_clone = failures.clone();
        let registry = WatcherRegistry::new(Some(Rc::new(move |_event: TelemetryEvent| {
            *failures_clone.borrow_mut() += 1;
        })));

        let id = registry.register(
            || Ok((json!(null), DepSet::new(), "fp".to_string())),
            Rc::new(|_data| panic!("boom")),
            Rc::new(|_err| {}),
        );
        registry.emit_now(id);
        assert_eq!(*failures.borrow(), 1);
    }
}
