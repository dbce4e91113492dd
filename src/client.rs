//! `createCache` / `ClientInstance` (spec §6): wires every component behind
//! the public surface — `executeQuery/Mutation/Subscription`,
//! `readQuery/writeQuery`, `readFragment/writeFragment`,
//! `watchQuery/watchFragment`, `modifyOptimistic`, `hydrate`, `evictAll`,
//! `identify`, `dispose`.

use std::cell::Cell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;
use serde_json::Value;

use crate::config::{BuildMode, CacheConfig, Timeouts};
use crate::documents::fingerprint::{DepSet, HotCache};
use crate::documents::materialize::{materialize, materialize_at};
use crate::documents::normalize::{normalize, normalize_at};
use crate::error::{CacheError, CombinedError};
use crate::graph::Graph;
use crate::optimistic::{Layer, Operation, OptimisticTx};
use crate::planner::{Plan, Planner, Variables};
use crate::record::{field_key, record_id, Record, RecordId};
use crate::storage::{hydrate_records, StorageAdapter, StorageBridge};
use crate::subscription::{execute_subscription, SubscriptionHandle};
use crate::watch::{
    plan_execute, CachePolicy, FragmentHandle, NetworkScheduler, PolicyOutcome, QueryHandle, WatchFragmentOptions,
    WatchQueryOptions, WatcherRegistry,
};

/// One GraphQL operation as handed to a transport function (spec §6
/// `transport.http(op)`/`transport.ws(op)`). Named to avoid colliding with
/// [`crate::optimistic::Operation`], the unrelated optimistic-edit enum.
#[derive(Clone, Debug)]
pub struct GraphqlOperation {
    pub document: String,
    pub variables: Variables,
}

pub type HttpFn = Rc<dyn Fn(GraphqlOperation) -> LocalBoxFuture<'static, Result<Value, CombinedError>>>;
pub type WsFn = Rc<dyn Fn(GraphqlOperation) -> LocalBoxStream<'static, Result<Value, CombinedError>>>;

/// `{transport}` (spec §6): the only way the core talks to the network.
#[derive(Clone, derivative::Derivative)]
#[derivative(Debug)]
pub struct Transport {
    #[derivative(Debug = "ignore")]
    pub http: HttpFn,
    #[derivative(Debug = "ignore")]
    pub ws: Option<WsFn>,
}

const PAGINATION_ARGS: [&str; 2] = ["after", "before"];

/// `createCache({...}) → ClientInstance`.
pub struct ClientInstance {
    graph: Rc<Graph>,
    hot_cache: Rc<HotCache>,
    planner: Rc<Planner>,
    registry: Rc<WatcherRegistry>,
    scheduler: Rc<NetworkScheduler>,
    storage: Option<Rc<StorageBridge>>,
    transport: Transport,
    build_mode: BuildMode,
    timeouts: Timeouts,
    on_telemetry: Option<Rc<dyn Fn(crate::error::TelemetryEvent)>>,
    disposed: Cell<bool>,
}

impl ClientInstance {
    pub fn new(config: CacheConfig, transport: Transport, storage_adapter: Option<Rc<dyn StorageAdapter>>) -> Rc<Self> {
        let graph = Graph::new(config.identity);
        let registry = Rc::new(WatcherRegistry::new(config.on_telemetry.clone()));
        let storage = storage_adapter.map(|adapter| StorageBridge::install(graph.clone(), adapter, config.on_telemetry.clone()));

        Rc::new(Self {
            graph,
            hot_cache: Rc::new(HotCache::new()),
            planner: Rc::new(Planner::new()),
            registry,
            scheduler: Rc::new(NetworkScheduler::new()),
            storage,
            transport,
            build_mode: config.build_mode,
            timeouts: config.timeouts,
            on_telemetry: config.on_telemetry,
            disposed: Cell::new(false),
        })
    }

    /// `identify(object)` (spec §6).
    pub fn identify(&self, obj: &Value) -> Option<RecordId> {
        self.graph.identify(obj)
    }

    /// Load persisted records at startup, bounded by `hydrationTimeout` if
    /// configured (spec §5 "Suspension points... storage.load").
    pub async fn hydrate_from_storage(&self) -> Result<(), CacheError> {
        let Some(storage) = &self.storage else { return Ok(()) };
        match self.timeouts.hydration_timeout {
            Some(d) => tokio::time::timeout(d, storage.load_initial())
                .await
                .map_err(|_| CacheError::internal("storage.load timed out"))?,
            None => storage.load_initial().await,
        }
    }

    /// `hydrate({records})` (spec §6): merge without clearing, fill gaps only.
    pub fn hydrate(&self, records: Vec<(RecordId, Record)>) {
        hydrate_records(&self.graph, records);
    }

    /// `readQuery(document, variables)`: one-shot cache read, no watcher
    /// registered.
    pub fn read_query(&self, document: &str, variables: &Variables) -> Result<Value, CacheError> {
        let plan = self.planner.get_plan(document)?;
        let result = materialize(&self.graph, &self.hot_cache, document, &plan, variables)?;
        Ok(render(&result.data))
    }

    /// `writeQuery(document, variables, data)`: normalize directly into the
    /// graph and notify any affected watchers.
    pub fn write_query(&self, document: &str, variables: &Variables, data: &Value) -> Result<(), CacheError> {
        let plan = self.planner.get_plan(document)?;
        normalize(&self.graph, &self.hot_cache, document, &plan, variables, data)?;
        let dirty = self.graph.flush();
        self.registry.notify_flush(&dirty);
        Ok(())
    }

    /// `readFragment(id, fragment, variables)`.
    pub fn read_fragment(
        &self,
        id: RecordId,
        fragment: &str,
        fragment_name: &str,
        variables: &Variables,
    ) -> Result<Value, CacheError> {
        let plan = self.planner.get_fragment_plan(fragment, fragment_name)?;
        let scope_document = format!("{fragment_name}#{id}");
        let result = materialize_at(&self.graph, &self.hot_cache, &scope_document, &plan, variables, &id)?;
        Ok(render(&result.data))
    }

    /// `writeFragment(id, fragment, variables, data)`.
    pub fn write_fragment(
        &self,
        id: RecordId,
        fragment: &str,
        fragment_name: &str,
        variables: &Variables,
        data: &Value,
    ) -> Result<(), CacheError> {
        let plan = self.planner.get_fragment_plan(fragment, fragment_name)?;
        let scope_document = format!("{fragment_name}#{id}");
        normalize_at(&self.graph, &self.hot_cache, &scope_document, &plan, variables, data, &id)?;
        let dirty = self.graph.flush();
        self.registry.notify_flush(&dirty);
        Ok(())
    }

    /// `watchQuery(options)`.
    pub fn watch_query(&self, options: WatchQueryOptions) -> Result<Rc<QueryHandle>, CacheError> {
        QueryHandle::new(self.graph.clone(), self.hot_cache.clone(), self.planner.clone(), self.registry.clone(), options)
    }

    /// `watchFragment(options)`.
    pub fn watch_fragment(&self, options: WatchFragmentOptions) -> Result<Rc<FragmentHandle>, CacheError> {
        FragmentHandle::new(self.graph.clone(), self.hot_cache.clone(), self.planner.clone(), self.registry.clone(), options)
    }

    /// `executeQuery(document, variables, {cachePolicy, concurrencyScope?, onData?})`
    /// (spec §4.7 cache-policy table). `on_emit` receives the non-terminal
    /// cached value for `cache-and-network`; the returned future always
    /// resolves to the terminal value (cached for `cache-first`/`cache-only`,
    /// network for everything else).
    #[tracing::instrument(level = "debug", skip(self, variables, on_emit), fields(policy = cache_policy))]
    pub async fn execute_query(
        &self,
        document: String,
        variables: Variables,
        cache_policy: &str,
        concurrency_scope: Option<String>,
        on_emit: Option<Rc<dyn Fn(Value)>>,
    ) -> Result<Value, CacheError> {
        let policy = CachePolicy::parse(cache_policy, self.build_mode, self.on_telemetry.as_ref())?;
        let plan = self.planner.get_plan(&document)?;

        let cached = {
            let result = materialize(&self.graph, &self.hot_cache, &document, &plan, &variables)?;
            is_fully_cached(&plan, &result.data).then(|| render(&result.data))
        };

        match plan_execute(policy, cached) {
            PolicyOutcome::CachedOnly(value) => Ok(value),
            PolicyOutcome::Miss => Err(CacheError::CacheMiss),
            PolicyOutcome::FetchOnly => self.fetch_and_normalize(document, plan, variables, concurrency_scope).await,
            PolicyOutcome::CachedThenFetch(cached) => {
                if let Some(on_emit) = &on_emit {
                    on_emit(cached);
                }
                self.fetch_and_normalize(document, plan, variables, concurrency_scope).await
            }
        }
    }

    /// `executeMutation(document, variables)`: always network, take-latest
    /// dedup still applies per family.
    #[tracing::instrument(level = "debug", skip(self, variables))]
    pub async fn execute_mutation(&self, document: String, variables: Variables) -> Result<Value, CacheError> {
        let plan = self.planner.get_plan(&document)?;
        self.fetch_and_normalize(document, plan, variables, None).await
    }

    async fn fetch_and_normalize(
        &self,
        document: String,
        plan: Rc<Plan>,
        variables: Variables,
        concurrency_scope: Option<String>,
    ) -> Result<Value, CacheError> {
        let scope = crate::documents::fingerprint::scope_key(&document, &variables);
        let concurrency_scope = concurrency_scope.unwrap_or_else(|| scope.clone());
        // Family key (spec §4.7): document identity + variables + concurrency
        // scope together. `concurrency_scope` alone still tracks the newest
        // generation within a broader scope (e.g. one connection field across
        // its paginated continuations).
        let family = format!("{scope}\0{concurrency_scope}");
        let allow_replay_on_stale = PAGINATION_ARGS.iter().any(|arg| variables.contains_key(*arg));

        let op = GraphqlOperation { document: document.clone(), variables: variables.clone() };
        let http = self.transport.http.clone();
        let outcome = self
            .scheduler
            .run(&family, &concurrency_scope, allow_replay_on_stale, async move { http(op).await })
            .await;

        let data = outcome.result?;
        if outcome.publish {
            normalize(&self.graph, &self.hot_cache, &document, &plan, &variables, &data)?;
            let dirty = self.graph.flush();
            self.registry.notify_flush(&dirty);
        } else if let Some(stale) = &outcome.stale {
            tracing::debug!(family = family.as_str(), "stale response superseded by a newer family member, not published");
            if let Some(telemetry) = &self.on_telemetry {
                telemetry(crate::error::TelemetryEvent::StaleResponseSuppressed {
                    family: family.clone(),
                    reason: stale.to_string(),
                });
            }
        }
        Ok(data)
    }

    /// `executeSubscription(document, variables)`: requires `transport.ws`.
    #[tracing::instrument(level = "debug", skip(self, variables, on_error))]
    pub fn execute_subscription(
        &self,
        document: String,
        variables: Variables,
        on_error: Rc<dyn Fn(CacheError)>,
    ) -> Result<SubscriptionHandle, CacheError> {
        let ws = self
            .transport
            .ws
            .clone()
            .ok_or_else(|| CacheError::ConfigError("no `transport.ws` configured for subscriptions".to_string()))?;
        let plan = self.planner.get_plan(&document)?;
        let frames = ws(GraphqlOperation { document: document.clone(), variables: variables.clone() });
        Ok(execute_subscription(
            self.graph.clone(),
            self.hot_cache.clone(),
            self.registry.clone(),
            document,
            plan,
            variables,
            frames,
            on_error,
        ))
    }

    /// `modifyOptimistic(builder)`: stage a new live layer.
    pub fn modify_optimistic(&self, builder: impl Fn(&OptimisticTx) + 'static) -> Rc<Layer> {
        let graph = self.graph.clone();
        let layer = self.graph.optimistic.push(&|obj: &Value| graph.identify(obj), Rc::new(builder));
        let deps = affected_deps(&self.graph, layer.ops().as_slice());
        self.registry.notify_flush(&deps);
        layer
    }

    /// `layer.commit(data?)`, re-dispatching affected watchers.
    pub fn commit_optimistic(&self, layer: &Layer, data: Option<&Value>) {
        let graph = self.graph.clone();
        layer.commit(&|obj: &Value| graph.identify(obj), data);
        let deps = affected_deps(&self.graph, layer.ops().as_slice());
        self.registry.notify_flush(&deps);
    }

    /// `layer.revert()`, re-dispatching affected watchers.
    pub fn revert_optimistic(&self, layer: &Layer) {
        let deps = affected_deps(&self.graph, layer.ops().as_slice());
        layer.revert();
        self.registry.notify_flush(&deps);
    }

    /// `evictAll()` (spec §4.7): clears everything and notifies every
    /// watcher unconditionally, as if each one's dependencies just went
    /// dirty. Automatic query-watcher re-fetch on eviction is left to the
    /// caller: a `QueryHandle` has no network awareness of its own, so the
    /// binding layer (or the caller) re-invokes `executeQuery` for whichever
    /// queries it wants kept live, using the same family-keyed take-latest
    /// dedup as any other call.
    pub async fn evict_all(&self) -> Result<(), CacheError> {
        tracing::info!("evicting entire cache");
        self.hot_cache.clear();
        self.scheduler.clear();
        match &self.storage {
            Some(storage) => storage.evict_all().await?,
            None => self.graph.clear(),
        }
        self.registry.notify_all();
        Ok(())
    }

    /// Apply a remote eviction (came in via the storage bridge already) —
    /// does not re-invoke `storage.evictAll` (spec §4.7 "not re-invoked").
    pub fn evict_all_from_remote(&self) {
        self.graph.clear();
        self.hot_cache.clear();
        self.scheduler.clear();
        self.registry.notify_all();
    }

    /// `client.dispose()`: unsubscribe all watchers, release transports.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        tracing::info!("disposing cache instance");
        self.registry.clear();
        self.scheduler.clear();
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn __internals(&self) -> (&Rc<Graph>, &Rc<HotCache>, &Rc<Planner>, &Rc<WatcherRegistry>) {
        (&self.graph, &self.hot_cache, &self.planner, &self.registry)
    }
}

fn render(data: &indexmap::IndexMap<String, crate::documents::MaterializedValue>) -> Value {
    Value::Object(data.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// `{response key} ⊆ {plan root fields}` is the presence test for "is there
/// already a cached value for this whole operation" (spec §4.7 cache
/// policies): a partially-cached query (some top-level field missing from
/// the graph) is treated the same as fully uncached, since the policy table
/// only distinguishes "cached" from "not".
fn is_fully_cached(plan: &Plan, data: &indexmap::IndexMap<String, crate::documents::MaterializedValue>) -> bool {
    plan.root.iter().all(|field| data.contains_key(&field.response_key))
}

/// Compute the `(RecordId, FieldKey)` dependency pairs touched by a set of
/// optimistic operations, for dispatching watchers directly (optimistic
/// edits never touch the base store, so `Graph::flush`'s dirty set can't see
/// them). `DeleteEntity` conservatively includes every field still visible
/// in the post-op effective record plus a synthetic `__typename` dependency,
/// since the exact pre-deletion field set isn't available here — see
/// DESIGN.md.
fn affected_deps(graph: &Graph, ops: &[Operation]) -> DepSet {
    let mut deps = DepSet::new();
    for op in ops {
        match op {
            Operation::PatchEntity { id, patch, .. } => {
                for key in patch.keys() {
                    deps.insert((id.clone(), key.clone()));
                }
            }
            Operation::DeleteEntity { id } => {
                deps.insert((id.clone(), field_key("__typename")));
                if let Some(record) = graph.get_record(id) {
                    for key in record.keys() {
                        deps.insert((id.clone(), key.clone()));
                    }
                }
            }
            Operation::ConnectionAddNode { canonical_key, .. }
            | Operation::ConnectionRemoveNode { canonical_key, .. }
            | Operation::ConnectionPatch { canonical_key, .. } => {
                deps.insert((record_id(canonical_key.clone()), field_key("__connection")));
            }
        }
    }
    deps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfigBuilder;
    use crate::optimistic::Mode;
    use serde_json::json;
    use std::cell::RefCell;

    fn http_ok(value: Value) -> HttpFn {
        Rc::new(move |_op: GraphqlOperation| {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    fn test_client(http: HttpFn) -> Rc<ClientInstance> {
        let config = CacheConfigBuilder::new().build_mode(BuildMode::Development).build().unwrap();
        ClientInstance::new(config, Transport { http, ws: None }, None)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cache_first_skips_network_when_already_cached() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = test_client(http_ok(json!({"viewer": {"id": "1", "__typename": "User", "name": "Ada"}})));
                let document = "query { viewer { id __typename name } }".to_string();

                client.write_query(&document, &Variables::new(), &json!({"viewer": {"id": "1", "__typename": "User", "name": "Ada"}})).unwrap();

                let result = client
                    .execute_query(document, Variables::new(), "cache-first", None, None)
                    .await
                    .unwrap();
                assert_eq!(result["viewer"]["name"], json!("Ada"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cache_only_miss_is_an_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = test_client(http_ok(json!({"viewer": null})));
                let result = client
                    .execute_query("query { viewer { id } }".to_string(), Variables::new(), "cache-only", None, None)
                    .await;
                assert!(matches!(result, Err(CacheError::CacheMiss)));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cache_and_network_emits_cached_then_resolves_network_terminal() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = test_client(http_ok(json!({"viewer": {"id": "1", "__typename": "User", "name": "Grace"}})));
                let document = "query { viewer { id __typename name } }".to_string();
                client.write_query(&document, &Variables::new(), &json!({"viewer": {"id": "1", "__typename": "User", "name": "Ada"}})).unwrap();

                let emitted = Rc::new(RefCell::new(None));
                let emitted_clone = emitted.clone();
                let result = client
                    .execute_query(
                        document,
                        Variables::new(),
                        "cache-and-network",
                        None,
                        Some(Rc::new(move |v| *emitted_clone.borrow_mut() = Some(v))),
                    )
                    .await
                    .unwrap();

                assert_eq!(emitted.borrow().as_ref().unwrap()["viewer"]["name"], json!("Ada"), "non-terminal emit is the cached value");
                assert_eq!(result["viewer"]["name"], json!("Grace"), "resolved value is the network terminal");
            })
            .await;
    }

    #[test]
    fn modify_optimistic_notifies_dependent_watcher_synchronously() {
        let client = test_client(http_ok(json!({})));
        let document = "query { viewer { id __typename name } }".to_string();
        client
            .write_query(&document, &Variables::new(), &json!({"viewer": {"id": "1", "__typename": "User", "name": "Ada"}}))
            .unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let _handle = client
            .watch_query(WatchQueryOptions {
                document,
                variables: Variables::new(),
                immediate: true,
                on_data: Rc::new(move |data| seen_clone.borrow_mut().push(data)),
                on_error: Rc::new(|_| panic!("unexpected error")),
            })
            .unwrap();
        assert_eq!(seen.borrow().len(), 1);

        client.modify_optimistic(|tx| {
            let mut patch = Record::new();
            patch.insert(field_key("name"), crate::record::FieldValue::Scalar(json!("Optimistic Ada")));
            tx.patch(record_id("User:1"), patch, Mode::Merge);
        });

        assert_eq!(seen.borrow().len(), 2, "optimistic patch re-dispatches the dependent watcher");
        assert_eq!(seen.borrow()[1]["viewer"]["name"], json!("Optimistic Ada"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn evict_all_notifies_every_watcher() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = test_client(http_ok(json!({})));
                let document = "query { viewer { id __typename name } }".to_string();
                client
                    .write_query(&document, &Variables::new(), &json!({"viewer": {"id": "1", "__typename": "User", "name": "Ada"}}))
                    .unwrap();

                let seen = Rc::new(RefCell::new(Vec::new()));
                let seen_clone = seen.clone();
                let _handle = client
                    .watch_query(WatchQueryOptions {
                        document,
                        variables: Variables::new(),
                        immediate: true,
                        on_data: Rc::new(move |data| seen_clone.borrow_mut().push(data)),
                        on_error: Rc::new(|_| panic!("unexpected error")),
                    })
                    .unwrap();
                assert_eq!(seen.borrow().len(), 1);

                client.evict_all().await.unwrap();
                assert_eq!(seen.borrow().len(), 2);
                assert_eq!(seen.borrow()[1], json!({}), "evicted query materializes as empty");
            })
            .await;
    }
}
