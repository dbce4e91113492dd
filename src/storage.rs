//! Storage adapter contract and bridge (spec §6): persists the record graph
//! across reloads/tabs and applies inbound remote deltas without looping
//! writes back out.

use std::rc::Rc;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::graph::{ChangeBatch, Graph};
use crate::record::{Record, RecordId};

/// `storage.inspect()` (spec §6): a snapshot for debugging/ops tooling, never
/// used on the hot path.
#[derive(Clone, Debug, Default)]
pub struct StorageInspect {
    pub record_count: usize,
    pub journal_count: usize,
    pub last_seen_epoch: u64,
    pub instance_id: String,
}

/// A pluggable persistence backend (spec §6). Implementations are expected to
/// batch writes internally (e.g. an IndexedDB transaction, a single file
/// append) rather than do one I/O op per call.
#[async_trait(?Send)]
pub trait StorageAdapter {
    async fn put(&self, batch: Vec<(RecordId, Record)>) -> Result<(), CacheError>;
    async fn remove(&self, batch: Vec<RecordId>) -> Result<(), CacheError>;
    /// Load every record persisted so far, for startup hydration.
    async fn load(&self) -> Result<Vec<(RecordId, Record)>, CacheError>;
    /// Drop whatever undo/replay journal the adapter keeps, without touching
    /// the records themselves.
    async fn flush_journal(&self) -> Result<(), CacheError>;
    async fn evict_journal(&self) -> Result<(), CacheError>;
    async fn evict_all(&self) -> Result<(), CacheError>;
    async fn inspect(&self) -> Result<StorageInspect, CacheError>;
}

/// Bridges the graph store to a [`StorageAdapter`]: forwards local mutations
/// out, and applies inbound remote deltas (e.g. a cross-tab broadcast) back
/// in through the `applying-remote` flag so they are never re-forwarded
/// (spec §5 "no loopback"). Must be constructed and used from inside a
/// `tokio::task::LocalSet`, since forwarding spawns `!Send` tasks.
pub struct StorageBridge {
    graph: Rc<Graph>,
    adapter: Rc<dyn StorageAdapter>,
    on_telemetry: Option<Rc<dyn Fn(crate::error::TelemetryEvent)>>,
}

impl StorageBridge {
    pub fn install(
        graph: Rc<Graph>,
        adapter: Rc<dyn StorageAdapter>,
        on_telemetry: Option<Rc<dyn Fn(crate::error::TelemetryEvent)>>,
    ) -> Rc<Self> {
        let bridge = Rc::new(Self { graph: graph.clone(), adapter: adapter.clone(), on_telemetry });
        let telemetry_for_listener = bridge.on_telemetry.clone();
        graph.on_change(move |batch: &ChangeBatch| {
            // `Graph::flush` only invokes listeners for locally-originated
            // batches (it skips dispatch entirely while `applying_remote`),
            // so nothing here needs to re-check that flag.
            if !batch.puts.is_empty() {
                let puts = batch.puts.clone();
                let adapter = adapter.clone();
                let telemetry = telemetry_for_listener.clone();
                tokio::task::spawn_local(async move {
                    report(&telemetry, "put", adapter.put(puts).await);
                });
            }
            if !batch.removes.is_empty() {
                let removes = batch.removes.clone();
                let adapter = adapter.clone();
                let telemetry = telemetry_for_listener.clone();
                tokio::task::spawn_local(async move {
                    report(&telemetry, "remove", adapter.remove(removes).await);
                });
            }
        });
        bridge
    }

    /// Apply a batch of remote deltas without re-publishing them back to
    /// `adapter.put`/`remove`.
    pub fn apply_remote(&self, puts: Vec<(RecordId, Record)>, removes: Vec<RecordId>) {
        self.graph.set_applying_remote(true);
        for (id, patch) in puts {
            self.graph.put_record(id, patch);
        }
        for id in removes {
            self.graph.remove_record(&id);
        }
        self.graph.set_applying_remote(false);
        self.graph.flush();
    }

    /// `storage.load()` at startup, merged in as gap-filling hydration: a
    /// field already present in the live graph is left untouched (spec §6).
    pub async fn load_initial(&self) -> Result<(), CacheError> {
        let records = self.adapter.load().await?;
        hydrate_records(&self.graph, records);
        Ok(())
    }

    pub async fn flush_journal(&self) -> Result<(), CacheError> {
        self.adapter.flush_journal().await
    }

    pub async fn evict_journal(&self) -> Result<(), CacheError> {
        self.adapter.evict_journal().await
    }

    /// `evictAll()` originating locally: clears the graph and tells storage
    /// to drop everything too. A remote-originated eviction should call
    /// `Graph::clear()` directly instead, without going through here, since
    /// `storage.evictAll` must not be re-invoked for a delta that came from
    /// storage in the first place.
    pub async fn evict_all(&self) -> Result<(), CacheError> {
        self.graph.clear();
        self.adapter.evict_all().await
    }

    pub async fn inspect(&self) -> Result<StorageInspect, CacheError> {
        self.adapter.inspect().await
    }
}

fn report(telemetry: &Option<Rc<dyn Fn(crate::error::TelemetryEvent)>>, operation: &'static str, result: Result<(), CacheError>) {
    if let Err(err) = result {
        if let Some(telemetry) = telemetry {
            telemetry(crate::error::TelemetryEvent::StorageError { operation, message: err.to_string() });
        }
    }
}

/// `hydrate({records})` (spec §4.8): merge a batch of records in without
/// clearing existing state, never overwriting a field already present.
/// Shared by `StorageBridge::load_initial` and the client's public
/// `hydrate` entry point.
pub fn hydrate_records(graph: &Graph, records: Vec<(RecordId, Record)>) {
    graph.set_applying_remote(true);
    for (id, record) in records {
        graph.hydrate_record(id, record);
    }
    graph.set_applying_remote(false);
    graph.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::record::{field_key, record_id, FieldValue};
    use std::cell::RefCell;

    struct FakeAdapter {
        puts: RefCell<Vec<(RecordId, Record)>>,
    }

    #[async_trait(?Send)]
    impl StorageAdapter for FakeAdapter {
        async fn put(&self, batch: Vec<(RecordId, Record)>) -> Result<(), CacheError> {
            self.puts.borrow_mut().extend(batch);
            Ok(())
        }
        async fn remove(&self, _batch: Vec<RecordId>) -> Result<(), CacheError> {
            Ok(())
        }
        async fn load(&self) -> Result<Vec<(RecordId, Record)>, CacheError> {
            Ok(vec![])
        }
        async fn flush_journal(&self) -> Result<(), CacheError> {
            Ok(())
        }
        async fn evict_journal(&self) -> Result<(), CacheError> {
            Ok(())
        }
        async fn evict_all(&self) -> Result<(), CacheError> {
            Ok(())
        }
        async fn inspect(&self) -> Result<StorageInspect, CacheError> {
            Ok(StorageInspect::default())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn local_put_forwards_to_adapter_but_remote_apply_does_not() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let graph = Graph::new(IdentityConfig::default());
                let adapter = Rc::new(FakeAdapter { puts: RefCell::new(Vec::new()) });
                let _bridge = StorageBridge::install(graph.clone(), adapter.clone(), None);

                let mut patch = Record::new();
                patch.insert(field_key("name"), FieldValue::Scalar(serde_json::json!("Ada")));
                graph.put_record(record_id("User:1"), patch);
                graph.flush();
                tokio::task::yield_now().await;

                assert_eq!(adapter.puts.borrow().len(), 1, "local write is forwarded to storage");
            })
            .await;
    }

    #[test]
    fn hydrate_fills_gaps_without_overwriting() {
        let graph = Graph::new(IdentityConfig::default());
        let mut live = Record::new();
        live.insert(field_key("name"), FieldValue::Scalar(serde_json::json!("Live")));
        graph.put_record(record_id("User:1"), live);

        let mut persisted = Record::new();
        persisted.insert(field_key("name"), FieldValue::Scalar(serde_json::json!("Stale")));
        persisted.insert(field_key("email"), FieldValue::Scalar(serde_json::json!("a@x")));
        hydrate_records(&graph, vec![(record_id("User:1"), persisted)]);

        let record = graph.get_record(&record_id("User:1")).unwrap();
        assert_eq!(record.get("name"), Some(&FieldValue::Scalar(serde_json::json!("Live"))), "live value wins");
        assert_eq!(record.get("email"), Some(&FieldValue::Scalar(serde_json::json!("a@x"))), "gap is filled in");
    }
}
