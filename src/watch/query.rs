//! `watchQuery` (spec §4.7).

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::documents::fingerprint::HotCache;
use crate::documents::materialize::materialize;
use crate::error::CacheError;
use crate::graph::Graph;
use crate::planner::{Planner, Variables};
use crate::watch::scheduler::{WatcherId, WatcherRegistry};

/// `watchQuery(options)` (spec §4.7): `{query, variables, immediate?,
/// onData, onError}`, minus `cachePolicy`, which only governs
/// `executeQuery`'s own initial fetch decision (`client.rs`); the watcher
/// itself only ever reads from the graph.
pub struct WatchQueryOptions {
    pub document: String,
    pub variables: Variables,
    /// Materialize and emit once synchronously on creation if a value is
    /// already cached. Defaults to `true`.
    pub immediate: bool,
    pub on_data: Rc<dyn Fn(Value)>,
    pub on_error: Rc<dyn Fn(CacheError)>,
}

/// A live `watchQuery` subscription. Dropping this does not unsubscribe —
/// call `unsubscribe()` explicitly (spec §4.7: "`handle.unsubscribe()` is
/// synchronous").
pub struct QueryHandle {
    registry: Rc<WatcherRegistry>,
    id: WatcherId,
    document: Rc<RefCell<String>>,
    variables: Rc<RefCell<Variables>>,
}

impl QueryHandle {
    pub fn new(
        graph: Rc<Graph>,
        hot_cache: Rc<HotCache>,
        planner: Rc<Planner>,
        registry: Rc<WatcherRegistry>,
        options: WatchQueryOptions,
    ) -> Result<Rc<Self>, CacheError> {
        let document = Rc::new(RefCell::new(options.document));
        let variables = Rc::new(RefCell::new(options.variables));

        // Validate the document compiles before registering the watcher.
        planner.get_plan(document.borrow().as_str())?;

        let rematerialize = {
            let graph = graph.clone();
            let hot_cache = hot_cache.clone();
            let planner = planner.clone();
            let document = document.clone();
            let variables = variables.clone();
            move || {
                let doc = document.borrow().clone();
                let plan = planner.get_plan(&doc)?;
                let vars = variables.borrow().clone();
                let result = materialize(&graph, &hot_cache, &doc, &plan, &vars)?;
                let rendered = Value::Object(result.data.iter().map(|(k, v)| (k.clone(), v.to_json())).collect());
                Ok((rendered, result.deps, result.fingerprint))
            }
        };

        let id = registry.register(rematerialize, options.on_data, options.on_error);
        if options.immediate {
            registry.emit_now(id);
        }

        Ok(Rc::new(Self { registry, id, document, variables }))
    }

    /// `handle.update({variables, immediate})`: change the watched variables
    /// (or document) in place, optionally re-emitting immediately.
    pub fn update(&self, document: Option<String>, variables: Option<Variables>, immediate: bool) {
        if let Some(document) = document {
            *self.document.borrow_mut() = document;
        }
        if let Some(variables) = variables {
            *self.variables.borrow_mut() = variables;
        }
        if immediate {
            self.registry.emit_now(self.id);
        }
    }

    /// `handle.unsubscribe()`: synchronous, no further callbacks after this
    /// returns (spec §4.7).
    pub fn unsubscribe(&self) {
        self.registry.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::documents::normalize::normalize;
    use crate::record::record_id;
    use serde_json::json;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn immediate_emits_cached_value_synchronously_and_reacts_to_writes() {
        let graph = Graph::new(IdentityConfig::default());
        let hot_cache = Rc::new(HotCache::new());
        let planner = Rc::new(Planner::new());
        let registry = Rc::new(WatcherRegistry::new(None));

        let document = "query { viewer { id __typename name } }".to_string();
        let plan = planner.get_plan(&document).unwrap();
        normalize(
            &graph,
            &hot_cache,
            &document,
            &plan,
            &Variables::new(),
            &json!({"viewer": {"id": "1", "__typename": "User", "name": "Ada"}}),
        )
        .unwrap();

        let seen = Rc::new(StdRefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = QueryHandle::new(
            graph.clone(),
            hot_cache,
            planner,
            registry,
            WatchQueryOptions {
                document,
                variables: Variables::new(),
                immediate: true,
                on_data: Rc::new(move |data| seen_clone.borrow_mut().push(data)),
                on_error: Rc::new(|_| panic!("unexpected error")),
            },
        )
        .unwrap();

        assert_eq!(seen.borrow().len(), 1, "immediate=true emits synchronously on registration");

        graph.put_record(record_id("User:1"), {
            let mut patch = crate::record::Record::new();
            patch.insert(crate::record::field_key("name"), crate::record::FieldValue::Scalar(json!("Grace")));
            patch
        });
        let dirty = graph.flush();
        handle.registry.notify_flush(&dirty);

        assert_eq!(seen.borrow().len(), 2, "dependent write triggers a re-emission");
        handle.unsubscribe();

        graph.put_record(record_id("User:1"), {
            let mut patch = crate::record::Record::new();
            patch.insert(crate::record::field_key("name"), crate::record::FieldValue::Scalar(json!("Later")));
            patch
        });
        let dirty = graph.flush();
        handle.registry.notify_flush(&dirty);
        assert_eq!(seen.borrow().len(), 2, "unsubscribed watcher receives no further callbacks");
    }
}
