//! `watchFragment` (spec §4.7): "same contract [as watchQuery] against a
//! single entity root (`id`, `fragment`, `variables`)."

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

use crate::documents::fingerprint::HotCache;
use crate::documents::materialize::materialize_at;
use crate::error::CacheError;
use crate::graph::Graph;
use crate::planner::{Planner, Variables};
use crate::record::RecordId;
use crate::watch::scheduler::{WatcherId, WatcherRegistry};

pub struct WatchFragmentOptions {
    pub id: RecordId,
    pub fragment: String,
    pub fragment_name: String,
    pub variables: Variables,
    pub immediate: bool,
    pub on_data: Rc<dyn Fn(Value)>,
    pub on_error: Rc<dyn Fn(CacheError)>,
}

pub struct FragmentHandle {
    registry: Rc<WatcherRegistry>,
    id: WatcherId,
    variables: Rc<RefCell<Variables>>,
}

impl FragmentHandle {
    pub fn new(
        graph: Rc<Graph>,
        hot_cache: Rc<HotCache>,
        planner: Rc<Planner>,
        registry: Rc<WatcherRegistry>,
        options: WatchFragmentOptions,
    ) -> Result<Rc<Self>, CacheError> {
        let plan = planner.get_fragment_plan(&options.fragment, &options.fragment_name)?;
        let variables = Rc::new(RefCell::new(options.variables));
        let root_id = options.id;
        // Scope the hot-cache by fragment name *and* entity id so distinct
        // entities watched through the same fragment don't share a
        // fingerprint slot.
        let scope_document = format!("{}#{}", options.fragment_name, root_id);

        let rematerialize = {
            let graph = graph.clone();
            let hot_cache = hot_cache.clone();
            let plan = plan.clone();
            let variables = variables.clone();
            let root_id = root_id.clone();
            let scope_document = scope_document.clone();
            move || {
                let vars = variables.borrow().clone();
                let result = materialize_at(&graph, &hot_cache, &scope_document, &plan, &vars, &root_id)?;
                let rendered = Value::Object(result.data.iter().map(|(k, v)| (k.clone(), v.to_json())).collect());
                Ok((rendered, result.deps, result.fingerprint))
            }
        };

        let id = registry.register(rematerialize, options.on_data, options.on_error);
        if options.immediate {
            registry.emit_now(id);
        }

        Ok(Rc::new(Self { registry, id, variables }))
    }

    pub fn update(&self, variables: Variables, immediate: bool) {
        *self.variables.borrow_mut() = variables;
        if immediate {
            self.registry.emit_now(self.id);
        }
    }

    pub fn unsubscribe(&self) {
        self.registry.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::record::{field_key, record_id, FieldValue, Record};
    use serde_json::json;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn watch_fragment_observes_entity_becoming_empty_on_removal() {
        let graph = Graph::new(IdentityConfig::default());
        let hot_cache = Rc::new(HotCache::new());
        let planner = Rc::new(Planner::new());
        let registry = Rc::new(WatcherRegistry::new(None));

        let id = record_id("User:1");
        let mut patch = Record::new();
        patch.insert(field_key("name"), FieldValue::Scalar(json!("Ada")));
        patch.insert(field_key("__typename"), FieldValue::Scalar(json!("User")));
        graph.put_record(id.clone(), patch);
        graph.flush();

        let seen = Rc::new(StdRefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = FragmentHandle::new(
            graph.clone(),
            hot_cache,
            planner,
            registry,
            WatchFragmentOptions {
                id: id.clone(),
                fragment: "fragment UserFields on User { name __typename }".to_string(),
                fragment_name: "UserFields".to_string(),
                variables: Variables::new(),
                immediate: true,
                on_data: Rc::new(move |data| seen_clone.borrow_mut().push(data)),
                on_error: Rc::new(|_| panic!("unexpected error")),
            },
        )
        .unwrap();

        assert_eq!(seen.borrow()[0]["name"], json!("Ada"));

        graph.remove_record(&id);
        let dirty = graph.flush();
        handle.registry.notify_flush(&dirty);

        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(seen.borrow()[1], json!({}), "removed entity materializes as empty (G4)");
    }
}
