//! Plan memoization (spec §4.2: "Memoized by document identity (and by
//! source string when the document is a string)").

use std::cell::RefCell;
use std::rc::Rc;

use lru::LruCache;

use crate::error::CacheError;
use crate::planner::parse::compile_document;
use crate::planner::plan::Plan;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Hash, Eq, PartialEq)]
struct PlanCacheKey {
    source: String,
    fragment_name: Option<String>,
}

/// Compiles and memoizes [`Plan`]s for this client instance (spec §4.2).
pub struct Planner {
    cache: RefCell<LruCache<PlanCacheKey, Rc<Plan>>>,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            cache: RefCell::new(LruCache::new(std::num::NonZeroUsize::new(DEFAULT_CAPACITY).unwrap())),
        }
    }

    /// `getPlan(document) -> Plan`, compiling and caching on first use.
    pub fn get_plan(&self, document: &str) -> Result<Rc<Plan>, CacheError> {
        self.get_plan_inner(document, None)
    }

    /// Same, but selects a standalone fragment by name (for
    /// `watchFragment`/`readFragment`/`writeFragment`).
    pub fn get_fragment_plan(&self, document: &str, fragment_name: &str) -> Result<Rc<Plan>, CacheError> {
        self.get_plan_inner(document, Some(fragment_name))
    }

    fn get_plan_inner(&self, document: &str, fragment_name: Option<&str>) -> Result<Rc<Plan>, CacheError> {
        let key = PlanCacheKey {
            source: document.to_string(),
            fragment_name: fragment_name.map(str::to_string),
        };
        if let Some(plan) = self.cache.borrow_mut().get(&key) {
            return Ok(plan.clone());
        }
        let plan = Rc::new(compile_document(document, fragment_name)?);
        self.cache.borrow_mut().put(key, plan.clone());
        Ok(plan)
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_are_memoized_by_source() {
        let planner = Planner::new();
        let doc = "query { user { id name } }";
        let a = planner.get_plan(doc).unwrap();
        let b = planner.get_plan(doc).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalid_document_is_rejected() {
        let planner = Planner::new();
        assert!(planner.get_plan("not a graphql document {{{").is_err());
    }
}
