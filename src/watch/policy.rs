//! Cache policies for `executeQuery` (spec §4.7).

use std::rc::Rc;

use crate::config::BuildMode;
use crate::error::{CacheError, TelemetryEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    CacheFirst,
    CacheOnly,
    NetworkOnly,
    CacheAndNetwork,
}

impl CachePolicy {
    /// Parse a policy string. Unknown values fail in development builds and
    /// fall back to `network-only` with a telemetry warning in production
    /// (spec §4.7 "Validation").
    pub fn parse(raw: &str, build_mode: BuildMode, on_telemetry: Option<&Rc<dyn Fn(TelemetryEvent)>>) -> Result<Self, CacheError> {
        match raw {
            "cache-first" => Ok(CachePolicy::CacheFirst),
            "cache-only" => Ok(CachePolicy::CacheOnly),
            "network-only" => Ok(CachePolicy::NetworkOnly),
            "cache-and-network" => Ok(CachePolicy::CacheAndNetwork),
            other => match build_mode {
                BuildMode::Development => Err(CacheError::InvalidCachePolicy(other.to_string())),
                BuildMode::Production => {
                    if let Some(cb) = on_telemetry {
                        cb(TelemetryEvent::UnknownCachePolicy { policy: other.to_string() });
                    }
                    Ok(CachePolicy::NetworkOnly)
                }
            },
        }
    }
}

/// What `executeQuery` should do for a given policy and cache-read outcome
/// (spec §4.7 table), expressed independently of materialize/fetch so it's
/// trivial to test. `cached` is `None` precisely when the cache has nothing
/// usable for this operation; per Open Question decision #2, a `cache-only`
/// miss is never itself cached (the caller re-evaluates from scratch on
/// every call — this function is pure and holds no state either way).
#[derive(Debug, PartialEq, Eq)]
pub enum PolicyOutcome<T> {
    /// Emit this cached value; do not contact the network.
    CachedOnly(T),
    /// Emit this cached value as a non-terminal signal, then fetch and emit
    /// a terminal result (`cache-and-network`).
    CachedThenFetch(T),
    /// Nothing usable is cached (or the policy ignores the cache); fetch and
    /// emit the terminal result.
    FetchOnly,
    /// `cache-only` with nothing cached (spec §7 `CacheMiss`).
    Miss,
}

pub fn plan_execute<T>(policy: CachePolicy, cached: Option<T>) -> PolicyOutcome<T> {
    match (policy, cached) {
        (CachePolicy::CacheFirst, Some(v)) => PolicyOutcome::CachedOnly(v),
        (CachePolicy::CacheFirst, None) => PolicyOutcome::FetchOnly,
        (CachePolicy::CacheOnly, Some(v)) => PolicyOutcome::CachedOnly(v),
        (CachePolicy::CacheOnly, None) => PolicyOutcome::Miss,
        (CachePolicy::NetworkOnly, _) => PolicyOutcome::FetchOnly,
        (CachePolicy::CacheAndNetwork, Some(v)) => PolicyOutcome::CachedThenFetch(v),
        (CachePolicy::CacheAndNetwork, None) => PolicyOutcome::FetchOnly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_policies() {
        assert_eq!(CachePolicy::parse("cache-first", BuildMode::Production, None).unwrap(), CachePolicy::CacheFirst);
        assert_eq!(CachePolicy::parse("cache-only", BuildMode::Production, None).unwrap(), CachePolicy::CacheOnly);
        assert_eq!(CachePolicy::parse("network-only", BuildMode::Production, None).unwrap(), CachePolicy::NetworkOnly);
        assert_eq!(
            CachePolicy::parse("cache-and-network", BuildMode::Production, None).unwrap(),
            CachePolicy::CacheAndNetwork
        );
    }

    #[test]
    fn unknown_policy_fails_in_development() {
        let err = CachePolicy::parse("stale-while-revalidate", BuildMode::Development, None).unwrap_err();
        assert!(matches!(err, CacheError::InvalidCachePolicy(_)));
    }

    #[test]
    fn unknown_policy_falls_back_to_network_only_in_production() {
        let policy = CachePolicy::parse("stale-while-revalidate", BuildMode::Production, None).unwrap();
        assert_eq!(policy, CachePolicy::NetworkOnly);
    }

    #[test]
    fn cache_only_miss_is_an_error_not_a_fetch() {
        assert_eq!(plan_execute::<()>(CachePolicy::CacheOnly, None), PolicyOutcome::Miss);
    }

    #[test]
    fn cache_and_network_with_cached_value_emits_twice() {
        assert_eq!(plan_execute(CachePolicy::CacheAndNetwork, Some(1)), PolicyOutcome::CachedThenFetch(1));
    }

    #[test]
    fn cache_first_with_cached_value_skips_fetch() {
        assert_eq!(plan_execute(CachePolicy::CacheFirst, Some(1)), PolicyOutcome::CachedOnly(1));
    }

    #[test]
    fn network_only_always_fetches() {
        assert_eq!(plan_execute(CachePolicy::NetworkOnly, Some(1)), PolicyOutcome::FetchOnly);
    }
}
