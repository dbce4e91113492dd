//! Error kinds for the cache engine (spec §7).
//!
//! Mirrors `apollo-federation`'s `FederationError`/`SingleFederationError` split:
//! a flat `thiserror` enum, plus a couple of ergonomic macros for the
//! internal-invariant-violation case.

use std::fmt;

/// A combined transport error, analogous to urql/Apollo's `CombinedError`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("network error: {network_error}")]
pub struct CombinedError {
    pub network_error: String,
    pub graphql_errors: Vec<String>,
}

/// The error kinds the core engine can produce (spec §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache-only policy requested but no cached value exists for this operation")]
    CacheMiss,
    #[error("unknown cache policy: {0}")]
    InvalidCachePolicy(String),
    #[error("transport error: {0}")]
    TransportError(#[from] CombinedError),
    #[error("a watcher callback panicked or returned an error: {0}")]
    NotifyFailure(String),
    #[error("document failed to parse: {0}")]
    InvalidDocument(String),
    #[error("object has no `__typename` or no identifiable key field: {0}")]
    UnidentifiableEntity(String),
    #[error("invalid cache configuration: {0}")]
    ConfigError(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CacheError::Internal(msg.into())
    }
}

/// Construct an internal-invariant [`CacheError`].
///
/// ```
/// use cachebay::internal_error;
/// use cachebay::error::CacheError;
/// let e: CacheError = internal_error!("expected {} to be present", "Post:1");
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::CacheError::internal(format!( $( $arg )+ ))
    }
}

/// Telemetry events reported through `CacheConfig::on_telemetry` (spec §4.7, §7):
/// storage errors and isolated watcher-notify failures, neither of which may
/// fail a user-facing read.
#[derive(Debug, Clone, displaydoc::Display)]
pub enum TelemetryEvent {
    /// watcher callback failed: {0}
    NotifyFailure(String),
    /// storage adapter error during {operation}: {message}
    StorageError { operation: &'static str, message: String },
    /// unknown cache policy `{policy}`, falling back to network-only
    UnknownCachePolicy { policy: String },
    /// take-latest dedup suppressed a stale response for family `{family}`: {reason}
    StaleResponseSuppressed { family: String, reason: String },
}

/// The internal reason a take-latest response was not published to the
/// graph (spec §4.7, §7): never returned to the caller as a `CacheError` —
/// the caller still gets its own fetched value — but reported through
/// [`TelemetryEvent::StaleResponseSuppressed`] so a host application can
/// observe suppressed replays.
#[derive(Debug, Clone)]
pub(crate) struct StaleResponse;

impl fmt::Display for StaleResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stale response suppressed by take-latest dedup")
    }
}
