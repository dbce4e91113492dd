//! Cachebay: a normalized, reactive, client-side GraphQL cache.
//!
//! The public surface is [`client::ClientInstance`], constructed via
//! [`client::ClientInstance::new`] (the `createCache` entry point). Everything
//! else in this crate is the engine it wires together: a keyed [`graph::Graph`]
//! of [`record::Record`]s, a [`planner`] that compiles documents into reusable
//! plans, a normalize/materialize pipeline ([`documents`]), canonical
//! connection pagination ([`connections`]), an optimistic edit stack
//! ([`optimistic`]), and reactive watchers with take-latest network dedup
//! ([`watch`]).

pub mod client;
pub mod config;
pub mod connections;
pub mod documents;
pub mod error;
pub mod graph;
pub mod keys;
pub mod optimistic;
pub mod planner;
pub mod record;
pub mod storage;
pub mod subscription;
pub mod tracker;
pub mod watch;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::{ClientInstance, GraphqlOperation, HttpFn, Transport, WsFn};
pub use config::{BuildMode, CacheConfig, CacheConfigBuilder, IdentityConfig, KeyFn, Timeouts};
pub use error::{CacheError, CombinedError, TelemetryEvent};
pub use record::{RecordId, field_key, record_id};
