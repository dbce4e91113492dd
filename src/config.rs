//! `createCache` options (spec §6) and the identity configuration the graph
//! store needs to compute `RecordId`s.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{CacheError, TelemetryEvent};

/// `keys: {TypeName: fn(obj) -> id | null}` (spec §6). Falls back to the
/// object's `id` field when a type has no registered keyer.
pub type KeyFn = Rc<dyn Fn(&Value) -> Option<String>>;

fn default_key_fn(obj: &Value) -> Option<String> {
    match obj.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Type identity configuration: per-type keyers and interface canonicalization
/// (spec §3: "`AudioPost:1 → Post:1`").
pub struct IdentityConfig {
    keys: HashMap<String, KeyFn>,
    /// implementor typename -> interface root typename
    interface_of: HashMap<String, String>,
}

impl IdentityConfig {
    pub fn new(keys: HashMap<String, KeyFn>, interfaces: HashMap<String, Vec<String>>) -> Result<Self, CacheError> {
        let mut interface_of = HashMap::new();
        for (interface, implementors) in interfaces {
            for implementor in implementors {
                if let Some(existing) = interface_of.insert(implementor.clone(), interface.clone()) {
                    if existing != interface {
                        return Err(CacheError::ConfigError(format!(
                            "`{implementor}` declared as an implementor of both `{existing}` and `{interface}`"
                        )));
                    }
                }
            }
        }
        Ok(Self { keys, interface_of })
    }

    /// Canonicalize a typename through `interfaces` (spec §3, §4.1 `identify`).
    pub fn canonical_typename<'a>(&'a self, typename: &'a str) -> &'a str {
        self.interface_of
            .get(typename)
            .map(String::as_str)
            .unwrap_or(typename)
    }

    /// `identify(object) -> RecordId | null` (spec §4.1).
    pub fn identify(&self, obj: &Value) -> Option<String> {
        let typename = obj.get("__typename")?.as_str()?;
        let canonical = self.canonical_typename(typename);
        let id = match self.keys.get(canonical) {
            Some(key_fn) => key_fn(obj)?,
            None => default_key_fn(obj)?,
        };
        Some(format!("{canonical}:{id}"))
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
            interface_of: HashMap::new(),
        }
    }
}

/// Bounds on the initial storage load / network settlement waits (spec §5, §6).
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub suspension_timeout: Option<std::time::Duration>,
    pub hydration_timeout: Option<std::time::Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            suspension_timeout: None,
            hydration_timeout: None,
        }
    }
}

/// Whether the process is a development or production build, used by the
/// `executeQuery` cache-policy validation (spec §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    Development,
    Production,
}

impl Default for BuildMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            BuildMode::Development
        } else {
            BuildMode::Production
        }
    }
}

/// `createCache({...})` options (spec §6).
#[derive(Default, derivative::Derivative)]
#[derivative(Debug)]
pub struct CacheConfig {
    #[derivative(Debug = "ignore")]
    pub identity: IdentityConfig,
    pub timeouts: Timeouts,
    pub build_mode: BuildMode,
    #[derivative(Debug = "ignore")]
    pub on_telemetry: Option<Rc<dyn Fn(TelemetryEvent)>>,
}

/// Builder mirroring the teacher's `buildstructor`-style request builders:
/// required fields up front, optional fields via chained setters, `build()`
/// validates eagerly.
pub struct CacheConfigBuilder {
    keys: HashMap<String, KeyFn>,
    interfaces: HashMap<String, Vec<String>>,
    timeouts: Timeouts,
    build_mode: Option<BuildMode>,
    on_telemetry: Option<Rc<dyn Fn(TelemetryEvent)>>,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
            interfaces: HashMap::new(),
            timeouts: Timeouts::default(),
            build_mode: None,
            on_telemetry: None,
        }
    }

    pub fn key(mut self, typename: impl Into<String>, key_fn: KeyFn) -> Self {
        self.keys.insert(typename.into(), key_fn);
        self
    }

    pub fn interface(mut self, interface: impl Into<String>, implementors: Vec<String>) -> Self {
        self.interfaces.insert(interface.into(), implementors);
        self
    }

    pub fn suspension_timeout(mut self, d: std::time::Duration) -> Self {
        self.timeouts.suspension_timeout = Some(d);
        self
    }

    pub fn hydration_timeout(mut self, d: std::time::Duration) -> Self {
        self.timeouts.hydration_timeout = Some(d);
        self
    }

    pub fn build_mode(mut self, mode: BuildMode) -> Self {
        self.build_mode = Some(mode);
        self
    }

    pub fn on_telemetry(mut self, cb: Rc<dyn Fn(TelemetryEvent)>) -> Self {
        self.on_telemetry = Some(cb);
        self
    }

    pub fn build(self) -> Result<CacheConfig, CacheError> {
        Ok(CacheConfig {
            identity: IdentityConfig::new(self.keys, self.interfaces)?,
            timeouts: self.timeouts,
            build_mode: self.build_mode.unwrap_or_default(),
            on_telemetry: self.on_telemetry,
        })
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_key_fn_uses_id() {
        let identity = IdentityConfig::default();
        let obj = json!({"__typename": "User", "id": 1});
        assert_eq!(identity.identify(&obj).as_deref(), Some("User:1"));
    }

    #[test]
    fn interface_canonicalization() {
        let identity = IdentityConfig::new(
            HashMap::new(),
            HashMap::from([("Post".to_string(), vec!["AudioPost".to_string()])]),
        )
        .unwrap();
        let obj = json!({"__typename": "AudioPost", "id": "1"});
        assert_eq!(identity.identify(&obj).as_deref(), Some("Post:1"));
    }

    #[test]
    fn missing_typename_is_not_identifiable() {
        let identity = IdentityConfig::default();
        assert!(identity.identify(&json!({"id": 1})).is_none());
    }

    #[test]
    fn conflicting_interface_declaration_is_rejected() {
        let err = IdentityConfig::new(
            HashMap::new(),
            HashMap::from([
                ("Post".to_string(), vec!["AudioPost".to_string()]),
                ("Media".to_string(), vec!["AudioPost".to_string()]),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));
    }
}
