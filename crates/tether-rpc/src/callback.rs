//! Before- and after-invoke callback chains.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_proto::{RpcRequest, RpcResponse};

use crate::error::RpcError;

/// Transforms a request before it is sent.
pub type BeforeFn = Box<dyn Fn(RpcRequest) -> Result<RpcRequest, RpcError> + Send + Sync>;

/// Transforms a response after it is received.
pub type AfterFn = Box<dyn Fn(RpcResponse) -> Result<RpcResponse, RpcError> + Send + Sync>;

/// Builds before-invoke callbacks from their JSON config.
pub trait BeforeFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, config: &Value) -> Result<BeforeFn, RpcError>;
}

/// Builds after-invoke callbacks from their JSON config.
pub trait AfterFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, config: &Value) -> Result<AfterFn, RpcError>;
}

/// Reference to a registered callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

impl CallbackConfig {
    pub fn new(name: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Named callback factories.
#[derive(Default)]
pub struct CallbackRegistry {
    before: DashMap<String, Arc<dyn BeforeFactory>>,
    after: DashMap<String, Arc<dyn AfterFactory>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `header_rename` and `header_inject`.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_before(HeaderRename);
        registry.register_after(HeaderInject);
        registry
    }

    pub fn register_before(&self, factory: impl BeforeFactory + 'static) {
        self.before
            .insert(factory.name().to_owned(), Arc::new(factory));
    }

    pub fn register_after(&self, factory: impl AfterFactory + 'static) {
        self.after.insert(factory.name().to_owned(), Arc::new(factory));
    }

    fn before(&self, name: &str) -> Option<Arc<dyn BeforeFactory>> {
        self.before.get(name).map(|f| Arc::clone(f.value()))
    }

    fn after(&self, name: &str) -> Option<Arc<dyn AfterFactory>> {
        self.after.get(name).map(|f| Arc::clone(f.value()))
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut before: Vec<String> = self.before.iter().map(|e| e.key().clone()).collect();
        let mut after: Vec<String> = self.after.iter().map(|e| e.key().clone()).collect();
        before.sort();
        after.sort();
        f.debug_struct("CallbackRegistry")
            .field("before", &before)
            .field("after", &after)
            .finish()
    }
}

/// Ordered before- and after-invoke callbacks of one invoker.
#[derive(Default)]
pub struct CallbackChain {
    before: Vec<(String, BeforeFn)>,
    after: Vec<(String, AfterFn)>,
}

impl CallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the before callback `conf` names. Unknown or misconfigured
    /// callbacks are logged and skipped.
    pub fn add_before(&mut self, registry: &CallbackRegistry, conf: &CallbackConfig) {
        let Some(factory) = registry.before(&conf.name) else {
            tracing::error!(callback = %conf.name, "unknown before-invoke callback");
            return;
        };
        match factory.create(&conf.config) {
            Ok(f) => self.before.push((conf.name.clone(), f)),
            Err(e) => {
                tracing::error!(callback = %conf.name, error = %e, "before-invoke callback init failed");
            }
        }
    }

    /// Appends the after callback `conf` names. Unknown or misconfigured
    /// callbacks are logged and skipped.
    pub fn add_after(&mut self, registry: &CallbackRegistry, conf: &CallbackConfig) {
        let Some(factory) = registry.after(&conf.name) else {
            tracing::error!(callback = %conf.name, "unknown after-invoke callback");
            return;
        };
        match factory.create(&conf.config) {
            Ok(f) => self.after.push((conf.name.clone(), f)),
            Err(e) => {
                tracing::error!(callback = %conf.name, error = %e, "after-invoke callback init failed");
            }
        }
    }

    /// Runs the before callbacks in order, stopping at the first error.
    pub fn before_invoke(&self, mut req: RpcRequest) -> Result<RpcRequest, RpcError> {
        for (_, f) in &self.before {
            req = f(req)?;
        }
        Ok(req)
    }

    /// Runs the after callbacks in order, stopping at the first error.
    pub fn after_invoke(&self, mut resp: RpcResponse) -> Result<RpcResponse, RpcError> {
        for (_, f) in &self.after {
            resp = f(resp)?;
        }
        Ok(resp)
    }

    pub fn before_names(&self) -> Vec<&str> {
        self.before.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn after_names(&self) -> Vec<&str> {
        self.after.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl fmt::Debug for CallbackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackChain")
            .field("before", &self.before_names())
            .field("after", &self.after_names())
            .finish()
    }
}

/// Parses a `{"key": "value"}` object of strings.
fn string_pairs(name: &str, config: &Value) -> Result<Vec<(String, String)>, RpcError> {
    let object = config
        .as_object()
        .ok_or_else(|| RpcError::Callback(format!("{name} config must be an object")))?;
    object
        .iter()
        .map(|(k, v)| match v.as_str() {
            Some(v) => Ok((k.clone(), v.to_owned())),
            None => Err(RpcError::Callback(format!("{name}: value of {k} is not a string"))),
        })
        .collect()
}

/// Renames request headers, configured as `{"from": "to"}`.
#[derive(Debug, Clone, Copy)]
pub struct HeaderRename;

impl BeforeFactory for HeaderRename {
    fn name(&self) -> &str {
        "header_rename"
    }

    fn create(&self, config: &Value) -> Result<BeforeFn, RpcError> {
        let renames = string_pairs(self.name(), config)?;
        Ok(Box::new(move |mut req| {
            for (from, to) in &renames {
                if let Some(values) = req.header.remove(from) {
                    for value in values {
                        req.header.append(to.clone(), value);
                    }
                }
            }
            Ok(req)
        }))
    }
}

/// Sets fixed response headers, configured as `{"name": "value"}`.
#[derive(Debug, Clone, Copy)]
pub struct HeaderInject;

impl AfterFactory for HeaderInject {
    fn name(&self) -> &str {
        "header_inject"
    }

    fn create(&self, config: &Value) -> Result<AfterFn, RpcError> {
        let headers = string_pairs(self.name(), config)?;
        Ok(Box::new(move |mut resp| {
            for (name, value) in &headers {
                resp.header.set(name.clone(), value.clone());
            }
            Ok(resp)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Reject;

    impl BeforeFactory for Reject {
        fn name(&self) -> &str {
            "reject"
        }

        fn create(&self, _config: &Value) -> Result<BeforeFn, RpcError> {
            Ok(Box::new(|_| Err(RpcError::Callback("rejected".into()))))
        }
    }

    struct Tag;

    impl BeforeFactory for Tag {
        fn name(&self) -> &str {
            "tag"
        }

        fn create(&self, config: &Value) -> Result<BeforeFn, RpcError> {
            let tag = config
                .as_str()
                .ok_or_else(|| RpcError::Callback("tag needs a string".into()))?
                .to_owned();
            Ok(Box::new(move |req| Ok(req.with_header("tags", tag.clone()))))
        }
    }

    fn registry() -> CallbackRegistry {
        let registry = CallbackRegistry::with_defaults();
        registry.register_before(Reject);
        registry.register_before(Tag);
        registry
    }

    #[test]
    fn before_chain_runs_in_order() {
        let registry = registry();
        let mut chain = CallbackChain::new();
        chain.add_before(&registry, &CallbackConfig::new("tag", json!("a")));
        chain.add_before(&registry, &CallbackConfig::new("tag", json!("b")));

        let req = chain
            .before_invoke(RpcRequest::new("1", "m", ""))
            .unwrap();
        assert_eq!(req.header.get("tags"), "a,b");
    }

    #[test]
    fn first_error_short_circuits() {
        let registry = registry();
        let mut chain = CallbackChain::new();
        chain.add_before(&registry, &CallbackConfig::new("reject", Value::Null));
        chain.add_before(&registry, &CallbackConfig::new("tag", json!("never")));

        let err = chain
            .before_invoke(RpcRequest::new("1", "m", ""))
            .unwrap_err();
        assert_eq!(err.to_string(), "Callback error: rejected");
    }

    #[test]
    fn unknown_and_misconfigured_callbacks_are_skipped() {
        let registry = registry();
        let mut chain = CallbackChain::new();
        chain.add_before(&registry, &CallbackConfig::new("missing", Value::Null));
        chain.add_before(&registry, &CallbackConfig::new("tag", json!(1)));
        chain.add_after(&registry, &CallbackConfig::new("missing", Value::Null));

        assert!(chain.before_names().is_empty());
        assert!(chain.after_names().is_empty());
    }

    #[test]
    fn header_rename_moves_values() {
        let registry = registry();
        let mut chain = CallbackChain::new();
        chain.add_before(
            &registry,
            &CallbackConfig::new("header_rename", json!({"x-app": "app"})),
        );

        let req = RpcRequest::new("1", "m", "")
            .with_header("x-app", "one")
            .with_header("x-app", "two");
        let req = chain.before_invoke(req).unwrap();
        assert!(!req.header.contains_key("x-app"));
        assert_eq!(req.header.get("app"), "one,two");
    }

    #[test]
    fn header_inject_sets_response_headers() {
        let registry = registry();
        let mut chain = CallbackChain::new();
        chain.add_after(
            &registry,
            &CallbackConfig::new("header_inject", json!({"x-served-by": "tether"})),
        );

        let resp = chain.after_invoke(RpcResponse::default()).unwrap();
        assert_eq!(resp.header.get("x-served-by"), "tether");
        assert_eq!(chain.after_names(), vec!["header_inject"]);
    }

    #[test]
    fn builtin_config_must_be_string_map() {
        assert!(HeaderRename.create(&json!(["a"])).is_err());
        assert!(HeaderInject.create(&json!({"a": 1})).is_err());
    }
}
