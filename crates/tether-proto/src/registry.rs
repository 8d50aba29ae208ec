//! Name-keyed registry of protocol codecs.

use std::fmt;

use dashmap::DashMap;

use crate::bolt::Bolt;
use crate::codec::TransportProtocol;
use crate::dubbo::Dubbo;

/// Builds a fresh, uninitialised codec.
pub type ProtocolFactory = fn() -> Box<dyn TransportProtocol>;

/// Registry of codec factories.
///
/// Every lookup returns a new instance so that per-channel `init` state
/// (such as a bolt class name) is never shared between channels.
pub struct ProtocolRegistry {
    factories: DashMap<String, ProtocolFactory>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Creates a registry holding the `bolt`, `boltv2` and `dubbo` codecs.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("bolt", || Box::new(Bolt::v1()));
        registry.register("boltv2", || Box::new(Bolt::v2()));
        registry.register("dubbo", || Box::new(Dubbo::new()));
        registry
    }

    /// Registers (or replaces) the factory for `name`.
    pub fn register(&self, name: impl Into<String>, factory: ProtocolFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Returns a new codec for `name`, or `None` if it is not registered.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Box<dyn TransportProtocol>> {
        self.factories.get(name).map(|factory| (*factory)())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.names())
            .finish()
    }
}
