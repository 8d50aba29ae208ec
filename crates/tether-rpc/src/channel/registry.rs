//! Name-keyed registry of channel constructors.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tether_proto::ProtocolRegistry;

use super::{Channel, ChannelConfig, HttpChannel, MultiplexedChannel, RoutedChannel};
use crate::bridge::AcceptHook;
use crate::error::RpcError;
use crate::routing::{RoutingTable, StaticRoutingTable};

/// Collaborators handed to every channel constructor.
#[derive(Clone, Debug)]
pub struct ChannelContext {
    pub protocols: Arc<ProtocolRegistry>,
    pub accept_hook: Arc<dyn AcceptHook>,
    pub routing: Arc<dyn RoutingTable>,
}

impl ChannelContext {
    /// Creates a context with the default codecs and an empty routing table.
    pub fn new(accept_hook: Arc<dyn AcceptHook>) -> Self {
        Self {
            protocols: Arc::new(ProtocolRegistry::with_defaults()),
            accept_hook,
            routing: Arc::new(StaticRoutingTable::new()),
        }
    }

    #[must_use]
    pub fn with_protocols(mut self, protocols: Arc<ProtocolRegistry>) -> Self {
        self.protocols = protocols;
        self
    }

    #[must_use]
    pub fn with_routing(mut self, routing: Arc<dyn RoutingTable>) -> Self {
        self.routing = routing;
        self
    }
}

/// Builds a channel from its configuration.
pub type ChannelFactory =
    Arc<dyn Fn(&ChannelConfig, &ChannelContext) -> Result<Arc<dyn Channel>, RpcError> + Send + Sync>;

/// Registry of channel constructors keyed by protocol name.
pub struct ChannelRegistry {
    factories: DashMap<String, ChannelFactory>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Creates a registry with the multiplexed (`bolt`, `boltv2`, `dubbo`),
    /// `http` and `routed` channels.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for protocol in ["bolt", "boltv2", "dubbo"] {
            registry.register(protocol, |config, ctx| {
                Ok(Arc::new(MultiplexedChannel::new(config, ctx)?))
            });
        }
        registry.register("http", |config, ctx| Ok(Arc::new(HttpChannel::new(config, ctx))));
        registry.register("routed", |_, ctx| {
            Ok(Arc::new(RoutedChannel::new(Arc::clone(&ctx.routing))))
        });
        registry
    }

    /// Registers (or replaces) the constructor for `protocol`.
    pub fn register<F>(&self, protocol: impl Into<String>, factory: F)
    where
        F: Fn(&ChannelConfig, &ChannelContext) -> Result<Arc<dyn Channel>, RpcError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(protocol.into(), Arc::new(factory));
    }

    /// Builds the channel named by `config.protocol`.
    pub fn get_channel(
        &self,
        config: &ChannelConfig,
        ctx: &ChannelContext,
    ) -> Result<Arc<dyn Channel>, RpcError> {
        let factory = self
            .factories
            .get(&config.protocol)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RpcError::ChannelNotFound(config.protocol.clone()))?;
        factory(config, ctx)
    }

    #[must_use]
    pub fn contains(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.names())
            .finish()
    }
}
