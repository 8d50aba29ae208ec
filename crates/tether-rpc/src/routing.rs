//! Domain to cluster to host routing for the routed channel.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

/// Resolves where a routed call goes.
#[async_trait]
pub trait RoutingTable: Send + Sync + std::fmt::Debug {
    /// The cluster serving `domain`, if any.
    async fn cluster_for(&self, domain: &str) -> Option<String>;

    /// Live `host:port` addresses of `cluster`.
    async fn hosts(&self, cluster: &str) -> Vec<String>;
}

/// A virtual host as delivered by route discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VirtualHost {
    pub domains: Vec<String>,
    /// Target cluster of each route, in route order.
    #[serde(default)]
    pub routes: Vec<String>,
}

/// Static routes and cluster membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub virtual_hosts: Vec<VirtualHost>,
    /// Cluster name to host addresses.
    #[serde(default)]
    pub clusters: HashMap<String, Vec<String>>,
}

/// In-memory routing table, updated as route and cluster updates arrive.
#[derive(Debug, Default)]
pub struct StaticRoutingTable {
    domains: DashMap<String, String>,
    clusters: DashMap<String, Vec<String>>,
}

impl StaticRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        let table = Self::new();
        table.update_virtual_hosts(&config.virtual_hosts);
        for (cluster, hosts) in &config.clusters {
            table.set_hosts(cluster.clone(), hosts.clone());
        }
        table
    }

    /// Points every domain of each virtual host at its first route's cluster.
    ///
    /// Virtual hosts without routes are skipped.
    pub fn update_virtual_hosts(&self, hosts: &[VirtualHost]) {
        for host in hosts {
            let Some(cluster) = host.routes.first() else {
                continue;
            };
            for domain in &host.domains {
                self.domains.insert(domain.clone(), cluster.clone());
            }
        }
        tracing::info!(domains = self.domains.len(), "routing table updated");
    }

    pub fn set_route(&self, domain: impl Into<String>, cluster: impl Into<String>) {
        self.domains.insert(domain.into(), cluster.into());
    }

    /// Replaces the host set of `cluster`.
    pub fn set_hosts(&self, cluster: impl Into<String>, hosts: Vec<String>) {
        self.clusters.insert(cluster.into(), hosts);
    }

    /// A table with one domain served by one cluster.
    pub fn single(
        domain: impl Into<String>,
        cluster: impl Into<String>,
        hosts: Vec<String>,
    ) -> Self {
        let cluster = cluster.into();
        let table = Self::new();
        table.set_route(domain, cluster.clone());
        table.set_hosts(cluster, hosts);
        table
    }
}

#[async_trait]
impl RoutingTable for StaticRoutingTable {
    async fn cluster_for(&self, domain: &str) -> Option<String> {
        self.domains.get(domain).map(|c| c.value().clone())
    }

    async fn hosts(&self, cluster: &str) -> Vec<String> {
        self.clusters
            .get(cluster)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }
}
