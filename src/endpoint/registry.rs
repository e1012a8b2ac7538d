//! Maps listener sockets (+ optional SNI hostname or per-broker port) to
//! `(virtualCluster, upstreamTarget)` bindings.

use std::net::SocketAddr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

/// `(host, port)` the connection pair should dial for a resolved binding.
pub type UpstreamTarget = (String, u16);

/// One of the three listener topologies a virtual cluster can expose.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointBindingPolicy {
    /// `bootstrapPort, bootstrapPort+1, … bootstrapPort+N` for `N` brokers.
    PortPerBroker { bootstrap_port: u16, broker_count: u16 },
    /// A single port; brokers are distinguished by SNI hostname.
    SniRouting { port: u16, hostname_pattern: String },
    /// A single fixed bootstrap address.
    StaticCluster { port: u16 },
}

impl EndpointBindingPolicy {
    /// Every local port this policy needs bound, for the startup
    /// port-collision check.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        match self {
            EndpointBindingPolicy::PortPerBroker {
                bootstrap_port,
                broker_count,
            } => (0..=*broker_count)
                .map(|offset| ([0, 0, 0, 0], bootstrap_port + offset).into())
                .collect(),
            EndpointBindingPolicy::SniRouting { port, .. } => vec![([0, 0, 0, 0], *port).into()],
            EndpointBindingPolicy::StaticCluster { port } => vec![([0, 0, 0, 0], *port).into()],
        }
    }
}

/// A configured virtual cluster: name, upstream bootstrap address, TLS
/// settings (when wired up), binding policy, and logging flags. Immutable
/// once started.
#[derive(Debug, Clone)]
pub struct VirtualCluster {
    pub name: String,
    pub upstream_bootstrap: UpstreamTarget,
    pub endpoint_binding_policy: EndpointBindingPolicy,
    pub log_frames: bool,
    pub log_network: bool,
}

/// Either a bootstrap binding (`virtualCluster, upstreamTarget`) or a
/// per-broker binding (`virtualCluster, nodeId, upstreamTarget`) learned
/// through reconciliation.
#[derive(Debug, Clone)]
pub enum Binding {
    Bootstrap {
        virtual_cluster: String,
        upstream_target: UpstreamTarget,
    },
    Broker {
        virtual_cluster: String,
        node_id: i32,
        upstream_target: UpstreamTarget,
    },
}

impl Binding {
    pub fn upstream_target(&self) -> &UpstreamTarget {
        match self {
            Binding::Bootstrap { upstream_target, .. } => upstream_target,
            Binding::Broker { upstream_target, .. } => upstream_target,
        }
    }

    pub fn virtual_cluster(&self) -> &str {
        match self {
            Binding::Bootstrap { virtual_cluster, .. } => virtual_cluster,
            Binding::Broker { virtual_cluster, .. } => virtual_cluster,
        }
    }
}

#[derive(Debug)]
pub enum RegistryError {
    PortCollision(SocketAddr),
    UnknownVirtualCluster(String),
    NoBindingFor { addr: SocketAddr, sni: Option<String> },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::PortCollision(addr) => write!(f, "port collision at {addr}"),
            RegistryError::UnknownVirtualCluster(name) => {
                write!(f, "unknown virtual cluster '{name}'")
            }
            RegistryError::NoBindingFor { addr, sni } => {
                write!(f, "no binding for {addr} (sni={sni:?})")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
struct ListenKey {
    addr: SocketAddr,
    sni: Option<String>,
}

/// Process-wide registry; reconciliation is called concurrently from every
/// connection worker that observes a METADATA/FindCoordinator/
/// DescribeCluster response, so the internal maps are lock-free
/// (`dashmap`) like the teacher's own inflight-request table.
pub struct EndpointRegistry {
    virtual_clusters: DashMap<String, VirtualCluster>,
    listen_bindings: DashMap<ListenKey, Binding>,
    broker_targets: DashMap<(String, i32), UpstreamTarget>,
    default_binding_per_addr: DashMap<SocketAddr, Binding>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        EndpointRegistry {
            virtual_clusters: DashMap::new(),
            listen_bindings: DashMap::new(),
            broker_targets: DashMap::new(),
            default_binding_per_addr: DashMap::new(),
        }
    }

    /// Binds the listener socket(s) this virtual cluster's policy implies
    /// and registers the bootstrap binding. A port already claimed by a
    /// previously registered virtual cluster is a fatal startup error.
    pub async fn register_virtual_cluster(
        &self,
        vc: VirtualCluster,
    ) -> Result<Vec<TcpListener>, RegistryError> {
        let addrs = vc.endpoint_binding_policy.listen_addrs();
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            if self.default_binding_per_addr.contains_key(addr) {
                return Err(RegistryError::PortCollision(*addr));
            }
        }
        for addr in &addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|_| RegistryError::PortCollision(*addr))?;
            info!(%addr, virtual_cluster = %vc.name, "bound listener");
            let binding = Binding::Bootstrap {
                virtual_cluster: vc.name.clone(),
                upstream_target: vc.upstream_bootstrap.clone(),
            };
            self.listen_bindings.insert(
                ListenKey {
                    addr: *addr,
                    sni: None,
                },
                binding.clone(),
            );
            self.default_binding_per_addr.insert(*addr, binding);
            listeners.push(listener);
        }
        self.virtual_clusters.insert(vc.name.clone(), vc);
        Ok(listeners)
    }

    /// Unregisters a virtual cluster and evicts every binding derived from
    /// it.
    pub fn unregister_virtual_cluster(&self, name: &str) {
        self.virtual_clusters.remove(name);
        self.listen_bindings
            .retain(|_, binding| binding.virtual_cluster() != name);
        self.default_binding_per_addr
            .retain(|_, binding| binding.virtual_cluster() != name);
        self.broker_targets.retain(|(vc, _), _| vc != name);
    }

    /// Upserts broker bindings discovered in a METADATA/DescribeCluster/
    /// FindCoordinator response and returns the proxy-visible `(host,
    /// port)` for each discovered node, for the BrokerAddressFilter to
    /// rewrite into the response it forwards downstream.
    pub fn reconcile(
        &self,
        vc_name: &str,
        discovered_brokers: &[(i32, String, i32)],
    ) -> Result<Vec<(i32, UpstreamTarget)>, RegistryError> {
        let vc = self
            .virtual_clusters
            .get(vc_name)
            .ok_or_else(|| RegistryError::UnknownVirtualCluster(vc_name.to_string()))?;
        let mut rewritten = Vec::with_capacity(discovered_brokers.len());
        for (node_id, host, port) in discovered_brokers {
            if *node_id < 0 {
                // coordinator unavailable: left untouched
                continue;
            }
            let upstream_target = (host.clone(), *port as u16);
            self.broker_targets
                .insert((vc_name.to_string(), *node_id), upstream_target.clone());
            let proxy_visible = self.proxy_visible_addr(&vc, *node_id);
            self.listen_bindings.insert(
                ListenKey {
                    addr: proxy_visible,
                    sni: None,
                },
                Binding::Broker {
                    virtual_cluster: vc_name.to_string(),
                    node_id: *node_id,
                    upstream_target,
                },
            );
            rewritten.push((*node_id, (proxy_visible.ip().to_string(), proxy_visible.port())));
        }
        Ok(rewritten)
    }

    fn proxy_visible_addr(&self, vc: &VirtualCluster, node_id: i32) -> SocketAddr {
        match &vc.endpoint_binding_policy {
            EndpointBindingPolicy::PortPerBroker { bootstrap_port, .. } => {
                ([0, 0, 0, 0], bootstrap_port + 1 + node_id as u16).into()
            }
            EndpointBindingPolicy::SniRouting { port, .. } => ([0, 0, 0, 0], *port).into(),
            EndpointBindingPolicy::StaticCluster { port } => ([0, 0, 0, 0], *port).into(),
        }
    }

    /// Resolves the binding for an accepted downstream connection. SNI
    /// wins when present; otherwise falls back to the listener's default
    /// binding.
    pub fn resolve(
        &self,
        downstream_addr: SocketAddr,
        sni_hostname: Option<&str>,
    ) -> Result<Binding, RegistryError> {
        if let Some(sni) = sni_hostname {
            if let Some(binding) = self.listen_bindings.get(&ListenKey {
                addr: downstream_addr,
                sni: Some(sni.to_string()),
            }) {
                return Ok(binding.clone());
            }
        }
        self.default_binding_per_addr
            .get(&downstream_addr)
            .map(|b| b.clone())
            .ok_or(RegistryError::NoBindingFor {
                addr: downstream_addr,
                sni: sni_hostname.map(str::to_string),
            })
    }

    pub fn broker_target(&self, vc_name: &str, node_id: i32) -> Option<UpstreamTarget> {
        self.broker_targets
            .get(&(vc_name.to_string(), node_id))
            .map(|t| t.clone())
    }

    /// Whether this virtual cluster has ever been reconciled against a
    /// live broker list, used by `EagerMetadataLearner` to decide whether
    /// bootstrap reconciliation is still needed.
    pub fn has_any_broker(&self, vc_name: &str) -> bool {
        self.broker_targets.iter().any(|e| e.key().0 == vc_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vc(name: &str, port: u16) -> VirtualCluster {
        VirtualCluster {
            name: name.to_string(),
            upstream_bootstrap: ("broker0".to_string(), 9092),
            endpoint_binding_policy: EndpointBindingPolicy::StaticCluster { port },
            log_frames: false,
            log_network: false,
        }
    }

    #[tokio::test]
    async fn register_then_resolve_bootstrap_binding() {
        let registry = EndpointRegistry::new();
        let listeners = registry
            .register_virtual_cluster(test_vc("vc-a", 0))
            .await
            .unwrap();
        let addr = listeners[0].local_addr().unwrap();
        let binding = registry.resolve(addr, None).unwrap();
        assert_eq!(binding.virtual_cluster(), "vc-a");
    }

    #[tokio::test]
    async fn reconcile_tracks_broker_targets() {
        let registry = EndpointRegistry::new();
        registry
            .register_virtual_cluster(test_vc("vc-a", 0))
            .await
            .unwrap();
        let rewritten = registry
            .reconcile(
                "vc-a",
                &[(1, "host1".to_string(), 9092), (2, "host2".to_string(), 9092)],
            )
            .unwrap();
        assert_eq!(rewritten.len(), 2);
        assert_eq!(
            registry.broker_target("vc-a", 1),
            Some(("host1".to_string(), 9092))
        );
    }

    #[tokio::test]
    async fn negative_node_id_is_left_untouched() {
        let registry = EndpointRegistry::new();
        registry
            .register_virtual_cluster(test_vc("vc-a", 0))
            .await
            .unwrap();
        let rewritten = registry
            .reconcile("vc-a", &[(-1, "unused".to_string(), 0)])
            .unwrap();
        assert!(rewritten.is_empty());
    }

    #[tokio::test]
    async fn unregister_evicts_bindings() {
        let registry = EndpointRegistry::new();
        let listeners = registry
            .register_virtual_cluster(test_vc("vc-a", 0))
            .await
            .unwrap();
        let addr = listeners[0].local_addr().unwrap();
        registry.unregister_virtual_cluster("vc-a");
        assert!(registry.resolve(addr, None).is_err());
    }
}
