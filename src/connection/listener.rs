//! Accept loop for one virtual cluster's listener sockets.
//!
//! TLS-terminated SNI extraction is out of scope for this crate (no TLS
//! library is wired in yet, see `config::TlsConfig`); every accepted
//! connection currently resolves via the listener's default binding.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::codec::CorrelationManager;
use crate::endpoint::EndpointRegistry;

use super::{ConnectionPair, FilterChainFactory};

/// Runs the accept loop for every listener socket a virtual cluster's
/// binding policy requires, dialing the resolved upstream target for each
/// accepted connection and spawning an independent `ConnectionPair` task.
/// Each accepted connection gets its own `FilterChain` from `chain_factory`,
/// so per-connection filter state (see `FilterChainFactory`) never leaks
/// across clients.
pub async fn serve_virtual_cluster(
    vc_name: String,
    listeners: Vec<TcpListener>,
    registry: Arc<EndpointRegistry>,
    chain_factory: Arc<FilterChainFactory>,
) {
    let mut tasks = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let vc_name = vc_name.clone();
        let registry = Arc::clone(&registry);
        let chain_factory = Arc::clone(&chain_factory);
        tasks.push(tokio::spawn(async move {
            loop {
                let (downstream, peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(virtual_cluster = %vc_name, error = %e, "accept failed");
                        continue;
                    }
                };
                let local_addr = match downstream.local_addr() {
                    Ok(addr) => addr,
                    Err(_) => continue,
                };
                let binding = match registry.resolve(local_addr, None) {
                    Ok(binding) => binding,
                    Err(e) => {
                        warn!(%peer_addr, error = %e, "no binding for accepted connection");
                        continue;
                    }
                };
                let (host, port) = binding.upstream_target().clone();
                let filter_chain = Arc::new(chain_factory.build());
                let vc_name = vc_name.clone();
                tokio::spawn(async move {
                    let upstream = match tokio::net::TcpStream::connect((host.as_str(), port)).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!(%peer_addr, upstream = %host, port, error = %e, "failed to dial upstream");
                            return;
                        }
                    };
                    info!(%peer_addr, upstream = %host, port, virtual_cluster = %vc_name, "connection pair established");
                    let pair = Arc::new(ConnectionPair::new(
                        filter_chain,
                        Arc::new(CorrelationManager::new()),
                        vc_name,
                    ));
                    if let Err(e) = pair.run(downstream, upstream).await {
                        error!(%peer_addr, error = %e, "connection pair terminated");
                    }
                });
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}
