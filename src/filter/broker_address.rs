//! `BrokerAddressFilter`: rewrites broker `(host, port)` fields in
//! METADATA, DESCRIBE_CLUSTER, and FIND_COORDINATOR responses to
//! proxy-visible addresses. `nodeId < 0` (coordinator unavailable) is left
//! untouched.
//!
//! Generalizes the teacher's `KafkaProxy::adapt_metadata`, which rewrites
//! exactly one apiKey (METADATA) for exactly one binding shape, to the
//! three response types and the richer `Binding` model the endpoint
//! registry exposes.

use std::sync::Arc;

use async_trait::async_trait;
use kafka_protocol::messages::ResponseHeader;
use kafka_protocol::protocol::StrBytes;
use tracing::debug;

use crate::endpoint::EndpointRegistry;
use crate::frame::DecodedResponseBody;

use super::{FilterContext, FilterOutcome, KafkaFilter, ResponseFilterResult};

pub struct BrokerAddressFilter {
    registry: Arc<EndpointRegistry>,
    virtual_cluster: String,
}

impl BrokerAddressFilter {
    pub fn new(registry: Arc<EndpointRegistry>, virtual_cluster: String) -> Self {
        BrokerAddressFilter {
            registry,
            virtual_cluster,
        }
    }

    fn rewrite_metadata(&self, mut md: kafka_protocol::messages::MetadataResponse) -> kafka_protocol::messages::MetadataResponse {
        let discovered: Vec<(i32, String, i32)> = md
            .brokers
            .iter()
            .map(|(id, b)| (id.0, b.host.to_string(), b.port))
            .collect();
        if let Ok(rewritten) = self.registry.reconcile(&self.virtual_cluster, &discovered) {
            for (node_id, (host, port)) in rewritten {
                if let Some(broker) = md.brokers.get_mut(&kafka_protocol::messages::BrokerId(node_id)) {
                    broker.host = StrBytes::from_string(host);
                    broker.port = port as i32;
                }
            }
        }
        md
    }

    fn rewrite_describe_cluster(
        &self,
        mut dc: kafka_protocol::messages::DescribeClusterResponse,
    ) -> kafka_protocol::messages::DescribeClusterResponse {
        let discovered: Vec<(i32, String, i32)> = dc
            .brokers
            .iter()
            .map(|(id, b)| (id.0, b.host.to_string(), b.port))
            .collect();
        if let Ok(rewritten) = self.registry.reconcile(&self.virtual_cluster, &discovered) {
            for (node_id, (host, port)) in rewritten {
                if let Some(broker) = dc.brokers.get_mut(&kafka_protocol::messages::BrokerId(node_id)) {
                    broker.host = StrBytes::from_string(host);
                    broker.port = port as i32;
                }
            }
        }
        dc
    }

    fn rewrite_find_coordinator(
        &self,
        mut fc: kafka_protocol::messages::FindCoordinatorResponse,
    ) -> kafka_protocol::messages::FindCoordinatorResponse {
        if fc.node_id.0 >= 0 {
            if let Ok(rewritten) = self.registry.reconcile(
                &self.virtual_cluster,
                &[(fc.node_id.0, fc.host.to_string(), fc.port)],
            ) {
                if let Some((_, (host, port))) = rewritten.into_iter().next() {
                    fc.host = StrBytes::from_string(host);
                    fc.port = port as i32;
                }
            }
        }
        for coordinator in fc.coordinators.iter_mut() {
            if coordinator.node_id.0 < 0 {
                continue;
            }
            if let Ok(rewritten) = self.registry.reconcile(
                &self.virtual_cluster,
                &[(coordinator.node_id.0, coordinator.host.to_string(), coordinator.port)],
            ) {
                if let Some((_, (host, port))) = rewritten.into_iter().next() {
                    coordinator.host = StrBytes::from_string(host);
                    coordinator.port = port as i32;
                }
            }
        }
        fc
    }
}

#[async_trait]
impl KafkaFilter for BrokerAddressFilter {
    fn name(&self) -> &str {
        "broker-address"
    }

    fn should_handle_response(&self, api_key: i16, _api_version: i16) -> bool {
        use kafka_protocol::messages::ApiKey::*;
        matches!(
            kafka_protocol::messages::ApiKey::try_from(api_key),
            Ok(MetadataKey) | Ok(DescribeClusterKey) | Ok(FindCoordinatorKey)
        )
    }

    async fn on_response(
        &self,
        header: ResponseHeader,
        body: DecodedResponseBody,
        _ctx: &FilterContext,
    ) -> FilterOutcome<ResponseFilterResult> {
        let body = match body {
            DecodedResponseBody::Metadata(md) => {
                debug!(virtual_cluster = %self.virtual_cluster, "rewriting broker addresses in METADATA response");
                DecodedResponseBody::Metadata(self.rewrite_metadata(md))
            }
            DecodedResponseBody::DescribeCluster(dc) => {
                DecodedResponseBody::DescribeCluster(self.rewrite_describe_cluster(dc))
            }
            DecodedResponseBody::FindCoordinator(fc) => {
                DecodedResponseBody::FindCoordinator(self.rewrite_find_coordinator(fc))
            }
            other => other,
        };
        FilterOutcome::forward_only(ResponseFilterResult::Forward {
            header: Some(header),
            body: Some(body),
        })
    }
}
