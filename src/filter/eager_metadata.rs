//! `EagerMetadataLearner`: before the client's first non-handshake request
//! is forwarded, injects a synthetic METADATA request upstream so address
//! reconciliation happens before the client ever sees an upstream address.
//! Once learned, the downstream connection is closed so the client
//! reconnects to the now-correct endpoint.
//!
//! If the client's own first request already is METADATA, the eager call
//! is elided and that request serves the same purpose once its response
//! passes through `BrokerAddressFilter`.
//!
//! One instance is constructed per accepted connection (see
//! `connection::FilterChainFactory`): its learned/not-learned state is not
//! meant to be shared across a virtual cluster's connections, since each
//! new client still needs its own eager lookup before it sees an address.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kafka_protocol::messages::{MetadataRequest, RequestHeader};
use tracing::info;

use crate::endpoint::EndpointRegistry;
use crate::frame::{DecodedRequestBody, DecodedResponseBody};

use super::{CloseConnection, FilterContext, FilterOutcome, KafkaFilter, RequestFilterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LearnerState {
    NotStarted,
    Done,
}

pub struct EagerMetadataLearner {
    registry: Arc<EndpointRegistry>,
    virtual_cluster: String,
    state: Mutex<LearnerState>,
}

impl EagerMetadataLearner {
    pub fn new(registry: Arc<EndpointRegistry>, virtual_cluster: String) -> Self {
        EagerMetadataLearner {
            registry,
            virtual_cluster,
            state: Mutex::new(LearnerState::NotStarted),
        }
    }

    fn mark_done(&self) {
        *self.state.lock().unwrap() = LearnerState::Done;
    }

    fn is_done(&self) -> bool {
        *self.state.lock().unwrap() == LearnerState::Done
    }
}

#[async_trait]
impl KafkaFilter for EagerMetadataLearner {
    fn name(&self) -> &str {
        "eager-metadata-learner"
    }

    fn should_handle_request(&self, _api_key: i16, _api_version: i16) -> bool {
        !self.is_done()
    }

    async fn on_request(
        &self,
        header: RequestHeader,
        body: DecodedRequestBody,
        ctx: &FilterContext,
    ) -> FilterOutcome<RequestFilterResult> {
        let forward_unchanged = || {
            FilterOutcome::forward_only(RequestFilterResult::Forward {
                header: Some(header.clone()),
                body: Some(body.clone()),
            })
        };

        if self.is_done() || self.registry.has_any_broker(&self.virtual_cluster) {
            self.mark_done();
            return forward_unchanged();
        }

        if let DecodedRequestBody::Metadata(_) = &body {
            // the client's own request will reconcile addresses once its
            // response passes through BrokerAddressFilter; no need to
            // inject a duplicate.
            self.mark_done();
            return forward_unchanged();
        }

        info!(virtual_cluster = %self.virtual_cluster, "injecting eager METADATA request before first client request");
        let internal_header = RequestHeader::default();
        let eager_request = MetadataRequest::default();
        match ctx
            .send_request(
                0,
                internal_header,
                DecodedRequestBody::Metadata(eager_request),
            )
            .await
        {
            Ok((_header, DecodedResponseBody::Metadata(md))) => {
                // internal responses are routed straight back to the
                // issuing filter and never pass through the downstream
                // filter chain, so BrokerAddressFilter never sees this one;
                // reconcile the registry here instead, then force the
                // client to reconnect to the now-correct endpoint.
                let discovered: Vec<(i32, String, i32)> = md
                    .brokers
                    .iter()
                    .map(|(id, b)| (id.0, b.host.to_string(), b.port))
                    .collect();
                let _ = self.registry.reconcile(&self.virtual_cluster, &discovered);
                self.mark_done();
                FilterOutcome {
                    result: RequestFilterResult::Drop,
                    close: CloseConnection(true),
                }
            }
            Ok(_) => {
                self.mark_done();
                forward_unchanged()
            }
            Err(_) => {
                // eager learning failed; don't block the client's own
                // request on it.
                self.mark_done();
                forward_unchanged()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kafka_protocol::messages::{BrokerId, MetadataResponse, MetadataResponseBroker, ResponseHeader};
    use kafka_protocol::protocol::StrBytes;
    use tokio::sync::mpsc;

    use crate::endpoint::{EndpointBindingPolicy, VirtualCluster};
    use crate::filter::context::deliver_internal_response;

    use super::*;

    fn test_vc(name: &str) -> VirtualCluster {
        VirtualCluster {
            name: name.to_string(),
            upstream_bootstrap: ("boot".to_string(), 9092),
            endpoint_binding_policy: EndpointBindingPolicy::StaticCluster { port: 0 },
            log_frames: false,
            log_network: false,
        }
    }

    #[tokio::test]
    async fn eager_request_reconciles_registry_before_client_sees_an_address() {
        let registry = Arc::new(EndpointRegistry::new());
        registry.register_virtual_cluster(test_vc("vc-a")).await.unwrap();
        let learner = EagerMetadataLearner::new(Arc::clone(&registry), "vc-a".to_string());

        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let (ctx, pending) = FilterContext::new(internal_tx);

        let responder = tokio::spawn(async move {
            let envelope = internal_rx.recv().await.expect("eager request sent");
            let mut md = MetadataResponse::default();
            md.brokers.insert(
                BrokerId(1),
                MetadataResponseBroker {
                    host: StrBytes::from_static_str("broker1"),
                    port: 9092,
                    ..Default::default()
                },
            );
            deliver_internal_response(
                &pending,
                envelope.handle,
                ResponseHeader::default(),
                DecodedResponseBody::Metadata(md),
            );
        });

        let outcome = learner
            .on_request(RequestHeader::default(), DecodedRequestBody::ApiVersions(Default::default()), &ctx)
            .await;

        responder.await.unwrap();

        assert!(matches!(outcome.result, RequestFilterResult::Drop));
        assert!(outcome.close.0);
        assert!(learner.is_done());
        assert_eq!(
            registry.broker_target("vc-a", 1),
            Some(("broker1".to_string(), 9092))
        );
    }

    #[tokio::test]
    async fn already_learned_clusters_skip_the_eager_request() {
        let registry = Arc::new(EndpointRegistry::new());
        registry.register_virtual_cluster(test_vc("vc-b")).await.unwrap();
        registry
            .reconcile("vc-b", &[(1, "broker1".to_string(), 9092)])
            .unwrap();
        let learner = EagerMetadataLearner::new(Arc::clone(&registry), "vc-b".to_string());

        let (internal_tx, _internal_rx) = mpsc::unbounded_channel();
        let (ctx, _pending) = FilterContext::new(internal_tx);

        let outcome = learner
            .on_request(RequestHeader::default(), DecodedRequestBody::ApiVersions(Default::default()), &ctx)
            .await;

        assert!(matches!(outcome.result, RequestFilterResult::Forward { .. }));
        assert!(!outcome.close.0);
    }
}
