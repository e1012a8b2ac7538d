//! Builds a fresh `FilterChain` for each accepted connection.
//!
//! Most filters (`BrokerAddressFilter`, `RecordEncryptionFilter`, ...) are
//! stateless enough, or hold their own internally-shared state
//! (`Arc<EndpointRegistry>`, `Arc<DekManager>`), to be reused as-is across
//! every connection to a virtual cluster. `EagerMetadataLearner` is the
//! exception: its not-started/done state tracks whether *this* connection
//! has done its eager lookup yet, so a fresh one is built per connection
//! rather than shared.

use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::EndpointRegistry;
use crate::filter::chain::FilterChain;
use crate::filter::eager_metadata::EagerMetadataLearner;
use crate::filter::KafkaFilter;

pub struct FilterChainFactory {
    registry: Arc<EndpointRegistry>,
    virtual_cluster: String,
    shared_filters: Vec<Arc<dyn KafkaFilter>>,
    per_filter_timeout: Duration,
}

impl FilterChainFactory {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        virtual_cluster: String,
        shared_filters: Vec<Arc<dyn KafkaFilter>>,
        per_filter_timeout: Duration,
    ) -> Self {
        FilterChainFactory {
            registry,
            virtual_cluster,
            shared_filters,
            per_filter_timeout,
        }
    }

    /// Constructs the chain for one new connection: a fresh
    /// `EagerMetadataLearner` ahead of the shared, configured filters.
    pub fn build(&self) -> FilterChain {
        let mut chain: Vec<Arc<dyn KafkaFilter>> = vec![Arc::new(EagerMetadataLearner::new(
            Arc::clone(&self.registry),
            self.virtual_cluster.clone(),
        ))];
        chain.extend(self.shared_filters.iter().cloned());
        FilterChain::new(chain, self.per_filter_timeout)
    }
}
