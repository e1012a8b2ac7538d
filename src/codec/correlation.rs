//! Correlation manager: rewrites correlation ids downstream<->upstream
//! and records, per outstanding upstream request, whether a response is
//! expected and whether it needs decoding.
//!
//! Single-threaded per connection in this proxy's own scheduling model,
//! but built on `dashmap` — the same concurrent map the teacher reaches for
//! its inflight-request table in `kafka::KafkaServerCodec` — so that a
//! connection's worker can still be handed off or inspected without extra
//! locking.

use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;
use kafka_protocol::messages::ApiKey;

use crate::error::CorrelationError;
use crate::frame::InternalRequestHandle;

/// The downstream correlation id, apiKey/apiVersion, whether a response is
/// expected, whether it needs decoding, and (for internally-originated
/// requests) which filter should receive the response. Created the moment
/// a request is written upstream; consumed when the matching response
/// arrives.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    pub downstream_correlation_id: i32,
    pub api_key: ApiKey,
    pub api_version: i16,
    pub has_response: bool,
    pub decode_response: bool,
    pub recipient_filter: Option<InternalRequestHandle>,
}

pub struct CorrelationManager {
    next_upstream_id: AtomicI32,
    inflight: DashMap<i32, CorrelationEntry>,
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationManager {
    pub fn new() -> Self {
        CorrelationManager {
            next_upstream_id: AtomicI32::new(0),
            inflight: DashMap::new(),
        }
    }

    /// Mints a fresh upstream correlation id for a request about to be
    /// written upstream. If `has_response` is false (PRODUCE with
    /// `acks=0`), no entry is stored — this keeps the table from growing
    /// unboundedly for requests that will never see a response — but the
    /// id is still minted so the bytes written upstream stay internally
    /// consistent.
    pub fn put_broker_request(
        &self,
        api_key: ApiKey,
        api_version: i16,
        downstream_correlation_id: i32,
        has_response: bool,
        decode_response: bool,
    ) -> i32 {
        self.put_broker_request_with_recipient(
            api_key,
            api_version,
            downstream_correlation_id,
            has_response,
            decode_response,
            None,
        )
    }

    /// As `put_broker_request`, but also tags the entry with the filter
    /// that should receive the response directly instead of it flowing
    /// through the normal downstream-bound filter chain (see
    /// `FilterContext::send_request`).
    pub fn put_broker_request_with_recipient(
        &self,
        api_key: ApiKey,
        api_version: i16,
        downstream_correlation_id: i32,
        has_response: bool,
        decode_response: bool,
        recipient_filter: Option<InternalRequestHandle>,
    ) -> i32 {
        let upstream_id = self.next_upstream_id.fetch_add(1, Ordering::Relaxed);
        if has_response {
            self.inflight.insert(
                upstream_id,
                CorrelationEntry {
                    downstream_correlation_id,
                    api_key,
                    api_version,
                    has_response,
                    decode_response,
                    recipient_filter,
                },
            );
        }
        upstream_id
    }

    /// Removes and returns the entry for an upstream response. A response
    /// for a missing entry is a protocol violation: the caller must fail
    /// the connection, since at most one correlation entry should ever
    /// exist per in-flight upstream request.
    pub fn take_response(&self, upstream_id: i32) -> Result<CorrelationEntry, CorrelationError> {
        self.inflight
            .remove(&upstream_id)
            .map(|(_, entry)| entry)
            .ok_or(CorrelationError::UnknownCorrelationId(upstream_id))
    }

    pub fn outstanding_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_zero_style_requests_store_no_entry() {
        let mgr = CorrelationManager::new();
        let id = mgr.put_broker_request(ApiKey::ProduceKey, 9, 42, false, false);
        assert_eq!(mgr.outstanding_count(), 0);
        assert!(mgr.take_response(id).is_err());
    }

    #[test]
    fn round_trip_preserves_downstream_id() {
        let mgr = CorrelationManager::new();
        let upstream_id = mgr.put_broker_request(ApiKey::MetadataKey, 9, 42, true, true);
        let entry = mgr.take_response(upstream_id).unwrap();
        assert_eq!(entry.downstream_correlation_id, 42);
        assert_eq!(entry.api_key, ApiKey::MetadataKey);
    }

    #[test]
    fn upstream_ids_are_unique_per_connection() {
        let mgr = CorrelationManager::new();
        let a = mgr.put_broker_request(ApiKey::MetadataKey, 9, 1, true, true);
        let b = mgr.put_broker_request(ApiKey::MetadataKey, 9, 2, true, true);
        assert_ne!(a, b);
    }

    #[test]
    fn response_for_missing_entry_is_an_error() {
        let mgr = CorrelationManager::new();
        assert!(mgr.take_response(999).is_err());
    }
}
