//! The `Frame` data model: a tagged variant over opaque bytes and
//! decoded request/response pairs, plus the per-connection API-version
//! intersection cached after the first upstream API_VERSIONS exchange.
//!
//! `kafka-protocol`'s generated message types require `Self: Sized` in
//! their `Decodable` impls, so a single `Box<dyn ...>` body can't erase
//! over every apiKey. Instead, following the teacher's `KafkaResponse`
//! enum (which closes over just the one apiKey it cares about -
//! `Metadata`), `DecodedRequestBody`/`DecodedResponseBody` close over the
//! apiKeys the filters in this crate actually decode.

use bytes::Bytes;
use kafka_protocol::messages::{
    ApiVersionsRequest, ApiVersionsResponse, DescribeClusterRequest, DescribeClusterResponse,
    FetchResponse, FindCoordinatorRequest, FindCoordinatorResponse, MetadataRequest,
    MetadataResponse, ProduceRequest, RequestHeader, ResponseHeader,
};
use std::collections::HashMap;
use std::ops::RangeInclusive;

#[derive(Debug, Clone)]
pub enum DecodedRequestBody {
    ApiVersions(ApiVersionsRequest),
    Metadata(MetadataRequest),
    Produce(ProduceRequest),
    FindCoordinator(FindCoordinatorRequest),
    DescribeCluster(DescribeClusterRequest),
}

#[derive(Debug, Clone)]
pub enum DecodedResponseBody {
    ApiVersions(ApiVersionsResponse),
    Metadata(MetadataResponse),
    Fetch(FetchResponse),
    FindCoordinator(FindCoordinatorResponse),
    DescribeCluster(DescribeClusterResponse),
}

/// One frame moving through the pipeline in one direction.
#[derive(Debug, Clone)]
pub enum Frame {
    /// On-wire bytes no installed filter needs decoded, including the
    /// 4-byte length prefix.
    Opaque { bytes: Bytes },
    DecodedRequest {
        api_version: i16,
        header: RequestHeader,
        body: DecodedRequestBody,
    },
    DecodedResponse {
        api_version: i16,
        header: ResponseHeader,
        body: DecodedResponseBody,
    },
    /// A request a filter originated itself via `FilterContext::send_request`;
    /// it is written upstream like any other request but its response is
    /// routed back to the issuing filter instead of downstream.
    InternalRequest {
        api_version: i16,
        header: RequestHeader,
        body: DecodedRequestBody,
        recipient: InternalRequestHandle,
    },
    InternalResponse {
        header: ResponseHeader,
        body: DecodedResponseBody,
        recipient: InternalRequestHandle,
    },
}

/// Whether this request expects a response at all. Every supported apiKey
/// does except PRODUCE with `acks=0`, which brokers never acknowledge.
pub fn expects_response(body: &DecodedRequestBody) -> bool {
    match body {
        DecodedRequestBody::Produce(p) => p.acks != 0,
        _ => true,
    }
}

/// Monotonically increasing handle identifying an internal request a
/// filter issued, letting its response be routed back to that filter
/// without relying on object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternalRequestHandle(pub u64);

/// Per-apiKey version window, captured once per upstream connection on the
/// first successful API_VERSIONS exchange.
#[derive(Debug, Clone, Default)]
pub struct ApiVersionRanges {
    ranges: HashMap<i16, (RangeInclusive<i16>, RangeInclusive<i16>)>,
}

impl ApiVersionRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the upstream-advertised range for one apiKey and computes
    /// the intersection with this proxy's own supported range. A resulting
    /// empty intersection removes the key (it is dropped from
    /// downstream-visible API_VERSIONS responses).
    pub fn record(&mut self, api_key: i16, upstream: RangeInclusive<i16>, proxy: RangeInclusive<i16>) {
        let lo = *upstream.start().max(proxy.start());
        let hi = *upstream.end().min(proxy.end());
        if lo <= hi {
            self.ranges.insert(api_key, (upstream, lo..=hi));
        } else {
            self.ranges.remove(&api_key);
        }
    }

    pub fn intersected(&self, api_key: i16) -> Option<&RangeInclusive<i16>> {
        self.ranges.get(&api_key).map(|(_, intersected)| intersected)
    }

    pub fn upstream(&self, api_key: i16) -> Option<&RangeInclusive<i16>> {
        self.ranges.get(&api_key).map(|(upstream, _)| upstream)
    }

    pub fn supported_keys(&self) -> impl Iterator<Item = i16> + '_ {
        self.ranges.keys().copied()
    }

    pub fn is_captured(&self) -> bool {
        !self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_narrows_to_overlap() {
        let mut ranges = ApiVersionRanges::new();
        ranges.record(0, 0..=9, 3..=7);
        assert_eq!(ranges.intersected(0), Some(&(3..=7)));
    }

    #[test]
    fn disjoint_ranges_are_dropped() {
        let mut ranges = ApiVersionRanges::new();
        ranges.record(0, 0..=2, 5..=7);
        assert_eq!(ranges.intersected(0), None);
    }
}
