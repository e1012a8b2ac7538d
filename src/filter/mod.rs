//! The filter chain: an ordered list of filters, each seeing only
//! the frames it declared interest in, completing asynchronously with a
//! forward/drop/short-circuit/close outcome.

pub mod broker_address;
pub mod chain;
pub mod context;
pub mod eager_metadata;

pub use chain::FilterChain;
pub use context::FilterContext;

use async_trait::async_trait;

use crate::frame::{DecodedRequestBody, DecodedResponseBody};
use kafka_protocol::messages::{RequestHeader, ResponseHeader};

/// Effect a filter's completed future has on the frame it was given.
#[derive(Debug, Clone)]
pub enum FilterResult<Header, BodyT> {
    /// Write the (possibly rewritten) frame to the next stage.
    Forward {
        header: Option<Header>,
        body: Option<BodyT>,
    },
    /// Discard the frame. For a request with a response, upstream will
    /// never see it and no response is expected.
    Drop,
    /// Emit a synthetic response back to the client without contacting
    /// upstream. Legal only when the request expects a response.
    ShortCircuit {
        header: Option<ResponseHeader>,
        body: DecodedResponseBody,
    },
}

/// Orthogonal flag a filter may attach to any `FilterResult`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseConnection(pub bool);

pub type RequestFilterResult = FilterResult<RequestHeader, DecodedRequestBody>;
pub type ResponseFilterResult = FilterResult<ResponseHeader, DecodedResponseBody>;

/// A filter's full verdict on a single frame: the effect plus whether the
/// connection pair should close afterwards.
pub struct FilterOutcome<R> {
    pub result: R,
    pub close: CloseConnection,
}

impl<R> FilterOutcome<R> {
    pub fn forward_only(result: R) -> Self {
        FilterOutcome {
            result,
            close: CloseConnection(false),
        }
    }
}

/// The capability interface a filter implements:
/// `should_handle_*` tells the wire codec whether to decode a frame at
/// all; `on_*` is the async dispatch a decoded frame receives.
#[async_trait]
pub trait KafkaFilter: Send + Sync {
    /// Stable identifier used in logs, metrics, and timeout messages.
    fn name(&self) -> &str;

    fn should_handle_request(&self, _api_key: i16, _api_version: i16) -> bool {
        false
    }

    fn should_handle_response(&self, _api_key: i16, _api_version: i16) -> bool {
        false
    }

    async fn on_request(
        &self,
        _header: RequestHeader,
        body: DecodedRequestBody,
        _ctx: &FilterContext,
    ) -> FilterOutcome<RequestFilterResult> {
        FilterOutcome::forward_only(RequestFilterResult::Forward {
            header: None,
            body: Some(body),
        })
    }

    async fn on_response(
        &self,
        _header: ResponseHeader,
        body: DecodedResponseBody,
        _ctx: &FilterContext,
    ) -> FilterOutcome<ResponseFilterResult> {
        FilterOutcome::forward_only(ResponseFilterResult::Forward {
            header: None,
            body: Some(body),
        })
    }
}
