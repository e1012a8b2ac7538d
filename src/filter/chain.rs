//! Ordered filter dispatch: every async filter invocation is bounded
//! by a per-filter timeout; a timed-out or failed filter closes the
//! connection pair.

use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::messages::{RequestHeader, ResponseHeader};
use tracing::warn;

use crate::error::FilterError;
use crate::frame::{expects_response, DecodedRequestBody, DecodedResponseBody};
use crate::metrics;

use super::{
    CloseConnection, FilterContext, FilterOutcome, KafkaFilter, RequestFilterResult,
    ResponseFilterResult,
};

pub struct FilterChain {
    filters: Vec<Arc<dyn KafkaFilter>>,
    per_filter_timeout: Duration,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn KafkaFilter>>, per_filter_timeout: Duration) -> Self {
        FilterChain {
            filters,
            per_filter_timeout,
        }
    }

    pub fn should_handle_request(&self, api_key: i16, api_version: i16) -> bool {
        self.filters
            .iter()
            .any(|f| f.should_handle_request(api_key, api_version))
    }

    pub fn should_handle_response(&self, api_key: i16, api_version: i16) -> bool {
        self.filters
            .iter()
            .any(|f| f.should_handle_response(api_key, api_version))
    }

    /// Runs a decoded request through every filter that declared interest,
    /// in order. A `Drop`/`ShortCircuit` short-circuits the remaining
    /// filters; a `Forward` lets later filters see the (possibly
    /// rewritten) frame.
    pub async fn dispatch_request(
        &self,
        api_key: i16,
        api_version: i16,
        mut header: RequestHeader,
        mut body: DecodedRequestBody,
        ctx: &FilterContext,
    ) -> Result<FilterOutcome<RequestFilterResult>, FilterError> {
        let mut close = CloseConnection(false);
        for filter in &self.filters {
            if !filter.should_handle_request(api_key, api_version) {
                continue;
            }
            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(
                self.per_filter_timeout,
                filter.on_request(header.clone(), body.clone(), ctx),
            )
            .await
            .map_err(|_| {
                warn!(filter = filter.name(), "filter request dispatch timed out");
                FilterError::Timeout {
                    filter: filter.name().to_string(),
                }
            })?;

            let outcome_label = match &outcome.result {
                RequestFilterResult::Forward { .. } => "forward",
                RequestFilterResult::Drop => "drop",
                RequestFilterResult::ShortCircuit { .. } => "short_circuit",
            };
            metrics::record_filter_dispatch(filter.name(), outcome_label, started.elapsed().as_secs_f64());

            close = CloseConnection(close.0 || outcome.close.0);
            match outcome.result {
                RequestFilterResult::Forward {
                    header: new_header,
                    body: new_body,
                } => {
                    if let Some(h) = new_header {
                        header = h;
                    }
                    if let Some(b) = new_body {
                        body = b;
                    }
                }
                RequestFilterResult::ShortCircuit { .. } if !expects_response(&body) => {
                    let err = FilterError::ShortCircuitForbidden {
                        filter: filter.name().to_string(),
                    };
                    warn!(filter = filter.name(), error = %err, "dropping instead");
                    return Ok(FilterOutcome {
                        result: RequestFilterResult::Drop,
                        close,
                    });
                }
                terminal => {
                    return Ok(FilterOutcome {
                        result: terminal,
                        close,
                    })
                }
            }
        }
        Ok(FilterOutcome {
            result: RequestFilterResult::Forward {
                header: Some(header),
                body: Some(body),
            },
            close,
        })
    }

    /// As `dispatch_request`, for the upstream-to-downstream direction.
    /// `has_response` reflects whether the request this response answers
    /// actually expects one; a response-side short-circuit only makes sense
    /// when the downstream client is still waiting for something.
    pub async fn dispatch_response(
        &self,
        api_key: i16,
        api_version: i16,
        mut header: ResponseHeader,
        mut body: DecodedResponseBody,
        has_response: bool,
        ctx: &FilterContext,
    ) -> Result<FilterOutcome<ResponseFilterResult>, FilterError> {
        let mut close = CloseConnection(false);
        for filter in &self.filters {
            if !filter.should_handle_response(api_key, api_version) {
                continue;
            }
            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(
                self.per_filter_timeout,
                filter.on_response(header.clone(), body.clone(), ctx),
            )
            .await
            .map_err(|_| {
                warn!(filter = filter.name(), "filter response dispatch timed out");
                FilterError::Timeout {
                    filter: filter.name().to_string(),
                }
            })?;

            let outcome_label = match &outcome.result {
                ResponseFilterResult::Forward { .. } => "forward",
                ResponseFilterResult::Drop => "drop",
                ResponseFilterResult::ShortCircuit { .. } => "short_circuit",
            };
            metrics::record_filter_dispatch(filter.name(), outcome_label, started.elapsed().as_secs_f64());

            close = CloseConnection(close.0 || outcome.close.0);
            match outcome.result {
                ResponseFilterResult::Forward {
                    header: new_header,
                    body: new_body,
                } => {
                    if let Some(h) = new_header {
                        header = h;
                    }
                    if let Some(b) = new_body {
                        body = b;
                    }
                }
                ResponseFilterResult::ShortCircuit { .. } if !has_response => {
                    let err = FilterError::ShortCircuitForbidden {
                        filter: filter.name().to_string(),
                    };
                    warn!(filter = filter.name(), error = %err, "dropping instead");
                    return Ok(FilterOutcome {
                        result: ResponseFilterResult::Drop,
                        close,
                    });
                }
                terminal => {
                    return Ok(FilterOutcome {
                        result: terminal,
                        close,
                    })
                }
            }
        }
        Ok(FilterOutcome {
            result: ResponseFilterResult::Forward {
                header: Some(header),
                body: Some(body),
            },
            close,
        })
    }
}
