//! `FilterContext`: lets a filter issue its own request upstream
//! (`send_request`) outside the normal request/response flow it was
//! invoked for. Such requests are given fresh correlation ids and their
//! responses are delivered only to the issuing filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use kafka_protocol::messages::{RequestHeader, ResponseHeader};
use tokio::sync::{mpsc, oneshot};

use crate::error::FilterError;
use crate::frame::{DecodedRequestBody, DecodedResponseBody, InternalRequestHandle};

/// A request a filter wants written upstream, tagged with the handle its
/// response will be routed back under: a monotonically increasing handle
/// rather than object identity, so the routing survives the filter being
/// invoked again concurrently.
pub struct InternalRequestEnvelope {
    pub api_version: i16,
    pub header: RequestHeader,
    pub body: DecodedRequestBody,
    pub handle: InternalRequestHandle,
}

type PendingMap = DashMap<InternalRequestHandle, oneshot::Sender<(ResponseHeader, DecodedResponseBody)>>;

#[derive(Clone)]
pub struct FilterContext {
    handle_counter: Arc<AtomicU64>,
    internal_request_tx: mpsc::UnboundedSender<InternalRequestEnvelope>,
    pending: Arc<PendingMap>,
}

impl FilterContext {
    pub fn new(internal_request_tx: mpsc::UnboundedSender<InternalRequestEnvelope>) -> (Self, Arc<PendingMap>) {
        let pending = Arc::new(DashMap::new());
        (
            FilterContext {
                handle_counter: Arc::new(AtomicU64::new(0)),
                internal_request_tx,
                pending: Arc::clone(&pending),
            },
            pending,
        )
    }

    /// Issues a request upstream and awaits its response, bypassing the
    /// normal downstream-bound filter chain.
    pub async fn send_request(
        &self,
        api_version: i16,
        header: RequestHeader,
        body: DecodedRequestBody,
    ) -> Result<(ResponseHeader, DecodedResponseBody), FilterError> {
        let handle = InternalRequestHandle(self.handle_counter.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(handle, tx);
        self.internal_request_tx
            .send(InternalRequestEnvelope {
                api_version,
                header,
                body,
                handle,
            })
            .map_err(|_| FilterError::Failed {
                filter: "internal-request".to_string(),
                reason: "connection pair closed".to_string(),
            })?;
        rx.await.map_err(|_| FilterError::Failed {
            filter: "internal-request".to_string(),
            reason: "response channel dropped before an answer arrived".to_string(),
        })
    }
}

/// Delivers an internal response to the filter that originally sent the
/// request, called by the connection pair when it sees a response tagged
/// with a recipient handle.
pub fn deliver_internal_response(
    pending: &PendingMap,
    handle: InternalRequestHandle,
    header: ResponseHeader,
    body: DecodedResponseBody,
) {
    if let Some((_, tx)) = pending.remove(&handle) {
        let _ = tx.send((header, body));
    }
}
