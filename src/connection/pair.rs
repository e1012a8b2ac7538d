//! `ConnectionPair`: one downstream TCP channel bound to one upstream TCP
//! channel, shuttling frames through the filter chain.
//!
//! The teacher's `KafkaProxy::kafka_proxy` races a `remote_to_local` future
//! against a `local_to_remote` future with `tokio::select!` over
//! `FramedRead`/`FramedWrite` pairs. This generalizes that shape to four
//! concurrently-polled legs (two readers, two writers) connected by
//! channels, so that internal requests a filter originates can jump the
//! upstream write queue without waiting behind the frame the filter was
//! invoked for.
//!
//! Backpressure and frame ordering fall out of the design rather than
//! needing an explicit auto-read flag: each reader processes one frame
//! fully (decode, filter-dispatch, correlate) before reading the next,
//! and each writer is a single task draining a bounded channel, so a
//! stalled peer socket naturally stops the reader feeding it - the same
//! effect the source's auto-read toggle achieves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use kafka_protocol::messages::{ApiKey, ProduceRequest};
use kafka_protocol::protocol::HeaderVersion;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::wire::{FrameEncoder, RequestFrameCodec, ResponseFrameCodec};
use crate::codec::CorrelationManager;
use crate::filter::context::{deliver_internal_response, InternalRequestEnvelope};
use crate::filter::{FilterChain, FilterContext, RequestFilterResult, ResponseFilterResult};
use crate::frame::{expects_response, DecodedRequestBody, DecodedResponseBody, Frame};
use crate::metrics;

const CHANNEL_CAPACITY: usize = 128;

fn request_api_key(body: &DecodedRequestBody) -> ApiKey {
    match body {
        DecodedRequestBody::ApiVersions(_) => ApiKey::ApiVersionsKey,
        DecodedRequestBody::Metadata(_) => ApiKey::MetadataKey,
        DecodedRequestBody::Produce(_) => ApiKey::ProduceKey,
        DecodedRequestBody::FindCoordinator(_) => ApiKey::FindCoordinatorKey,
        DecodedRequestBody::DescribeCluster(_) => ApiKey::DescribeClusterKey,
    }
}

fn response_api_key(body: &DecodedResponseBody) -> ApiKey {
    match body {
        DecodedResponseBody::ApiVersions(_) => ApiKey::ApiVersionsKey,
        DecodedResponseBody::Metadata(_) => ApiKey::MetadataKey,
        DecodedResponseBody::Fetch(_) => ApiKey::FetchKey,
        DecodedResponseBody::FindCoordinator(_) => ApiKey::FindCoordinatorKey,
        DecodedResponseBody::DescribeCluster(_) => ApiKey::DescribeClusterKey,
    }
}

fn peek_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn peek_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_unsigned_varint(bytes: &[u8], at: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut pos = at;
    loop {
        let byte = *bytes.get(pos)?;
        value |= ((byte & 0x7f) as u64) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            return Some((value, pos));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

/// Skips a nullable string starting at `pos`: the regular `i16`-length
/// encoding pre-flexible-versions, or a compact (unsigned-varint, length+1,
/// 0 = null) encoding once the message is flexible. Returns the offset of
/// the byte right after it, or `None` if `bytes` doesn't reach that far.
fn skip_nullable_string(bytes: &[u8], pos: usize, flexible: bool) -> Option<usize> {
    if flexible {
        let (len, next) = read_unsigned_varint(bytes, pos)?;
        let str_len = if len == 0 { 0 } else { (len - 1) as usize };
        let end = next.checked_add(str_len)?;
        (end <= bytes.len()).then_some(end)
    } else {
        if pos + 2 > bytes.len() {
            return None;
        }
        let len = peek_i16(bytes, pos);
        let next = pos + 2;
        if len <= 0 {
            return Some(next);
        }
        let end = next.checked_add(len as usize)?;
        (end <= bytes.len()).then_some(end)
    }
}

/// Reads just far enough into a still-opaque PRODUCE request to find its
/// `acks` field, without decoding the whole message: past the header's
/// client_id (and tagged fields, once the header is flexible), then past
/// `transactional_id` (present from version 3 on). Returns `None` if the
/// frame doesn't reach that far, in which case the caller should assume a
/// response is expected rather than risk treating an `acks=0` produce as
/// one that isn't.
fn probe_produce_acks(bytes: &[u8], api_version: i16) -> Option<i16> {
    let flexible = ProduceRequest::header_version(api_version) >= 2;
    // length(4) + apiKey(2) + apiVersion(2) + correlationId(4)
    let mut pos = skip_nullable_string(bytes, 12, flexible)?;

    if flexible {
        let (tag_count, next) = read_unsigned_varint(bytes, pos)?;
        pos = next;
        for _ in 0..tag_count {
            let (_tag, next) = read_unsigned_varint(bytes, pos)?;
            let (size, next) = read_unsigned_varint(bytes, next)?;
            pos = next.checked_add(size as usize)?;
        }
    }

    if api_version >= 3 {
        pos = skip_nullable_string(bytes, pos, flexible)?;
    }

    if pos + 2 > bytes.len() {
        return None;
    }
    Some(peek_i16(bytes, pos))
}

/// Rewrites the 4-byte correlation id embedded in an opaque frame's bytes.
/// `offset` is 8 for requests (length + apiKey + apiVersion precede it) and
/// 4 for responses (only the length prefix precedes it).
fn patch_correlation_id(bytes: &Bytes, offset: usize, new_id: i32) -> Bytes {
    let mut patched = BytesMut::with_capacity(bytes.len());
    patched.extend_from_slice(&bytes[..offset]);
    patched.extend_from_slice(&new_id.to_be_bytes());
    patched.extend_from_slice(&bytes[offset + 4..]);
    patched.freeze()
}

pub struct ConnectionPair {
    filter_chain: Arc<FilterChain>,
    correlation_manager: Arc<CorrelationManager>,
    virtual_cluster: String,
    /// Identifies this downstream<->upstream pair in logs, the way the
    /// teacher's tunnel client tags each `handle_connection` with its own
    /// `Uuid` so the two legs of one tunnel can be told apart in a shared
    /// log stream.
    connection_id: Uuid,
}

impl ConnectionPair {
    pub fn new(
        filter_chain: Arc<FilterChain>,
        correlation_manager: Arc<CorrelationManager>,
        virtual_cluster: String,
    ) -> Self {
        ConnectionPair {
            filter_chain,
            correlation_manager,
            virtual_cluster,
            connection_id: Uuid::new_v4(),
        }
    }

    pub async fn run(self: Arc<Self>, downstream: TcpStream, upstream: TcpStream) -> anyhow::Result<()> {
        downstream.set_nodelay(true).ok();
        upstream.set_nodelay(true).ok();

        let (d_read, d_write) = downstream.into_split();
        let (u_read, u_write) = upstream.into_split();

        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<InternalRequestEnvelope>();
        let (ctx, pending) = FilterContext::new(internal_tx);

        let (upstream_tx, mut upstream_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let (downstream_tx, mut downstream_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);

        let closed = Arc::new(AtomicBool::new(false));

        let should_decode_request = {
            let chain = Arc::clone(&self.filter_chain);
            Arc::new(move |api_key: i16, api_version: i16| chain.should_handle_request(api_key, api_version))
        };

        let downstream_reader = {
            let this = Arc::clone(&self);
            let ctx = ctx.clone();
            let upstream_tx = upstream_tx.clone();
            let downstream_tx = downstream_tx.clone();
            let closed = Arc::clone(&closed);
            async move {
                let mut framed = FramedRead::new(d_read, RequestFrameCodec::new(should_decode_request));
                while let Some(item) = framed.next().await {
                    let frame = item?;
                    if this
                        .handle_downstream_frame(frame, &ctx, &upstream_tx, &downstream_tx)
                        .await?
                    {
                        closed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                Ok::<(), anyhow::Error>(())
            }
        };

        let upstream_reader = {
            let this = Arc::clone(&self);
            let ctx = ctx.clone();
            let downstream_tx = downstream_tx.clone();
            let pending = Arc::clone(&pending);
            let manager = Arc::clone(&self.correlation_manager);
            let closed = Arc::clone(&closed);
            async move {
                let mut framed = FramedRead::new(u_read, ResponseFrameCodec::new(manager));
                while let Some(item) = framed.next().await {
                    let (frame, entry) = item?;
                    if let Some(handle) = entry.recipient_filter {
                        if let Frame::DecodedResponse { header, body, .. } = frame {
                            deliver_internal_response(&pending, handle, header, body);
                        }
                        continue;
                    }
                    if this
                        .handle_upstream_frame(
                            frame,
                            entry.downstream_correlation_id,
                            entry.has_response,
                            &ctx,
                            &downstream_tx,
                        )
                        .await?
                    {
                        closed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
                Ok::<(), anyhow::Error>(())
            }
        };

        let upstream_writer = {
            let correlation_manager = Arc::clone(&self.correlation_manager);
            async move {
                let mut sink = FramedWrite::new(u_write, FrameEncoder);
                loop {
                    tokio::select! {
                        biased;
                        envelope = internal_rx.recv() => {
                            let Some(envelope) = envelope else { break };
                            let upstream_id = correlation_manager.put_broker_request_with_recipient(
                                request_api_key(&envelope.body),
                                envelope.api_version,
                                -1,
                                true,
                                true,
                                Some(envelope.handle),
                            );
                            let mut header = envelope.header;
                            header.correlation_id = upstream_id;
                            sink.send(Frame::InternalRequest {
                                api_version: envelope.api_version,
                                header,
                                body: envelope.body,
                                recipient: envelope.handle,
                            }).await?;
                        }
                        frame = upstream_rx.recv() => {
                            let Some(frame) = frame else { break };
                            sink.send(frame).await?;
                        }
                        else => break,
                    }
                }
                Ok::<(), anyhow::Error>(())
            }
        };

        let downstream_writer = async move {
            let mut sink = FramedWrite::new(d_write, FrameEncoder);
            while let Some(frame) = downstream_rx.recv().await {
                sink.send(frame).await?;
            }
            Ok::<(), anyhow::Error>(())
        };

        let result = tokio::select! {
            r = downstream_reader => r,
            r = upstream_reader => r,
            r = upstream_writer => r,
            r = downstream_writer => r,
        };

        if let Err(ref e) = result {
            error!(connection_id = %self.connection_id, virtual_cluster = %self.virtual_cluster, error = %e, "connection pair closed with error");
        } else {
            debug!(connection_id = %self.connection_id, virtual_cluster = %self.virtual_cluster, "connection pair closed cleanly");
        }
        result
    }

    /// Returns `Ok(true)` when the pair should close after this frame.
    async fn handle_downstream_frame(
        &self,
        frame: Frame,
        ctx: &FilterContext,
        upstream_tx: &mpsc::Sender<Frame>,
        downstream_tx: &mpsc::Sender<Frame>,
    ) -> anyhow::Result<bool> {
        match frame {
            Frame::Opaque { bytes } => {
                if bytes.len() < 12 {
                    anyhow::bail!("truncated opaque request frame");
                }
                let api_key_raw = peek_i16(&bytes, 4);
                let api_version = peek_i16(&bytes, 6);
                let downstream_correlation_id = peek_i32(&bytes, 8);
                let decode_response = self.filter_chain.should_handle_response(api_key_raw, api_version);
                metrics::record_frame("downstream_in", api_key_raw, false);
                let api_key = ApiKey::try_from(api_key_raw).unwrap_or(ApiKey::ProduceKey);
                let has_response = if api_key == ApiKey::ProduceKey {
                    probe_produce_acks(&bytes, api_version)
                        .map(|acks| acks != 0)
                        .unwrap_or(true)
                } else {
                    true
                };
                let upstream_id = self.correlation_manager.put_broker_request(
                    api_key,
                    api_version,
                    downstream_correlation_id,
                    has_response,
                    decode_response,
                );
                let bytes = patch_correlation_id(&bytes, 8, upstream_id);
                upstream_tx
                    .send(Frame::Opaque { bytes })
                    .await
                    .map_err(|_| anyhow::anyhow!("upstream writer closed"))?;
                Ok(false)
            }
            Frame::DecodedRequest {
                api_version,
                header,
                body,
            } => {
                let api_key = request_api_key(&body) as i16;
                metrics::record_frame("downstream_in", api_key, true);
                let downstream_correlation_id = header.correlation_id;
                let outcome = self
                    .filter_chain
                    .dispatch_request(api_key, api_version, header, body, ctx)
                    .await?;

                match outcome.result {
                    RequestFilterResult::Forward {
                        header: Some(header),
                        body: Some(body),
                    } => {
                        let has_response = expects_response(&body);
                        let decode_response = self.filter_chain.should_handle_response(api_key, api_version);
                        let upstream_id = self.correlation_manager.put_broker_request(
                            request_api_key(&body),
                            api_version,
                            downstream_correlation_id,
                            has_response,
                            decode_response,
                        );
                        let mut header = header;
                        header.correlation_id = upstream_id;
                        upstream_tx
                            .send(Frame::DecodedRequest {
                                api_version,
                                header,
                                body,
                            })
                            .await
                            .map_err(|_| anyhow::anyhow!("upstream writer closed"))?;
                    }
                    RequestFilterResult::Forward { .. } => {
                        anyhow::bail!("filter forward result missing header/body");
                    }
                    RequestFilterResult::Drop => {
                        debug!(api_key, "request dropped by filter chain");
                    }
                    RequestFilterResult::ShortCircuit { header, body } => {
                        let mut response_header = header.unwrap_or_default();
                        response_header.correlation_id = downstream_correlation_id;
                        downstream_tx
                            .send(Frame::DecodedResponse {
                                api_version,
                                header: response_header,
                                body,
                            })
                            .await
                            .map_err(|_| anyhow::anyhow!("downstream writer closed"))?;
                    }
                }
                Ok(outcome.close.0)
            }
            other => {
                warn!("unexpected frame variant on downstream read path: {other:?}");
                Ok(false)
            }
        }
    }

    /// Returns `Ok(true)` when the pair should close after this frame.
    async fn handle_upstream_frame(
        &self,
        frame: Frame,
        downstream_correlation_id: i32,
        has_response: bool,
        ctx: &FilterContext,
        downstream_tx: &mpsc::Sender<Frame>,
    ) -> anyhow::Result<bool> {
        match frame {
            Frame::Opaque { bytes } => {
                let bytes = patch_correlation_id(&bytes, 4, downstream_correlation_id);
                downstream_tx
                    .send(Frame::Opaque { bytes })
                    .await
                    .map_err(|_| anyhow::anyhow!("downstream writer closed"))?;
                Ok(false)
            }
            Frame::DecodedResponse {
                api_version,
                header,
                body,
            } => {
                let api_key = response_api_key(&body) as i16;
                let outcome = self
                    .filter_chain
                    .dispatch_response(api_key, api_version, header, body, has_response, ctx)
                    .await?;
                match outcome.result {
                    ResponseFilterResult::Forward {
                        header: Some(mut header),
                        body: Some(body),
                    } => {
                        header.correlation_id = downstream_correlation_id;
                        downstream_tx
                            .send(Frame::DecodedResponse {
                                api_version,
                                header,
                                body,
                            })
                            .await
                            .map_err(|_| anyhow::anyhow!("downstream writer closed"))?;
                    }
                    ResponseFilterResult::Forward { .. } => {
                        anyhow::bail!("filter forward result missing header/body");
                    }
                    ResponseFilterResult::Drop => {
                        debug!("response dropped by filter chain");
                    }
                    ResponseFilterResult::ShortCircuit { header, body } => {
                        let mut header = header.unwrap_or_default();
                        header.correlation_id = downstream_correlation_id;
                        downstream_tx
                            .send(Frame::DecodedResponse {
                                api_version,
                                header,
                                body,
                            })
                            .await
                            .map_err(|_| anyhow::anyhow!("downstream writer closed"))?;
                    }
                }
                Ok(outcome.close.0)
            }
            other => {
                warn!("unexpected frame variant on upstream read path: {other:?}");
                Ok(false)
            }
        }
    }
}
