//! Frame delimiting and selective decoding.
//!
//! Kafka frames a 4-byte big-endian length prefix followed by `length`
//! bytes of payload. We reuse the teacher's exact `LengthDelimitedCodec`
//! configuration (`num_skip(0)`, `length_adjustment(4)`) so the decoded
//! item still carries its length prefix — opaque frames are then just
//! those bytes, unmodified, ready to forward.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, ApiVersionsResponse, DescribeClusterRequest,
    DescribeClusterResponse, FetchResponse, FindCoordinatorRequest, FindCoordinatorResponse,
    MetadataRequest, MetadataResponse, ProduceRequest, RequestHeader, ResponseHeader,
};
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::codec::CorrelationEntry;
use crate::error::CodecError;
use crate::frame::{DecodedRequestBody, DecodedResponseBody, Frame};

/// apiKeys this proxy's filters ever need decoded. Anything outside this
/// set is always forwarded opaque, regardless of filter interest, because
/// no typed body exists for it in this crate.
pub const SUPPORTED_API_KEYS: &[ApiKey] = &[
    ApiKey::ProduceKey,
    ApiKey::FetchKey,
    ApiKey::MetadataKey,
    ApiKey::ApiVersionsKey,
    ApiKey::FindCoordinatorKey,
    ApiKey::DescribeClusterKey,
];

pub(crate) fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .num_skip(0) // keep the 4-byte length prefix in the decoded item
        .length_adjustment(4)
        .new_codec()
}

fn request_header_version(api_key: ApiKey, api_version: i16) -> i16 {
    match api_key {
        ApiKey::ApiVersionsKey => ApiVersionsRequest::header_version(api_version),
        ApiKey::MetadataKey => MetadataRequest::header_version(api_version),
        ApiKey::ProduceKey => ProduceRequest::header_version(api_version),
        ApiKey::FindCoordinatorKey => FindCoordinatorRequest::header_version(api_version),
        ApiKey::DescribeClusterKey => DescribeClusterRequest::header_version(api_version),
        _ => 1,
    }
}

fn response_header_version(api_key: ApiKey, api_version: i16) -> i16 {
    match api_key {
        ApiKey::ApiVersionsKey => ApiVersionsResponse::header_version(api_version),
        ApiKey::MetadataKey => MetadataResponse::header_version(api_version),
        ApiKey::FetchKey => FetchResponse::header_version(api_version),
        ApiKey::FindCoordinatorKey => FindCoordinatorResponse::header_version(api_version),
        ApiKey::DescribeClusterKey => DescribeClusterResponse::header_version(api_version),
        _ => 0,
    }
}

fn decode_request_body(
    api_key: ApiKey,
    api_version: i16,
    buf: &mut BytesMut,
) -> Result<DecodedRequestBody, CodecError> {
    Ok(match api_key {
        ApiKey::ApiVersionsKey => {
            DecodedRequestBody::ApiVersions(ApiVersionsRequest::decode(buf, api_version)?)
        }
        ApiKey::MetadataKey => {
            DecodedRequestBody::Metadata(MetadataRequest::decode(buf, api_version)?)
        }
        ApiKey::ProduceKey => DecodedRequestBody::Produce(ProduceRequest::decode(buf, api_version)?),
        ApiKey::FindCoordinatorKey => {
            DecodedRequestBody::FindCoordinator(FindCoordinatorRequest::decode(buf, api_version)?)
        }
        ApiKey::DescribeClusterKey => {
            DecodedRequestBody::DescribeCluster(DescribeClusterRequest::decode(buf, api_version)?)
        }
        other => {
            return Err(CodecError::UnknownApiKey {
                api_key: other as i16,
                api_version,
            })
        }
    })
}

fn encode_request_body(
    body: &DecodedRequestBody,
    api_version: i16,
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    match body {
        DecodedRequestBody::ApiVersions(b) => b.encode(dst, api_version)?,
        DecodedRequestBody::Metadata(b) => b.encode(dst, api_version)?,
        DecodedRequestBody::Produce(b) => b.encode(dst, api_version)?,
        DecodedRequestBody::FindCoordinator(b) => b.encode(dst, api_version)?,
        DecodedRequestBody::DescribeCluster(b) => b.encode(dst, api_version)?,
    }
    Ok(())
}

fn decode_response_body(
    api_key: ApiKey,
    api_version: i16,
    buf: &mut BytesMut,
) -> Result<DecodedResponseBody, CodecError> {
    Ok(match api_key {
        ApiKey::ApiVersionsKey => {
            DecodedResponseBody::ApiVersions(ApiVersionsResponse::decode(buf, api_version)?)
        }
        ApiKey::MetadataKey => {
            DecodedResponseBody::Metadata(MetadataResponse::decode(buf, api_version)?)
        }
        ApiKey::FetchKey => DecodedResponseBody::Fetch(FetchResponse::decode(buf, api_version)?),
        ApiKey::FindCoordinatorKey => {
            DecodedResponseBody::FindCoordinator(FindCoordinatorResponse::decode(buf, api_version)?)
        }
        ApiKey::DescribeClusterKey => {
            DecodedResponseBody::DescribeCluster(DescribeClusterResponse::decode(buf, api_version)?)
        }
        other => {
            return Err(CodecError::UnknownApiKey {
                api_key: other as i16,
                api_version,
            })
        }
    })
}

fn encode_response_body(
    body: &DecodedResponseBody,
    api_version: i16,
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    match body {
        DecodedResponseBody::ApiVersions(b) => b.encode(dst, api_version)?,
        DecodedResponseBody::Metadata(b) => b.encode(dst, api_version)?,
        DecodedResponseBody::Fetch(b) => b.encode(dst, api_version)?,
        DecodedResponseBody::FindCoordinator(b) => b.encode(dst, api_version)?,
        DecodedResponseBody::DescribeCluster(b) => b.encode(dst, api_version)?,
    }
    Ok(())
}

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

fn encode_request_frame(
    api_version: i16,
    header: RequestHeader,
    body: DecodedRequestBody,
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    let mut payload = BytesMut::new();
    let header_version = request_header_version(request_api_key(&body), api_version);
    header.encode(&mut payload, header_version)?;
    encode_request_body(&body, api_version, &mut payload)?;
    dst.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    dst.extend_from_slice(&payload);
    Ok(())
}

fn encode_response_frame(
    api_version: i16,
    header: ResponseHeader,
    body: DecodedResponseBody,
    dst: &mut BytesMut,
) -> Result<(), CodecError> {
    let mut payload = BytesMut::new();
    let header_version = response_header_version(response_api_key(&body), api_version);
    header.encode(&mut payload, header_version)?;
    encode_response_body(&body, api_version, &mut payload)?;
    dst.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    dst.extend_from_slice(&payload);
    Ok(())
}

fn encode_frame(item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
    match item {
        Frame::Opaque { bytes } => dst.extend_from_slice(&bytes),
        Frame::DecodedRequest {
            api_version,
            header,
            body,
        } => encode_request_frame(api_version, header, body, dst)?,
        Frame::InternalRequest {
            api_version,
            header,
            body,
            ..
        } => encode_request_frame(api_version, header, body, dst)?,
        Frame::DecodedResponse {
            api_version,
            header,
            body,
        } => encode_response_frame(api_version, header, body, dst)?,
        Frame::InternalResponse { header, body, .. } => {
            let api_version = 0;
            encode_response_frame(api_version, header, body, dst)?
        }
    }
    Ok(())
}

/// Decodes client requests, consulting `should_decode` (usually
/// `FilterChain::should_handle_request`) to pick opaque pass-through vs.
/// full decode. Also encodes short-circuited/rewritten responses destined
/// back to the client and outbound requests destined upstream.
pub struct RequestFrameCodec {
    length_codec: LengthDelimitedCodec,
    should_decode: Arc<dyn Fn(i16, i16) -> bool + Send + Sync>,
}

impl RequestFrameCodec {
    pub fn new(should_decode: Arc<dyn Fn(i16, i16) -> bool + Send + Sync>) -> Self {
        RequestFrameCodec {
            length_codec: length_codec(),
            should_decode,
        }
    }

    pub fn always_opaque() -> Self {
        Self::new(Arc::new(|_, _| false))
    }
}

impl Decoder for RequestFrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let Some(mut bytes) = self.length_codec.decode(src)? else {
            return Ok(None);
        };
        if bytes.len() < 12 {
            return Err(CodecError::TruncatedFrame);
        }
        let api_key_raw = bytes.peek_bytes(4..6).get_i16();
        let api_version = bytes.peek_bytes(6..8).get_i16();

        let Ok(api_key) = ApiKey::try_from(api_key_raw) else {
            return Ok(Some(Frame::Opaque {
                bytes: bytes.freeze(),
            }));
        };
        if !SUPPORTED_API_KEYS.contains(&api_key) || !(self.should_decode)(api_key_raw, api_version)
        {
            return Ok(Some(Frame::Opaque {
                bytes: bytes.freeze(),
            }));
        }

        bytes.advance(4); // drop the length prefix now that we're decoding
        let header_version = request_header_version(api_key, api_version);
        let header = RequestHeader::decode(&mut bytes, header_version)?;
        let body = decode_request_body(api_key, api_version, &mut bytes)?;
        Ok(Some(Frame::DecodedRequest {
            api_version,
            header,
            body,
        }))
    }
}

impl Encoder<Frame> for RequestFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_frame(item, dst)
    }
}

/// Decodes upstream responses by consulting the correlation manager's
/// entry for the frame's correlation id; encodes client requests (possibly
/// rewritten by filters) on the way upstream.
pub struct ResponseFrameCodec {
    length_codec: LengthDelimitedCodec,
    manager: Arc<super::CorrelationManager>,
}

impl ResponseFrameCodec {
    pub fn new(manager: Arc<super::CorrelationManager>) -> Self {
        ResponseFrameCodec {
            length_codec: length_codec(),
            manager,
        }
    }
}

impl Decoder for ResponseFrameCodec {
    /// The decoded frame alongside the correlation entry it resolved
    /// against, so the connection pair can remap the correlation id back
    /// to the one the client used without a second table lookup.
    type Item = (Frame, CorrelationEntry);
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, CodecError> {
        let Some(mut bytes) = self.length_codec.decode(src)? else {
            return Ok(None);
        };
        if bytes.len() < 8 {
            return Err(CodecError::TruncatedFrame);
        }
        let correlation_id = bytes.peek_bytes(4..8).get_i32();
        let entry = self.manager.take_response(correlation_id)?;

        if !entry.decode_response {
            return Ok(Some((
                Frame::Opaque {
                    bytes: bytes.freeze(),
                },
                entry,
            )));
        }

        bytes.advance(4); // length prefix
        bytes.advance(4); // correlation id
        let header_version = response_header_version(entry.api_key, entry.api_version);
        let header = ResponseHeader::decode(&mut bytes, header_version)?;
        let body = decode_response_body(entry.api_key, entry.api_version, &mut bytes)?;
        Ok(Some((
            Frame::DecodedResponse {
                api_version: entry.api_version,
                header,
                body,
            },
            entry,
        )))
    }
}

impl Encoder<Frame> for ResponseFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_frame(item, dst)
    }
}

/// Encode-only codec used by the connection pair's writer tasks, where the
/// frame being written may have originated from either direction (a
/// forwarded request, a short-circuit response, or an internal request).
#[derive(Default)]
pub struct FrameEncoder;

impl Encoder<Frame> for FrameEncoder {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_frame(item, dst)
    }
}
