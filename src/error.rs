//! Component-local error types.
//!
//! Each subsystem defines a small `enum` describing the ways it can fail,
//! in the style of `conduktor-bore-kafka`'s `kafka::ErrorKind`: hand-rolled
//! `Display`/`Error` impls, composed upward into `anyhow::Result` once an
//! error crosses a task/connection boundary.

use std::fmt::{Display, Formatter};

/// Errors raised while decoding or encoding a frame on the wire.
#[derive(Debug)]
pub enum CodecError {
    /// The 4-byte length prefix could not be read, or claimed a size larger
    /// than the configured maximum frame size.
    MalformedLength,
    /// The frame was truncated before `length` bytes arrived.
    TruncatedFrame,
    /// The connection requires this apiKey/version decoded but no schema
    /// is known for it.
    UnknownApiKey { api_key: i16, api_version: i16 },
    Decode(anyhow::Error),
    Encode(anyhow::Error),
    Io(std::io::Error),
    Correlation(CorrelationError),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::MalformedLength => write!(f, "malformed frame length prefix"),
            CodecError::TruncatedFrame => write!(f, "frame truncated before length was reached"),
            CodecError::UnknownApiKey {
                api_key,
                api_version,
            } => write!(
                f,
                "no schema for apiKey={api_key} apiVersion={api_version} but a filter requires it decoded"
            ),
            CodecError::Decode(e) => write!(f, "error decoding frame: {e}"),
            CodecError::Encode(e) => write!(f, "error encoding frame: {e}"),
            CodecError::Io(e) => write!(f, "io error: {e}"),
            CodecError::Correlation(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::Io(err)
    }
}

impl From<CorrelationError> for CodecError {
    fn from(err: CorrelationError) -> Self {
        CodecError::Correlation(err)
    }
}

/// Errors raised by the correlation manager.
#[derive(Debug)]
pub enum CorrelationError {
    /// A response arrived for an upstream correlation id with no matching
    /// entry. Fatal: the connection is closed.
    UnknownCorrelationId(i32),
}

impl Display for CorrelationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationError::UnknownCorrelationId(id) => {
                write!(f, "response for unknown upstream correlation id {id}")
            }
        }
    }
}

impl std::error::Error for CorrelationError {}

/// Errors raised while dispatching a frame through the filter chain.
#[derive(Debug)]
pub enum FilterError {
    /// A filter's future did not resolve within its configured timeout.
    Timeout { filter: String },
    /// A filter's future failed, or the filter returned no result at all.
    Failed { filter: String, reason: String },
    /// A filter tried to short-circuit a request that expects no response
    /// (e.g. PRODUCE with acks=0). The short-circuit is dropped, not fatal.
    ShortCircuitForbidden { filter: String },
}

impl Display for FilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::Timeout { filter } => write!(f, "filter '{filter}' timed out"),
            FilterError::Failed { filter, reason } => {
                write!(f, "filter '{filter}' failed: {reason}")
            }
            FilterError::ShortCircuitForbidden { filter } => write!(
                f,
                "filter '{filter}' attempted to short-circuit a request with no response"
            ),
        }
    }
}

impl std::error::Error for FilterError {}

/// Errors raised by the KMS abstraction.
#[derive(Debug, Clone)]
pub enum KmsError {
    /// The alias is not configured in the external KMS.
    UnknownAlias(String),
    /// The KEK id is no longer valid.
    UnknownKey(String),
    /// Network error or throttling; callers should retry up to the
    /// configured retry budget.
    Transient(String),
    /// The KMS facade itself rejected the call (bad URL, bad credentials).
    /// Not retryable.
    Configuration(String),
}

impl Display for KmsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KmsError::UnknownAlias(a) => write!(f, "unknown KMS alias '{a}'"),
            KmsError::UnknownKey(k) => write!(f, "unknown KEK id '{k}'"),
            KmsError::Transient(msg) => write!(f, "transient KMS error: {msg}"),
            KmsError::Configuration(msg) => write!(f, "KMS configuration error: {msg}"),
        }
    }
}

impl std::error::Error for KmsError {}

impl KmsError {
    /// Whether the error should count against the per-operation retry
    /// budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KmsError::Transient(_))
    }
}

/// Errors raised while encrypting or decrypting records.
#[derive(Debug)]
pub enum EncryptionError {
    /// `recordFields` includes RECORD_HEADER_VALUES but the record's value
    /// is null; encrypting headers would destroy the tombstone semantics.
    HeaderEncryptionWithNullValue,
    /// The on-wire wrapper or parcel could not be parsed.
    MalformedWrapper(String),
    /// The DEK manager could not produce a usable DEK context.
    DekUnavailable(String),
    Kms(KmsError),
}

impl Display for EncryptionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionError::HeaderEncryptionWithNullValue => write!(
                f,
                "encrypting headers prohibited when original record value null, we must preserve the null for tombstoning"
            ),
            EncryptionError::MalformedWrapper(msg) => write!(f, "malformed record wrapper: {msg}"),
            EncryptionError::DekUnavailable(msg) => write!(f, "DEK unavailable: {msg}"),
            EncryptionError::Kms(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EncryptionError {}

impl From<KmsError> for EncryptionError {
    fn from(err: KmsError) -> Self {
        EncryptionError::Kms(err)
    }
}
