//! `kroxide` — a transparent, wire-compatible Kafka proxy.
//!
//! The proxy terminates client connections, decodes only the frames an
//! installed filter cares about, lets filters forward/drop/short-circuit
//! those frames, and shuttles everything else upstream as opaque bytes. A
//! separate envelope-encryption filter wraps selected record fields with a
//! KMS-managed data encryption key before they ever leave the proxy.

pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dek;
pub mod encryption;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod frame;
pub mod kms;
pub mod metrics;

/// Encryption-header name prepended to every record this proxy encrypts.
pub const ENCRYPTION_HEADER_NAME: &str = "kroxylicious.io/encryption";

/// Current on-wire encryption version. The only value in use today.
pub const ENCRYPTION_VERSION: u8 = 1;
