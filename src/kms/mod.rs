//! The KMS abstraction: generate DEK pairs, decrypt EDEKs, resolve
//! aliases to KEK ids, plus the caches that sit in front of a real (slow,
//! rate-limited) key management service.
//!
//! `async-trait` is grounded in `estuary-flow`'s dependency set; the teacher
//! has no async-trait-object need since its proxy loop is monomorphic.

pub mod cache;
pub mod in_memory;

pub use in_memory::InMemoryKms;

use async_trait::async_trait;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KmsError;

/// Plaintext DEK material paired with the id of the KEK that wraps it.
/// Zeroised on drop so no plaintext key survives past the context that
/// owns it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DekMaterial {
    #[zeroize(skip)]
    pub kek_id: String,
    pub key_bytes: Vec<u8>,
}

/// Hook for providers that frame EDEKs with their own envelope instead of
/// handing back the raw wrapped key bytes. The default byte-identity
/// implementation is all `InMemoryKms` needs; a real KMS
/// integration might frame EDEKs with a provider-specific envelope here.
pub trait EdekSerde: Send + Sync {
    fn size_of(&self, edek: &[u8]) -> usize {
        edek.len()
    }

    fn serialize(&self, edek: &[u8], dst: &mut Vec<u8>) {
        dst.extend_from_slice(edek);
    }

    fn deserialize(&self, src: &[u8]) -> Vec<u8> {
        src.to_vec()
    }
}

#[async_trait]
pub trait Kms: Send + Sync {
    /// Generates a fresh DEK and returns it alongside its wrapped form
    /// (the EDEK) produced by encrypting it under `kek_id`.
    async fn generate_dek_pair(&self, kek_id: &str) -> Result<(Vec<u8>, DekMaterial), KmsError>;

    /// Unwraps a previously generated EDEK back into usable DEK material.
    async fn decrypt_edek(&self, edek: &[u8]) -> Result<DekMaterial, KmsError>;

    /// Resolves a configured alias to the KEK id it currently points at.
    async fn resolve_alias(&self, alias: &str) -> Result<String, KmsError>;
}
