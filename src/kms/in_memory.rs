//! An in-memory `Kms` implementation for tests and local/demo operation.
//! Not a production KMS integration — wiring up a real provider (AWS KMS,
//! Vault, etc.) is left to operators — but the default vendor slot a
//! plugin registry would wire up for `kms.name = "in-memory"`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;

use crate::error::KmsError;

use super::{DekMaterial, Kms};

const DEK_LEN: usize = 32;

/// Wraps a DEK by storing it keyed under a randomly generated EDEK id; this
/// is the simplest possible stand-in for "encrypt the DEK under the KEK"
/// that still exercises the generate/decrypt round trip real callers rely
/// on, without requiring a second cipher just to wrap key material that is
/// already only ever held by this fake vault.
pub struct InMemoryKms {
    aliases: DashMap<String, String>,
    known_keks: DashMap<String, ()>,
    wrapped: DashMap<Vec<u8>, DekMaterial>,
    generated: AtomicU64,
}

impl Default for InMemoryKms {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKms {
    pub fn new() -> Self {
        InMemoryKms {
            aliases: DashMap::new(),
            known_keks: DashMap::new(),
            wrapped: DashMap::new(),
            generated: AtomicU64::new(0),
        }
    }

    pub fn register_kek(&self, kek_id: &str) {
        self.known_keks.insert(kek_id.to_string(), ());
    }

    pub fn register_alias(&self, alias: &str, kek_id: &str) {
        self.register_kek(kek_id);
        self.aliases.insert(alias.to_string(), kek_id.to_string());
    }

    pub fn dek_pairs_generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Kms for InMemoryKms {
    async fn generate_dek_pair(&self, kek_id: &str) -> Result<(Vec<u8>, DekMaterial), KmsError> {
        if !self.known_keks.contains_key(kek_id) {
            return Err(KmsError::UnknownKey(kek_id.to_string()));
        }
        let mut key_bytes = vec![0u8; DEK_LEN];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let mut edek = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut edek);

        let dek = DekMaterial {
            kek_id: kek_id.to_string(),
            key_bytes,
        };
        self.wrapped.insert(edek.clone(), dek.clone());
        self.generated.fetch_add(1, Ordering::Relaxed);
        Ok((edek, dek))
    }

    async fn decrypt_edek(&self, edek: &[u8]) -> Result<DekMaterial, KmsError> {
        self.wrapped
            .get(edek)
            .map(|e| e.clone())
            .ok_or_else(|| KmsError::UnknownKey("edek not recognised by this KMS instance".to_string()))
    }

    async fn resolve_alias(&self, alias: &str) -> Result<String, KmsError> {
        self.aliases
            .get(alias)
            .map(|kek_id| kek_id.clone())
            .ok_or_else(|| KmsError::UnknownAlias(alias.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_then_decrypt_round_trips_the_key() {
        let kms = InMemoryKms::new();
        kms.register_kek("k1");
        let (edek, dek) = kms.generate_dek_pair("k1").await.unwrap();
        let recovered = kms.decrypt_edek(&edek).await.unwrap();
        assert_eq!(recovered.key_bytes, dek.key_bytes);
    }

    #[tokio::test]
    async fn unknown_kek_is_rejected() {
        let kms = InMemoryKms::new();
        assert!(matches!(
            kms.generate_dek_pair("missing").await,
            Err(KmsError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn unresolved_alias_is_reported() {
        let kms = InMemoryKms::new();
        assert!(matches!(
            kms.resolve_alias("nope").await,
            Err(KmsError::UnknownAlias(_))
        ));
    }
}
