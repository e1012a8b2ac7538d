//! `KeyContext`: a live DEK paired with its wrapped form and a use-count
//! budget. Holds the AES-GCM cipher keyed by the DEK's plaintext bytes;
//! the plaintext itself, and the cipher's expanded round-key schedule, are
//! both zeroised when the context is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::error::EncryptionError;
use crate::kms::DekMaterial;

/// `aad_code` / `cipher_code` tags stamped into the record wrapper. Only
/// one of each is defined today; the fields exist so a future mode can be
/// added without changing the wire layout.
pub const AAD_CODE_NONE: u8 = 0;
pub const CIPHER_CODE_AES_GCM_96_128: u8 = 1;

const NONCE_LEN: usize = 12;

pub struct KeyContext {
    pub serialized_edek: Vec<u8>,
    cipher: Aes256Gcm,
    // kept alive only so its Drop impl zeroises the plaintext key bytes;
    // `aes-gcm`'s `zeroize` feature makes the cipher's own Drop wipe the
    // expanded round-key schedule it holds independently.
    _dek: DekMaterial,
    expiry: Instant,
    remaining: AtomicU64,
}

impl KeyContext {
    pub fn new(serialized_edek: Vec<u8>, dek: DekMaterial, max_encryptions: u64, ttl: Duration) -> Result<Self, EncryptionError> {
        let cipher = Aes256Gcm::new_from_slice(&dek.key_bytes)
            .map_err(|e| EncryptionError::DekUnavailable(format!("invalid DEK length: {e}")))?;
        Ok(KeyContext {
            serialized_edek,
            cipher,
            _dek: dek,
            expiry: Instant::now() + ttl,
            remaining: AtomicU64::new(max_encryptions),
        })
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry || self.remaining.load(Ordering::Relaxed) == 0
    }

    pub fn remaining_encryptions(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    /// Reserves `n` encryptions against this context's budget. Callers must
    /// have already checked `remaining_encryptions() >= n`.
    pub fn reserve(&self, n: u64) {
        self.remaining.fetch_sub(n, Ordering::Relaxed);
    }

    /// Encrypts `plaintext` under a freshly generated random nonce (the
    /// AES-GCM invariant is that every (key, nonce) pair is unique; a CSPRNG
    /// nonce makes collision probability negligible for this key's lifetime).
    /// Returns `(iv, ciphertext_and_tag)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), EncryptionError> {
        let mut iv = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| EncryptionError::DekUnavailable(format!("encrypt failed: {e}")))?;
        Ok((iv.to_vec(), ciphertext))
    }
}

/// An EDEK-keyed decryptor built once per EDEK and cached.
pub struct Decryptor {
    cipher: Aes256Gcm,
}

impl Decryptor {
    pub fn new(dek: &DekMaterial) -> Result<Self, EncryptionError> {
        let cipher = Aes256Gcm::new_from_slice(&dek.key_bytes)
            .map_err(|e| EncryptionError::DekUnavailable(format!("invalid DEK length: {e}")))?;
        Ok(Decryptor { cipher })
    }

    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if iv.len() != NONCE_LEN {
            return Err(EncryptionError::MalformedWrapper("iv has wrong length".to_string()));
        }
        let nonce = Nonce::from_slice(iv);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| EncryptionError::MalformedWrapper(format!("decrypt failed: {e}")))
    }
}
