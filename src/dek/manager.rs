//! `DekManager`: per-KEK DEK lifecycle. `current_dek_context`/
//! `acquire_for_encryption` guarantee at-most-one concurrent creation per
//! KEK id by performing the whole check-or-create sequence under a
//! per-KEK `tokio::sync::Mutex` — concurrent callers simply queue on that
//! lock rather than racing the KMS.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::EncryptionError;
use crate::kms::Kms;
use crate::metrics;

use super::context::KeyContext;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct DekSlot {
    context: Option<Arc<KeyContext>>,
}

pub struct DekManager {
    kms: Arc<dyn Kms>,
    slots: DashMap<String, Arc<Mutex<DekSlot>>>,
    max_encryptions_per_dek: u64,
    expire_after_write: Duration,
}

impl DekManager {
    pub fn new(kms: Arc<dyn Kms>, max_encryptions_per_dek: u64, expire_after_write: Duration) -> Self {
        DekManager {
            kms,
            slots: DashMap::new(),
            max_encryptions_per_dek,
            expire_after_write,
        }
    }

    pub fn kms(&self) -> &Arc<dyn Kms> {
        &self.kms
    }

    fn slot_for(&self, kek_id: &str) -> Arc<Mutex<DekSlot>> {
        Arc::clone(
            self.slots
                .entry(kek_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(DekSlot::default())))
                .value(),
        )
    }

    async fn create_context(&self, kek_id: &str) -> Result<Arc<KeyContext>, EncryptionError> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.kms.generate_dek_pair(kek_id).await {
                Ok((edek, dek)) => {
                    let ctx = KeyContext::new(edek, dek, self.max_encryptions_per_dek, self.expire_after_write)?;
                    metrics::record_dek_rotation(kek_id);
                    return Ok(Arc::new(ctx));
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(EncryptionError::Kms(e)),
            }
        }
        Err(EncryptionError::DekUnavailable(format!(
            "failed to generate a DEK for kek '{kek_id}' after {MAX_ATTEMPTS} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Returns the live context for `kek_id`, creating one if none exists
    /// or the existing one has expired.
    pub async fn current_dek_context(&self, kek_id: &str) -> Result<Arc<KeyContext>, EncryptionError> {
        let slot = self.slot_for(kek_id);
        let mut guard = slot.lock().await;
        if let Some(ctx) = &guard.context {
            if !ctx.is_expired() {
                return Ok(Arc::clone(ctx));
            }
        }
        let ctx = self.create_context(kek_id).await?;
        guard.context = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Reserves capacity for `n` encryptions against `kek_id`'s current
    /// context, rotating to a fresh DEK when the existing one lacks
    /// capacity. Fails with a message containing "failed to encrypt
    /// records after 3 attempts" if no context can be made to fit `n`
    /// within the retry budget (e.g. a batch larger than
    /// `maxEncryptionsPerDek`).
    pub async fn acquire_for_encryption(&self, kek_id: &str, n: u64) -> Result<Arc<KeyContext>, EncryptionError> {
        let slot = self.slot_for(kek_id);
        for _ in 0..MAX_ATTEMPTS {
            let mut guard = slot.lock().await;
            let needs_rotation = match &guard.context {
                None => true,
                Some(ctx) => ctx.is_expired() || ctx.remaining_encryptions() < n,
            };
            if !needs_rotation {
                let ctx = Arc::clone(guard.context.as_ref().unwrap());
                ctx.reserve(n);
                return Ok(ctx);
            }
            guard.context = None;
            drop(guard);

            let ctx = self.create_context(kek_id).await?;
            if ctx.remaining_encryptions() < n {
                // A fresh DEK still can't fit this batch (maxEncryptionsPerDek
                // < n); leave the slot empty and let the next loop iteration
                // retry, counting against the same attempt budget.
                continue;
            }
            ctx.reserve(n);
            let mut guard = slot.lock().await;
            guard.context = Some(Arc::clone(&ctx));
            return Ok(ctx);
        }
        Err(EncryptionError::DekUnavailable(
            "failed to encrypt records after 3 attempts".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::InMemoryKms;

    fn manager(max_per_dek: u64) -> DekManager {
        let kms = Arc::new(InMemoryKms::new());
        kms.register_kek("k1");
        DekManager::new(kms, max_per_dek, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn reuses_context_while_capacity_remains() {
        let mgr = manager(10);
        let first = mgr.acquire_for_encryption("k1", 1).await.unwrap();
        let second = mgr.acquire_for_encryption("k1", 1).await.unwrap();
        assert_eq!(first.serialized_edek, second.serialized_edek);
    }

    #[tokio::test]
    async fn rotates_when_capacity_is_exhausted() {
        let mgr = manager(2);
        let first = mgr.acquire_for_encryption("k1", 2).await.unwrap();
        let second = mgr.acquire_for_encryption("k1", 2).await.unwrap();
        assert_ne!(first.serialized_edek, second.serialized_edek);
    }

    #[tokio::test]
    async fn batch_larger_than_budget_fails_after_retries() {
        let mgr = manager(1);
        let err = mgr.acquire_for_encryption("k1", 5).await.unwrap_err();
        assert!(err.to_string().contains("failed to encrypt records after 3 attempts"));
    }
}
