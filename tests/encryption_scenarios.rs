//! Round-trip and rotation scenarios for the envelope-encryption stack,
//! exercised at the DEK-manager/parcel/wrapper layer (the filter's own
//! record-batch plumbing is covered by `src/encryption/filter.rs`'s own
//! tests).

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use kroxide::dek::{DekManager, Decryptor};
use kroxide::encryption::{Parcel, RecordWrapper};
use kroxide::kms::InMemoryKms;

fn manager(max_per_dek: u64) -> (Arc<InMemoryKms>, DekManager) {
    let kms = Arc::new(InMemoryKms::new());
    kms.register_kek("k");
    let mgr = DekManager::new(kms.clone(), max_per_dek, Duration::from_secs(3600));
    (kms, mgr)
}

async fn encrypt_and_wrap(mgr: &DekManager, plaintext_parcel: &Parcel) -> RecordWrapper {
    let ctx = mgr.acquire_for_encryption("k", 1).await.unwrap();
    let (iv, ciphertext) = ctx.encrypt(&plaintext_parcel.encode()).unwrap();
    RecordWrapper::new(ctx.serialized_edek.clone(), iv, ciphertext)
}

async fn decrypt_wrapper(kms: &InMemoryKms, wrapper: &RecordWrapper) -> Parcel {
    let dek = kms.decrypt_edek(&wrapper.serialized_edek).await.unwrap();
    let decryptor = Decryptor::new(&dek).unwrap();
    let plaintext = decryptor.decrypt(&wrapper.iv, &wrapper.ciphertext).unwrap();
    Parcel::decode(&plaintext).unwrap()
}

#[tokio::test]
async fn round_trip_single_record() {
    let (kms, mgr) = manager(500_000);
    let parcel = Parcel {
        value: Some(vec![1, 2, 3]),
        headers: None,
    };
    let wrapper = encrypt_and_wrap(&mgr, &parcel).await;
    let decoded = decrypt_wrapper(&kms, &wrapper).await;
    assert_eq!(decoded.value, Some(vec![1, 2, 3]));
    assert!(decoded.headers.is_none());
}

#[tokio::test]
async fn header_encryption_round_trip() {
    let (kms, mgr) = manager(500_000);
    let mut headers = IndexMap::new();
    headers.insert(b"foo".to_vec(), vec![4, 5, 6]);
    let parcel = Parcel {
        value: Some(vec![1, 2, 3]),
        headers: Some(headers.clone()),
    };
    let wrapper = encrypt_and_wrap(&mgr, &parcel).await;
    let decoded = decrypt_wrapper(&kms, &wrapper).await;
    assert_eq!(decoded.value, Some(vec![1, 2, 3]));
    assert_eq!(decoded.headers, Some(headers));
}

#[rstest::rstest]
#[case::single_record_batches(2, vec![1, 1, 1, 1])]
#[case::mixed_size_batches(3, vec![1, 2, 1, 2])]
#[tokio::test]
async fn dek_rotates_once_capacity_is_exhausted(#[case] max_per_dek: u64, #[case] batch_sizes: Vec<u64>) {
    let (kms, mgr) = manager(max_per_dek);
    let mut edeks = Vec::new();
    for n in batch_sizes {
        let ctx = mgr.acquire_for_encryption("k", n).await.unwrap();
        edeks.push(ctx.serialized_edek.clone());
    }
    assert_eq!(kms.dek_pairs_generated(), 2);
    assert_eq!(edeks[0], edeks[1]);
    assert_ne!(edeks[1], edeks[2]);
    assert_eq!(edeks[2], edeks[3]);
}

#[tokio::test]
async fn batch_exceeding_capacity_reports_the_documented_error() {
    let (_kms, mgr) = manager(1);
    let err = mgr.acquire_for_encryption("k", 10).await.unwrap_err();
    assert!(err.to_string().contains("failed to encrypt records after 3 attempts"));
}
