//! `RecordEncryptionFilter`: the produce-path encrypt / fetch-path
//! decrypt `KafkaFilter`. Grounded in `estuary-flow`'s `dekaf` crate for
//! the `kafka_protocol::records` record-batch encode/decode calls, and in
//! the teacher's filter style (`broker_address.rs`) for how a `KafkaFilter`
//! rewrites a decoded body in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions};

use crate::buffer_pool::BufferPool;
use crate::dek::{DekManager, Decryptor, KeyContext};
use crate::error::EncryptionError;
use crate::frame::{DecodedRequestBody, DecodedResponseBody};
use crate::kms::cache::TtlCache;
use crate::metrics;

use super::parcel::Parcel;
use super::scheme::{EncryptionScheme, RecordField};
use super::selector::KekSelector;
use super::wrapper::RecordWrapper;

use crate::filter::{CloseConnection, FilterContext, FilterOutcome, KafkaFilter, RequestFilterResult, ResponseFilterResult};
use crate::{ENCRYPTION_HEADER_NAME, ENCRYPTION_VERSION};

const RECORD_ENCODE_VERSION: i8 = 2;

pub struct RecordEncryptionFilter {
    dek_manager: Arc<DekManager>,
    kek_selector: Arc<dyn KekSelector>,
    record_fields: Vec<RecordField>,
    decryptor_cache: TtlCache<Vec<u8>, Arc<Decryptor>>,
    buffer_pool: Arc<BufferPool>,
}

impl RecordEncryptionFilter {
    pub fn new(
        dek_manager: Arc<DekManager>,
        kek_selector: Arc<dyn KekSelector>,
        record_fields: Vec<RecordField>,
        decrypted_dek_cache_size: u64,
        decrypted_dek_expire_after_access: Duration,
    ) -> Self {
        RecordEncryptionFilter {
            dek_manager,
            kek_selector,
            record_fields,
            decryptor_cache: TtlCache::new(decrypted_dek_cache_size as usize, decrypted_dek_expire_after_access, true),
            buffer_pool: Arc::new(BufferPool::new(4096)),
        }
    }

    fn scheme_for(&self, kek_id: String) -> EncryptionScheme {
        EncryptionScheme::new(kek_id, self.record_fields.iter().copied().collect())
    }

    fn header_key() -> StrBytes {
        StrBytes::from_static_str(ENCRYPTION_HEADER_NAME)
    }

    fn has_encryption_header(record: &Record) -> bool {
        record.headers.contains_key(&Self::header_key())
    }

    fn strip_encryption_header(headers: &IndexMap<StrBytes, Option<Bytes>>) -> IndexMap<StrBytes, Option<Bytes>> {
        headers
            .iter()
            .filter(|(k, _)| *k != &Self::header_key())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn prepend_encryption_header(headers: &IndexMap<StrBytes, Option<Bytes>>) -> IndexMap<StrBytes, Option<Bytes>> {
        let mut out = IndexMap::with_capacity(headers.len() + 1);
        out.insert(Self::header_key(), Some(Bytes::from(vec![ENCRYPTION_VERSION])));
        for (k, v) in headers {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    async fn encrypt_record(&self, record: &mut Record, ctx: &KeyContext, scheme: &EncryptionScheme) -> Result<(), EncryptionError> {
        let Some(value) = record.value.clone() else {
            return Ok(());
        };

        let parcel = Parcel {
            value: Some(value.to_vec()),
            headers: if scheme.encrypts_headers() {
                Some(
                    record
                        .headers
                        .iter()
                        .filter(|(k, _)| *k != &Self::header_key())
                        .map(|(k, v)| (k.as_bytes().to_vec(), v.clone().map(|b| b.to_vec()).unwrap_or_default()))
                        .collect(),
                )
            } else {
                None
            },
        };
        let plaintext = {
            let mut guard = self.buffer_pool.acquire();
            guard.extend_from_slice(&parcel.encode());
            guard.to_vec()
        };

        let (iv, ciphertext) = ctx.encrypt(&plaintext)?;
        let wrapper = RecordWrapper::new(ctx.serialized_edek.clone(), iv, ciphertext);
        record.value = Some(Bytes::from(wrapper.encode()));

        if scheme.encrypts_headers() {
            record.headers = record
                .headers
                .iter()
                .filter(|(k, _)| *k != &Self::header_key())
                .map(|(k, _)| (k.clone(), None))
                .collect();
        }
        record.headers = Self::prepend_encryption_header(&record.headers);
        Ok(())
    }

    async fn decrypt_record(&self, record: &mut Record) -> Result<(), EncryptionError> {
        if !Self::has_encryption_header(record) {
            return Ok(());
        }
        let version = record
            .headers
            .get(&Self::header_key())
            .and_then(|v| v.as_ref())
            .and_then(|b| b.first().copied());
        if version != Some(ENCRYPTION_VERSION) {
            return Err(EncryptionError::MalformedWrapper(format!(
                "unsupported encryption header version {version:?}"
            )));
        }

        let Some(wrapped) = record.value.clone() else {
            return Ok(());
        };
        let wrapper = RecordWrapper::decode(&wrapped)?;

        let decryptor = match self.decryptor_cache.get(&wrapper.serialized_edek) {
            Some(cached) => {
                metrics::record_decrypt_cache(true);
                cached
            }
            None => {
                metrics::record_decrypt_cache(false);
                let dek = self.dek_manager.kms().decrypt_edek(&wrapper.serialized_edek).await?;
                let decryptor = Arc::new(Decryptor::new(&dek)?);
                self.decryptor_cache.insert(wrapper.serialized_edek.clone(), Arc::clone(&decryptor));
                decryptor
            }
        };

        let plaintext = decryptor.decrypt(&wrapper.iv, &wrapper.ciphertext)?;
        let parcel = Parcel::decode(&plaintext)?;

        record.value = parcel.value.map(Bytes::from);
        let mut headers = Self::strip_encryption_header(&record.headers);
        if let Some(parcel_headers) = parcel.headers {
            headers = parcel_headers
                .into_iter()
                .map(|(k, v)| {
                    (
                        StrBytes::from_utf8(Bytes::from(k)).unwrap_or_else(|_| StrBytes::from_static_str("")),
                        Some(Bytes::from(v)),
                    )
                })
                .collect();
        }
        record.headers = headers;
        Ok(())
    }

    fn decode_batch(bytes: &Bytes) -> Result<Vec<Record>, EncryptionError> {
        let mut buf = bytes.clone();
        RecordBatchDecoder::decode(&mut buf).map_err(|e| EncryptionError::MalformedWrapper(format!("record batch decode failed: {e}")))
    }

    fn encode_batch(records: &[Record]) -> Result<Bytes, EncryptionError> {
        let mut buf = BytesMut::new();
        let opts = RecordEncodeOptions {
            version: RECORD_ENCODE_VERSION,
            compression: Compression::None,
        };
        RecordBatchEncoder::encode(&mut buf, records.iter(), &opts, Some(passthrough_compressor))
            .map_err(|e| EncryptionError::MalformedWrapper(format!("record batch encode failed: {e}")))?;
        Ok(buf.freeze())
    }
}

/// This filter never writes compressed batches back out (it only ever
/// rewrites a batch's own records), so the only codepath this hits is
/// `Compression::None`.
fn passthrough_compressor<Output: bytes::BufMut>(input: &mut BytesMut, output: &mut Output, compression: Compression) -> anyhow::Result<()> {
    match compression {
        Compression::None => {
            output.put(input.split());
            Ok(())
        }
        other => anyhow::bail!("unsupported compression {other:?} in record-encryption filter"),
    }
}

#[async_trait]
impl KafkaFilter for RecordEncryptionFilter {
    fn name(&self) -> &str {
        "record-encryption"
    }

    fn should_handle_request(&self, api_key: i16, _api_version: i16) -> bool {
        api_key == ApiKey::ProduceKey as i16
    }

    fn should_handle_response(&self, api_key: i16, _api_version: i16) -> bool {
        api_key == ApiKey::FetchKey as i16
    }

    async fn on_request(&self, header: RequestHeader, body: DecodedRequestBody, _ctx: &FilterContext) -> FilterOutcome<RequestFilterResult> {
        let DecodedRequestBody::Produce(mut produce) = body else {
            return FilterOutcome::forward_only(RequestFilterResult::Forward {
                header: Some(header),
                body: Some(body),
            });
        };

        let mut batches_by_kek: HashMap<String, Vec<(usize, usize, Vec<Record>)>> = HashMap::new();
        let mut unmapped: Vec<(usize, usize)> = Vec::new();

        for (topic_idx, topic_data) in produce.topic_data.iter().enumerate() {
            let topic_name = topic_data.name.0.as_str();
            let kek_id = self.kek_selector.kek_for_topic(topic_name);
            for (partition_idx, partition_data) in topic_data.partition_data.iter().enumerate() {
                let Some(kek_id) = kek_id.clone() else {
                    unmapped.push((topic_idx, partition_idx));
                    continue;
                };
                let Some(records_bytes) = &partition_data.records else {
                    continue;
                };
                match Self::decode_batch(records_bytes) {
                    Ok(records) => {
                        batches_by_kek.entry(kek_id).or_default().push((topic_idx, partition_idx, records));
                    }
                    Err(_) => {
                        return FilterOutcome {
                            result: RequestFilterResult::Drop,
                            close: CloseConnection(true),
                        };
                    }
                }
            }
        }

        for (kek_id, groups) in batches_by_kek {
            let total: u64 = groups.iter().map(|(_, _, records)| records.len() as u64).sum();
            let ctx = match self.dek_manager.acquire_for_encryption(&kek_id, total).await {
                Ok(ctx) => ctx,
                Err(_) => {
                    return FilterOutcome {
                        result: RequestFilterResult::Drop,
                        close: CloseConnection(true),
                    };
                }
            };
            let scheme = self.scheme_for(kek_id);

            for (topic_idx, partition_idx, mut records) in groups {
                for record in &mut records {
                    if scheme.encrypts_headers() && record.value.is_none() && !record.headers.is_empty() {
                        return FilterOutcome {
                            result: RequestFilterResult::Drop,
                            close: CloseConnection(true),
                        };
                    }
                    if record.value.is_none() {
                        continue;
                    }
                    if self.encrypt_record(record, &ctx, &scheme).await.is_err() {
                        return FilterOutcome {
                            result: RequestFilterResult::Drop,
                            close: CloseConnection(true),
                        };
                    }
                }
                match Self::encode_batch(&records) {
                    Ok(encoded) => {
                        produce.topic_data[topic_idx].partition_data[partition_idx].records = Some(encoded);
                    }
                    Err(_) => {
                        return FilterOutcome {
                            result: RequestFilterResult::Drop,
                            close: CloseConnection(true),
                        };
                    }
                }
            }
        }

        FilterOutcome::forward_only(RequestFilterResult::Forward {
            header: Some(header),
            body: Some(DecodedRequestBody::Produce(produce)),
        })
    }

    async fn on_response(&self, header: ResponseHeader, body: DecodedResponseBody, _ctx: &FilterContext) -> FilterOutcome<ResponseFilterResult> {
        let DecodedResponseBody::Fetch(mut fetch) = body else {
            return FilterOutcome::forward_only(ResponseFilterResult::Forward {
                header: Some(header),
                body: Some(body),
            });
        };

        for topic_response in &mut fetch.responses {
            for partition in &mut topic_response.partitions {
                let Some(records_bytes) = &partition.records else {
                    continue;
                };
                let mut records = match Self::decode_batch(records_bytes) {
                    Ok(records) => records,
                    Err(_) => continue,
                };
                let mut any_decrypted = false;
                for record in &mut records {
                    if Self::has_encryption_header(record) {
                        if self.decrypt_record(record).await.is_err() {
                            return FilterOutcome {
                                result: ResponseFilterResult::Drop,
                                close: CloseConnection(true),
                            };
                        }
                        any_decrypted = true;
                    }
                }
                if any_decrypted {
                    if let Ok(encoded) = Self::encode_batch(&records) {
                        partition.records = Some(encoded);
                    }
                }
            }
        }

        FilterOutcome::forward_only(ResponseFilterResult::Forward {
            header: Some(header),
            body: Some(DecodedResponseBody::Fetch(fetch)),
        })
    }
}
