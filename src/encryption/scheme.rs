//! `EncryptionScheme`: which KEK protects a topic's records and which
//! record fields the filter encrypts.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    RecordValue,
    RecordHeaderValues,
}

#[derive(Debug, Clone)]
pub struct EncryptionScheme {
    pub kek_id: String,
    pub record_fields: HashSet<RecordField>,
}

impl EncryptionScheme {
    pub fn new(kek_id: String, record_fields: HashSet<RecordField>) -> Self {
        assert!(!record_fields.is_empty(), "recordFields must be non-empty");
        EncryptionScheme { kek_id, record_fields }
    }

    pub fn encrypts_value(&self) -> bool {
        self.record_fields.contains(&RecordField::RecordValue)
    }

    pub fn encrypts_headers(&self) -> bool {
        self.record_fields.contains(&RecordField::RecordHeaderValues)
    }
}
