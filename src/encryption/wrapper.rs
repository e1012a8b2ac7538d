//! `RecordWrapper`: the on-wire structure prepended to an encrypted
//! record's value — the EDEK, cipher metadata, and IV/ciphertext.
//!
//! ```text
//! uvarint  edek_length
//! bytes    serialized_edek
//! u8       aad_code     // 0 = NONE
//! u8       cipher_code  // 1 = AES_GCM_96_128
//! bytes    iv || ciphertext_and_tag
//! ```

use crate::dek::context::{AAD_CODE_NONE, CIPHER_CODE_AES_GCM_96_128};
use crate::error::EncryptionError;

const IV_LEN: usize = 12;

pub struct RecordWrapper {
    pub serialized_edek: Vec<u8>,
    pub aad_code: u8,
    pub cipher_code: u8,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl RecordWrapper {
    pub fn new(serialized_edek: Vec<u8>, iv: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        RecordWrapper {
            serialized_edek,
            aad_code: AAD_CODE_NONE,
            cipher_code: CIPHER_CODE_AES_GCM_96_128,
            iv,
            ciphertext,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_edek.len() + self.iv.len() + self.ciphertext.len() + 8);
        put_uvarint(&mut out, self.serialized_edek.len() as u64);
        out.extend_from_slice(&self.serialized_edek);
        out.push(self.aad_code);
        out.push(self.cipher_code);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self, EncryptionError> {
        let mut pos = 0usize;
        let edek_len = get_uvarint(src, &mut pos)? as usize;
        let serialized_edek = src
            .get(pos..pos + edek_len)
            .ok_or_else(|| EncryptionError::MalformedWrapper("truncated edek".to_string()))?
            .to_vec();
        pos += edek_len;

        let aad_code = *src
            .get(pos)
            .ok_or_else(|| EncryptionError::MalformedWrapper("truncated aad_code".to_string()))?;
        pos += 1;
        let cipher_code = *src
            .get(pos)
            .ok_or_else(|| EncryptionError::MalformedWrapper("truncated cipher_code".to_string()))?;
        pos += 1;
        if cipher_code != CIPHER_CODE_AES_GCM_96_128 {
            return Err(EncryptionError::MalformedWrapper(format!(
                "unsupported cipher_code {cipher_code}"
            )));
        }

        let rest = src
            .get(pos..)
            .ok_or_else(|| EncryptionError::MalformedWrapper("truncated iv/ciphertext".to_string()))?;
        if rest.len() < IV_LEN {
            return Err(EncryptionError::MalformedWrapper("truncated iv".to_string()));
        }
        let (iv, ciphertext) = rest.split_at(IV_LEN);

        Ok(RecordWrapper {
            serialized_edek,
            aad_code,
            cipher_code,
            iv: iv.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

fn put_uvarint(dst: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            dst.push(byte);
            break;
        }
        dst.push(byte | 0x80);
    }
}

fn get_uvarint(src: &[u8], pos: &mut usize) -> Result<u64, EncryptionError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *src
            .get(*pos)
            .ok_or_else(|| EncryptionError::MalformedWrapper("truncated varint".to_string()))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(EncryptionError::MalformedWrapper("varint too long".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let wrapper = RecordWrapper::new(vec![1, 2, 3, 4], vec![0u8; IV_LEN], vec![9, 9, 9]);
        let decoded = RecordWrapper::decode(&wrapper.encode()).unwrap();
        assert_eq!(decoded.serialized_edek, vec![1, 2, 3, 4]);
        assert_eq!(decoded.iv, vec![0u8; IV_LEN]);
        assert_eq!(decoded.ciphertext, vec![9, 9, 9]);
    }

    #[test]
    fn rejects_unsupported_cipher_code() {
        let mut bytes = RecordWrapper::new(vec![1], vec![0u8; IV_LEN], vec![2]).encode();
        let cipher_code_pos = 2; // uvarint(1) + 1-byte edek
        bytes[cipher_code_pos] = 99;
        assert!(RecordWrapper::decode(&bytes).is_err());
    }
}
