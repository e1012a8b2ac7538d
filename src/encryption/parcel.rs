//! `Parcel`: the plaintext of whatever record fields the scheme selected,
//! serialised in a format versioned by `parcel_version` (pinned to version
//! 1 in this crate; the wire layout itself is this crate's own choice).
//!
//! Layout:
//! ```text
//! u8               parcel_version
//! u8               field_bitmask     // bit0 = RECORD_VALUE, bit1 = RECORD_HEADER_VALUES
//! uvarint          value_length      \
//! bytes            value             / present iff bit0 set
//! uvarint          header_count        \
//! repeated {                           |  present iff bit1 set
//!   uvarint key_length; bytes key;     |
//!   uvarint value_length; bytes value  |
//! }                                   /
//! ```

use indexmap::IndexMap;

use crate::error::EncryptionError;

pub const PARCEL_VERSION: u8 = 1;

const BIT_RECORD_VALUE: u8 = 0b01;
const BIT_HEADER_VALUES: u8 = 0b10;

#[derive(Debug, Clone, Default)]
pub struct Parcel {
    pub value: Option<Vec<u8>>,
    pub headers: Option<IndexMap<Vec<u8>, Vec<u8>>>,
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

fn take_bytes<'a>(src: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], EncryptionError> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| EncryptionError::MalformedWrapper("length overflow".to_string()))?;
    let slice = src
        .get(*pos..end)
        .ok_or_else(|| EncryptionError::MalformedWrapper("truncated parcel".to_string()))?;
    *pos = end;
    Ok(slice)
}

impl Parcel {
    pub fn encode(&self) -> Vec<u8> {
        let mut bitmask = 0u8;
        if self.value.is_some() {
            bitmask |= BIT_RECORD_VALUE;
        }
        if self.headers.is_some() {
            bitmask |= BIT_HEADER_VALUES;
        }

        let mut out = Vec::new();
        out.push(PARCEL_VERSION);
        out.push(bitmask);
        if let Some(value) = &self.value {
            put_uvarint(&mut out, value.len() as u64);
            out.extend_from_slice(value);
        }
        if let Some(headers) = &self.headers {
            put_uvarint(&mut out, headers.len() as u64);
            for (key, value) in headers {
                put_uvarint(&mut out, key.len() as u64);
                out.extend_from_slice(key);
                put_uvarint(&mut out, value.len() as u64);
                out.extend_from_slice(value);
            }
        }
        out
    }

    pub fn decode(src: &[u8]) -> Result<Self, EncryptionError> {
        let mut pos = 0usize;
        let version = *src
            .first()
            .ok_or_else(|| EncryptionError::MalformedWrapper("empty parcel".to_string()))?;
        if version != PARCEL_VERSION {
            return Err(EncryptionError::MalformedWrapper(format!(
                "unsupported parcel_version {version}"
            )));
        }
        pos += 1;
        let bitmask = *src
            .get(pos)
            .ok_or_else(|| EncryptionError::MalformedWrapper("truncated parcel header".to_string()))?;
        pos += 1;

        let value = if bitmask & BIT_RECORD_VALUE != 0 {
            let len = get_uvarint(src, &mut pos)? as usize;
            Some(take_bytes(src, &mut pos, len)?.to_vec())
        } else {
            None
        };

        let headers = if bitmask & BIT_HEADER_VALUES != 0 {
            let count = get_uvarint(src, &mut pos)? as usize;
            let mut map = IndexMap::with_capacity(count);
            for _ in 0..count {
                let key_len = get_uvarint(src, &mut pos)? as usize;
                let key = take_bytes(src, &mut pos, key_len)?.to_vec();
                let value_len = get_uvarint(src, &mut pos)? as usize;
                let value = take_bytes(src, &mut pos, value_len)?.to_vec();
                map.insert(key, value);
            }
            Some(map)
        } else {
            None
        };

        Ok(Parcel { value, headers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_value_only() {
        let parcel = Parcel {
            value: Some(vec![1, 2, 3]),
            headers: None,
        };
        let decoded = Parcel::decode(&parcel.encode()).unwrap();
        assert_eq!(decoded.value, Some(vec![1, 2, 3]));
        assert!(decoded.headers.is_none());
    }

    #[test]
    fn round_trips_value_and_headers() {
        let mut headers = IndexMap::new();
        headers.insert(b"foo".to_vec(), vec![4, 5, 6]);
        let parcel = Parcel {
            value: Some(vec![9]),
            headers: Some(headers.clone()),
        };
        let decoded = Parcel::decode(&parcel.encode()).unwrap();
        assert_eq!(decoded.value, Some(vec![9]));
        assert_eq!(decoded.headers, Some(headers));
    }

    #[test]
    fn rejects_unknown_version() {
        let err = Parcel::decode(&[99, 0]).unwrap_err();
        assert!(err.to_string().contains("parcel_version"));
    }
}
