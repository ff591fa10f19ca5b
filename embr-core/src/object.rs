//! Native object form
//!
//! A stored object is a fixed 52-byte header followed by the payload body:
//!
//! ```text
//! magic "EBVS" | version u32 | type u32 | flags u32 | size u32 | hash [32]
//! ```
//!
//! All integers are little-endian. `size` is the uncompressed payload length
//! and `hash` is the SHA-256 of the uncompressed payload. When `FLAG_COMPRESSED`
//! is set the body is a single ZSTD frame.
//!
//! Objects written before the header existed are still readable: a file
//! without the magic is either a `.npy` buffer or a count-prefixed raw vector.

use crate::codec;
use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;

pub const OBJECT_MAGIC: [u8; 4] = *b"EBVS";
pub const OBJECT_VERSION: u32 = 0x0000_0100;
pub const HEADER_LEN: usize = 52;

/// Body is a ZSTD frame
pub const FLAG_COMPRESSED: u32 = 1;

/// Kind of payload carried by an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectType {
    Vector = 1,
    Text = 2,
}

impl ObjectType {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(ObjectType::Vector),
            2 => Ok(ObjectType::Text),
            other => Err(EmbrError::InvalidFormat(format!("unknown object type {}", other))),
        }
    }
}

/// Fixed-size object header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub version: u32,
    pub obj_type: ObjectType,
    pub flags: u32,
    pub size: u32,
    pub hash: ObjectHash,
}

impl ObjectHeader {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&OBJECT_MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&(self.obj_type as u32).to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..20].copy_from_slice(&self.size.to_le_bytes());
        out[20..52].copy_from_slice(self.hash.as_bytes());
        out
    }

    /// Parse the header, or `None` when the buffer is a legacy headerless object
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 4 || data[..4] != OBJECT_MAGIC {
            return Ok(None);
        }
        if data.len() < HEADER_LEN {
            return Err(EmbrError::InvalidFormat(format!(
                "truncated object header ({} bytes)",
                data.len()
            )));
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let version = word(4);
        if version >> 16 != OBJECT_VERSION >> 16 {
            return Err(EmbrError::Unsupported(format!(
                "object format version {:#x}",
                version
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&data[20..52]);
        Ok(Some(Self {
            version,
            obj_type: ObjectType::from_u32(word(8))?,
            flags: word(12),
            size: word(16),
            hash: ObjectHash::new(hash),
        }))
    }
}

/// Payload recovered from a native object
#[derive(Debug, Clone)]
pub struct DecodedObject {
    pub header: Option<ObjectHeader>,
    pub payload: Vec<u8>,
}

impl DecodedObject {
    /// Hash from the header, or computed from the payload for legacy objects
    pub fn hash(&self) -> ObjectHash {
        match &self.header {
            Some(h) => h.hash,
            None => ObjectHash::from_data(&self.payload),
        }
    }
}

/// Wrap a payload in the native form, compressing at `level` (0 stores it plain)
pub fn encode_object(payload: &[u8], level: i32) -> Result<(ObjectHash, Vec<u8>)> {
    let size = u32::try_from(payload.len()).map_err(|_| {
        EmbrError::invalid(format!("payload of {} bytes exceeds 4 GiB", payload.len()))
    })?;
    let hash = ObjectHash::from_data(payload);
    let obj_type = if codec::is_text(payload) {
        ObjectType::Text
    } else {
        ObjectType::Vector
    };
    let (flags, body) = if level == 0 {
        (0, payload.to_vec())
    } else {
        (FLAG_COMPRESSED, codec::compress(payload, level)?)
    };
    let header = ObjectHeader {
        version: OBJECT_VERSION,
        obj_type,
        flags,
        size,
        hash,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    Ok((hash, out))
}

/// Unwrap any of the three stored variants into the uncompressed payload.
///
/// Headered objects are checked against their recorded size and hash.
pub fn decode_object(data: &[u8]) -> Result<DecodedObject> {
    let Some(header) = ObjectHeader::decode(data)? else {
        let payload = codec::decompress_or_verbatim(data)?.into_owned();
        return Ok(DecodedObject {
            header: None,
            payload,
        });
    };

    let body = &data[HEADER_LEN..];
    let payload = if header.is_compressed() {
        codec::decompress(body)?
    } else {
        body.to_vec()
    };
    if payload.len() != header.size as usize {
        return Err(EmbrError::InvalidFormat(format!(
            "object {} declares {} bytes but holds {}",
            header.hash.short(12),
            header.size,
            payload.len()
        )));
    }
    let actual = ObjectHash::from_data(&payload);
    if actual != header.hash {
        return Err(EmbrError::HashMismatch {
            expected: header.hash.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(DecodedObject {
        header: Some(header),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_npy, encode_raw};

    #[test]
    fn test_encode_decode_compressed() {
        let payload = encode_raw(&[1.0, 2.0, 3.0, 4.0]);
        let (hash, bytes) = encode_object(&payload, codec::DEFAULT_LEVEL).unwrap();
        assert_eq!(&bytes[..4], b"EBVS");

        let decoded = decode_object(&bytes).unwrap();
        let header = decoded.header.as_ref().unwrap();
        assert!(header.is_compressed());
        assert_eq!(header.size as usize, payload.len());
        assert_eq!(header.obj_type, ObjectType::Vector);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.hash(), hash);
    }

    #[test]
    fn test_text_object_type() {
        let (_, bytes) = encode_object(b"{\"k\": 1}", 3).unwrap();
        let header = ObjectHeader::decode(&bytes).unwrap().unwrap();
        assert_eq!(header.obj_type, ObjectType::Text);
    }

    #[test]
    fn test_legacy_variants() {
        let raw = encode_raw(&[0.5, 0.25]);
        let decoded = decode_object(&raw).unwrap();
        assert!(decoded.header.is_none());
        assert_eq!(decoded.payload, raw);
        assert_eq!(decoded.hash(), ObjectHash::from_data(&raw));

        let npy = encode_npy(&[0.5, 0.25]);
        assert_eq!(decode_object(&npy).unwrap().payload, npy);
    }

    #[test]
    fn test_corrupt_body_is_hash_mismatch() {
        let payload = encode_raw(&[9.0; 8]);
        let (_, mut bytes) = encode_object(&payload, 0).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode_object(&bytes).unwrap_err(),
            EmbrError::HashMismatch { .. }
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(decode_object(b"EBVS\x00\x01").is_err());
    }
}
