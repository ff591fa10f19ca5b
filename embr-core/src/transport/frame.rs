//! Batch framing for large transfers
//!
//! A frame is a 4-byte big-endian header length, an ASCII header, and for
//! `BATCH` frames the body:
//!
//! ```text
//! BATCH <n>/<N> SIZE <raw bytes> COMPRESSED <body bytes, 0 if raw>
//! RESUME <n>/<N> FROM <byte offset> TOTAL <payload bytes>
//! ```
//!
//! A transfer of more than one batch is closed by the unprefixed literal `END`.

use crate::codec;
use crate::error::{EmbrError, Result};

/// Closes a multi-batch transfer
pub const END_MARKER: &[u8] = b"END";

const MAX_HEADER_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Batch {
        number: usize,
        total: usize,
        size: usize,
        /// Length of a zstd body, 0 when the body is sent raw
        compressed: usize,
        body: Vec<u8>,
    },
    Resume {
        number: usize,
        total: usize,
        from: u64,
        total_size: u64,
    },
    End,
}

impl Frame {
    /// Raw batch bytes, decompressing the body when needed
    pub fn unpack(self) -> Result<Vec<u8>> {
        match self {
            Frame::Batch {
                size, compressed, body, ..
            } => batch_body(size, compressed, body),
            _ => Err(EmbrError::Protocol("not a batch frame".into())),
        }
    }
}

/// Check and decompress a batch body against its header fields
pub fn batch_body(size: usize, compressed: usize, body: Vec<u8>) -> Result<Vec<u8>> {
    let raw = if compressed == 0 { body } else { codec::decompress(&body)? };
    if raw.len() != size {
        return Err(EmbrError::Protocol(format!(
            "batch carries {} bytes, header says {}",
            raw.len(),
            size
        )));
    }
    Ok(raw)
}

/// Number of batches needed for `size` bytes
pub fn batch_count(size: usize, batch_size: usize) -> usize {
    size.div_ceil(batch_size.max(1)).max(1)
}

fn with_header(header: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + header.len() + body.len());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Frame one batch, zstd-compressing it unless `compress` is false
pub fn encode_batch(number: usize, total: usize, chunk: &[u8], compress: bool) -> Result<Vec<u8>> {
    let (body, compressed) = if compress {
        let body = codec::compress(chunk, codec::DEFAULT_LEVEL)?;
        let len = body.len();
        (body, len)
    } else {
        (chunk.to_vec(), 0)
    };
    let header = format!(
        "BATCH {}/{} SIZE {} COMPRESSED {}",
        number,
        total,
        chunk.len(),
        compressed
    );
    Ok(with_header(&header, &body))
}

pub fn encode_resume(number: usize, total: usize, from: u64, total_size: u64) -> Vec<u8> {
    let header = format!("RESUME {}/{} FROM {} TOTAL {}", number, total, from, total_size);
    with_header(&header, &[])
}

fn parse_fraction(s: &str) -> Option<(usize, usize)> {
    let (n, total) = s.split_once('/')?;
    Some((n.parse().ok()?, total.parse().ok()?))
}

/// Decode `data` as a frame; `Ok(None)` means plain unframed data
pub fn decode(data: &[u8]) -> Result<Option<Frame>> {
    if data == END_MARKER {
        return Ok(Some(Frame::End));
    }
    if data.len() < 4 {
        return Ok(None);
    }
    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if header_len == 0 || header_len > MAX_HEADER_LEN || data.len() < 4 + header_len {
        return Ok(None);
    }
    let Ok(header) = std::str::from_utf8(&data[4..4 + header_len]) else {
        return Ok(None);
    };
    let fields: Vec<&str> = header.split_whitespace().collect();
    let bad = || EmbrError::Protocol(format!("malformed frame header '{}'", header));
    match fields.as_slice() {
        ["BATCH", fraction, "SIZE", size, "COMPRESSED", compressed] => {
            let (number, total) = parse_fraction(fraction).ok_or_else(bad)?;
            let size: usize = size.parse().map_err(|_| bad())?;
            let compressed: usize = compressed.parse().map_err(|_| bad())?;
            let body = data[4 + header_len..].to_vec();
            let expected = if compressed == 0 { size } else { compressed };
            if body.len() != expected || number == 0 || number > total {
                return Err(bad());
            }
            Ok(Some(Frame::Batch {
                number,
                total,
                size,
                compressed,
                body,
            }))
        }
        ["RESUME", fraction, "FROM", from, "TOTAL", total_size] => {
            let (number, total) = parse_fraction(fraction).ok_or_else(bad)?;
            Ok(Some(Frame::Resume {
                number,
                total,
                from: from.parse().map_err(|_| bad())?,
                total_size: total_size.parse().map_err(|_| bad())?,
            }))
        }
        [first, ..] if *first == "BATCH" || *first == "RESUME" => Err(bad()),
        _ => Ok(None),
    }
}

/// Key under which batch `n` of `key` is staged
pub fn part_key(key: &str, number: usize) -> String {
    format!("{}.part-{:05}", key, number)
}
