//! Payload codecs: ZSTD frames, NumPy `.npy` v1.0, and raw float32 vectors
//!
//! Three payload shapes are recognised by inspecting their leading bytes:
//! - `.npy` files starting with `\x93NUMPY`
//! - JSON-ish text starting with `{` or `[`
//! - raw vectors: a little-endian `u32` float count followed by the floats

use std::borrow::Cow;
use std::fmt;

use tracing::warn;

use crate::error::{EmbrError, Result};

/// ZSTD frame magic number (little-endian `0xFD2FB528`)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Level used when writing objects
pub const DEFAULT_LEVEL: i32 = 9;

const MAX_LEVEL: i32 = 22;

/// NumPy magic for format version 1.0
pub const NPY_MAGIC: &[u8; 8] = b"\x93NUMPY\x01\x00";

const NPY_PREFIX_LEN: usize = 10;
const NPY_ALIGN: usize = 64;

// ─────────────────────────────────────────────────────
// ZSTD
// ─────────────────────────────────────────────────────

pub fn is_zstd(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Compress into a single frame that records its content size.
///
/// Level `0` returns the input unchanged; other levels are clamped to `1..=22`.
pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    if level == 0 {
        return Ok(data.to_vec());
    }
    let level = level.clamp(1, MAX_LEVEL);
    zstd::bulk::compress(data, level)
        .map_err(|e| EmbrError::Compression(format!("zstd compress failed: {}", e)))
}

/// Declared content size of a frame; frames without one are rejected
pub fn frame_content_size(data: &[u8]) -> Result<usize> {
    if !is_zstd(data) {
        return Err(EmbrError::Compression("missing zstd magic".into()));
    }
    match zstd_safe::get_frame_content_size(data) {
        Ok(Some(size)) => usize::try_from(size)
            .map_err(|_| EmbrError::Memory(format!("frame content size {} too large", size))),
        Ok(None) => Err(EmbrError::Compression(
            "zstd frame does not declare its content size".into(),
        )),
        Err(_) => Err(EmbrError::Compression("corrupt zstd frame header".into())),
    }
}

/// Decompress a frame into a buffer of exactly its declared size
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let size = frame_content_size(data)?;
    let out = zstd::bulk::decompress(data, size)
        .map_err(|e| EmbrError::Compression(format!("zstd decompress failed: {}", e)))?;
    if out.len() != size {
        return Err(EmbrError::Compression(format!(
            "frame declared {} bytes but produced {}",
            size,
            out.len()
        )));
    }
    Ok(out)
}

/// Decompress when the buffer is a zstd frame, otherwise hand it back verbatim
pub fn decompress_or_verbatim(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    if is_zstd(data) {
        Ok(Cow::Owned(decompress(data)?))
    } else {
        Ok(Cow::Borrowed(data))
    }
}

// ─────────────────────────────────────────────────────
// Payload detection
// ─────────────────────────────────────────────────────

/// On-disk representation of an embedding payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Float count prefix followed by float32 values
    Bin,
    /// NumPy `.npy` v1.0, float32
    Npy,
    /// JSON-ish text; never decoded into floats
    Text,
}

impl PayloadFormat {
    /// Detect the format from leading bytes
    pub fn detect(data: &[u8]) -> Self {
        if is_npy(data) {
            PayloadFormat::Npy
        } else if is_text(data) {
            PayloadFormat::Text
        } else {
            PayloadFormat::Bin
        }
    }

    /// Value written as `file_type` in metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadFormat::Bin => "bin",
            PayloadFormat::Npy => "npy",
            PayloadFormat::Text => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bin" | "raw" => Some(PayloadFormat::Bin),
            "npy" => Some(PayloadFormat::Npy),
            "json" | "txt" | "text" => Some(PayloadFormat::Text),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_npy(data: &[u8]) -> bool {
    data.len() >= 6 && &data[..6] == b"\x93NUMPY"
}

/// JSON-ish text: `{...}` or `[...]` once surrounding whitespace is removed
pub fn is_text(data: &[u8]) -> bool {
    let trimmed = data.trim_ascii();
    match (trimmed.first(), trimmed.last()) {
        (Some(b'{'), Some(b'}')) | (Some(b'['), Some(b']')) => std::str::from_utf8(trimmed).is_ok(),
        _ => false,
    }
}

/// Decode any non-text payload into its float values
pub fn decode_vector(payload: &[u8]) -> Result<(Vec<f32>, PayloadFormat)> {
    match PayloadFormat::detect(payload) {
        PayloadFormat::Npy => Ok((parse_npy(payload)?, PayloadFormat::Npy)),
        PayloadFormat::Bin => Ok((parse_raw(payload)?, PayloadFormat::Bin)),
        PayloadFormat::Text => Err(EmbrError::InvalidFormat(
            "text payload has no vector values".into(),
        )),
    }
}

/// Encode values in the requested format
pub fn encode_vector(values: &[f32], format: PayloadFormat) -> Result<Vec<u8>> {
    match format {
        PayloadFormat::Npy => Ok(encode_npy(values)),
        PayloadFormat::Bin => Ok(encode_raw(values)),
        PayloadFormat::Text => Err(EmbrError::Unsupported(
            "cannot encode vector values as text".into(),
        )),
    }
}

// ─────────────────────────────────────────────────────
// Raw binary
// ─────────────────────────────────────────────────────

pub fn encode_raw(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.len() * 4);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Parse a count-prefixed float32 vector.
///
/// A count that disagrees with the buffer length is logged and the vector is
/// truncated to what the buffer actually holds.
pub fn parse_raw(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() < 4 {
        return Err(EmbrError::InvalidFormat(format!(
            "raw vector needs a 4-byte count, got {} bytes",
            data.len()
        )));
    }
    let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let available = (data.len() - 4) / 4;
    if declared.checked_mul(4).and_then(|n| n.checked_add(4)) != Some(data.len()) {
        warn!(
            "raw vector declares {} floats but buffer holds {} bytes",
            declared,
            data.len()
        );
    }
    Ok(floats_from_le(&data[4..4 + declared.min(available) * 4]))
}

fn floats_from_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ─────────────────────────────────────────────────────
// NumPy .npy v1.0
// ─────────────────────────────────────────────────────

/// Emit a 1-D little-endian float32 `.npy` buffer.
///
/// The header dictionary is space-padded and newline-terminated so the data
/// starts on a 64-byte boundary, matching `numpy.save`.
pub fn encode_npy(values: &[f32]) -> Vec<u8> {
    let dict = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    let unpadded = NPY_PREFIX_LEN + dict.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(NPY_PREFIX_LEN + header_len + values.len() * 4);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat_n(b' ', padding));
    out.push(b'\n');
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Offset of the array data in a v1.0 `.npy` buffer
pub fn npy_data_offset(data: &[u8]) -> Result<usize> {
    if data.len() < NPY_PREFIX_LEN || !is_npy(data) {
        return Err(EmbrError::InvalidFormat("missing NumPy magic".into()));
    }
    if data[6] != 1 {
        return Err(EmbrError::Unsupported(format!(
            "NumPy format version {}.{}",
            data[6], data[7]
        )));
    }
    let header_len = u16::from_le_bytes([data[8], data[9]]) as usize;
    let offset = NPY_PREFIX_LEN + header_len;
    if offset > data.len() {
        return Err(EmbrError::InvalidFormat(format!(
            "NumPy header length {} exceeds buffer of {} bytes",
            header_len,
            data.len()
        )));
    }
    Ok(offset)
}

/// Parse a float32 `.npy` buffer, tolerating any conformant header padding
pub fn parse_npy(data: &[u8]) -> Result<Vec<f32>> {
    let offset = npy_data_offset(data)?;
    let header = std::str::from_utf8(&data[NPY_PREFIX_LEN..offset])
        .map_err(|_| EmbrError::InvalidFormat("NumPy header is not ASCII".into()))?;

    let descr = dict_value(header, "descr")
        .ok_or_else(|| EmbrError::InvalidFormat("NumPy header lacks 'descr'".into()))?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    if descr != "<f4" && descr != "f4" {
        return Err(EmbrError::Unsupported(format!("NumPy dtype '{}'", descr)));
    }
    if dict_value(header, "fortran_order").is_some_and(|v| v.starts_with("True")) {
        return Err(EmbrError::Unsupported("Fortran-ordered NumPy arrays".into()));
    }

    let count = match dict_value(header, "shape") {
        Some(shape) => shape_len(shape)?,
        None => (data.len() - offset) / 4,
    };
    let needed = count * 4;
    if data.len() - offset < needed {
        return Err(EmbrError::InvalidFormat(format!(
            "NumPy shape wants {} floats but only {} bytes follow the header",
            count,
            data.len() - offset
        )));
    }
    Ok(floats_from_le(&data[offset..offset + needed]))
}

/// Raw text of the value following `'key':` in a NumPy header dictionary
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let quoted = format!("'{}'", key);
    let start = header.find(&quoted)? + quoted.len();
    let rest = header[start..].trim_start().strip_prefix(':')?.trim_start();
    if rest.starts_with('(') {
        let end = rest.find(')')?;
        Some(&rest[..=end])
    } else {
        let end = rest.find([',', '}']).unwrap_or(rest.len());
        Some(rest[..end].trim())
    }
}

fn shape_len(shape: &str) -> Result<usize> {
    let inner = shape.trim().trim_start_matches('(').trim_end_matches(')');
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .try_fold(1usize, |acc, dim| {
            let n: usize = dim
                .parse()
                .map_err(|_| EmbrError::InvalidFormat(format!("bad NumPy shape '{}'", shape)))?;
            acc.checked_mul(n)
                .ok_or_else(|| EmbrError::Memory(format!("NumPy shape '{}' overflows", shape)))
        })
}
