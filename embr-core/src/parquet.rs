//! Parquet interchange format
//!
//! Each object becomes a one-row Parquet file with ZSTD column compression:
//!
//! | column     | type          | content                                   |
//! |------------|---------------|-------------------------------------------|
//! | `id`       | utf8          | object hash (hex)                         |
//! | `values`   | list<float32> | the vector                                |
//! | `metadata` | utf8          | minified JSON (hash, source, model, ...)  |
//! | `blob`     | utf8          | `{"text": "..."}` or `{}`                 |
//!
//! JSON-ish text payloads are never wrapped; the forward transform hands
//! them back unchanged.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, Float32Array, Float32Builder, LargeBinaryArray, ListArray, ListBuilder,
    RecordBatch, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use bytes::Bytes;
use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::{Compression, ZstdLevel};
use ::parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{self, PayloadFormat};
use crate::error::{EmbrError, Result};
use crate::hash::ObjectHash;
use crate::meta::{self, Metadata};
use crate::object;
use crate::store::ObjectStore;

const ZSTD_COLUMN_LEVEL: i32 = 3;

/// Result of a forward transform
#[derive(Debug, Clone)]
pub enum Transformed {
    /// Parquet file bytes
    Parquet(Vec<u8>),
    /// Text payload returned verbatim
    Passthrough(Vec<u8>),
}

impl Transformed {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Transformed::Parquet(b) | Transformed::Passthrough(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Transformed::Parquet(b) | Transformed::Passthrough(b) => b,
        }
    }

    /// File extension used for remote document keys
    pub fn extension(&self) -> &'static str {
        match self {
            Transformed::Parquet(_) => "parquet",
            Transformed::Passthrough(_) => "json",
        }
    }
}

/// JSON stored in the `metadata` column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub dimensions: usize,
    #[serde(default)]
    pub file_type: String,
}

/// Native payload rebuilt from a Parquet record
#[derive(Debug, Clone)]
pub struct Restored {
    pub payload: Vec<u8>,
    /// Hash recorded in the metadata column; legacy rows carry none
    pub id_hash: Option<ObjectHash>,
    pub record: RecordMetadata,
    /// Text recovered from the `blob` column, if any
    pub blob_text: Option<String>,
}

impl Restored {
    /// Sidecar metadata using the recognised keys; a missing timestamp is filled with now
    pub fn metadata(&self) -> Metadata {
        let mut m = Metadata::new();
        if let Some(source) = &self.record.source {
            m.set(meta::KEY_SOURCE_FILE, source.as_str());
        }
        let ts = self
            .record
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        m.set(meta::KEY_TIMESTAMP, ts.to_string());
        if !self.record.file_type.is_empty() {
            m.set(meta::KEY_FILE_TYPE, self.record.file_type.as_str());
        }
        if let Some(model) = &self.record.model {
            m.set(meta::KEY_MODEL, model.as_str());
        }
        if self.record.dimensions > 0 {
            m.set(meta::KEY_DIMENSIONS, self.record.dimensions.to_string());
        }
        m
    }

    /// Write the payload and its sidecar into `store`, checking the recorded hash
    pub fn write_to(&self, store: &ObjectStore) -> Result<ObjectHash> {
        let actual = ObjectHash::from_data(&self.payload);
        if let Some(expected) = self.id_hash {
            if expected != actual {
                return Err(EmbrError::HashMismatch {
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }
        store.write(&self.payload, &self.metadata())
    }
}

/// Converts between the native object form and an interchange format
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encode a native object; `blob_text` is the source document, if the caller has it
    fn forward(&self, native: &[u8], metadata: Option<&Metadata>, blob_text: Option<&str>) -> Result<Transformed>;

    fn inverse(&self, data: &[u8]) -> Result<Restored>;
}

/// Transformer for a remote's configured `format`
pub fn transformer_for(format: &str) -> Result<Box<dyn Transformer>> {
    match format.trim().to_ascii_lowercase().as_str() {
        "" | "parquet" => Ok(Box::new(ParquetTransformer)),
        other => Err(EmbrError::Unsupported(format!("transformer '{}'", other))),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetTransformer;

impl Transformer for ParquetTransformer {
    fn name(&self) -> &'static str {
        "parquet"
    }

    fn forward(&self, native: &[u8], metadata: Option<&Metadata>, blob_text: Option<&str>) -> Result<Transformed> {
        forward(native, metadata, blob_text)
    }

    fn inverse(&self, data: &[u8]) -> Result<Restored> {
        inverse(data)
    }
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "values",
            DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
            false,
        ),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("blob", DataType::Utf8, false),
    ]))
}

fn random_id() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Native object (headered, legacy raw, or `.npy`) to a Parquet record
pub fn forward(native: &[u8], metadata: Option<&Metadata>, blob_text: Option<&str>) -> Result<Transformed> {
    let decoded = object::decode_object(native)?;
    let payload = decoded.payload;
    let format = PayloadFormat::detect(&payload);
    if format == PayloadFormat::Text {
        debug!("text payload passed through without a Parquet wrapper");
        return Ok(Transformed::Passthrough(payload));
    }
    let (values, format) = codec::decode_vector(&payload)?;

    let id = match &decoded.header {
        Some(h) => h.hash.to_hex(),
        None => random_id(),
    };
    let record = RecordMetadata {
        hash: decoded.header.as_ref().map(|h| h.hash.to_hex()),
        source: metadata.and_then(|m| m.source_file()).map(str::to_string),
        model: metadata.and_then(|m| m.model()).map(str::to_string),
        timestamp: metadata.and_then(|m| m.timestamp()),
        dimensions: values.len(),
        file_type: format.as_str().to_string(),
    };
    let blob = match blob_text {
        Some(text) => serde_json::json!({ "text": text }),
        None => serde_json::json!({}),
    };

    let mut list = ListBuilder::new(Float32Builder::with_capacity(values.len()));
    list.values().append_slice(&values);
    list.append(true);

    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(StringArray::from(vec![id])) as ArrayRef,
            Arc::new(list.finish()) as ArrayRef,
            Arc::new(StringArray::from(vec![serde_json::to_string(&record)?])) as ArrayRef,
            Arc::new(StringArray::from(vec![blob.to_string()])) as ArrayRef,
        ],
    )?;

    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(ZSTD_COLUMN_LEVEL)?))
        .build();
    let mut out = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Transformed::Parquet(out))
}

/// Parquet record back to a native payload
pub fn inverse(data: &[u8]) -> Result<Restored> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(data))?.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    let Some(first) = batches.iter().find(|b| b.num_rows() > 0) else {
        return Err(EmbrError::Transformer("Parquet file has no rows".into()));
    };

    let values_col = first
        .column_by_name("values")
        .ok_or_else(|| EmbrError::Transformer("missing 'values' column".into()))?;
    let record: RecordMetadata = match string_cell(first, "metadata")? {
        Some(json) if !json.trim().is_empty() => serde_json::from_str(&json)?,
        _ => RecordMetadata::default(),
    };
    let blob_text = string_cell(first, "blob")?
        .and_then(|b| serde_json::from_str::<serde_json::Value>(&b).ok())
        .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string));

    let format = PayloadFormat::parse(&record.file_type).unwrap_or(PayloadFormat::Npy);
    let payload = match values_col.data_type() {
        DataType::List(_) => {
            let list = downcast::<ListArray>(values_col, "list")?;
            let row = list.value(0);
            let floats = downcast::<Float32Array>(&row, "list<float>")?;
            rebuild(floats.values().to_vec(), format)?
        }
        DataType::Float32 => {
            // One value per row, possibly across several batches
            let mut values = Vec::new();
            for batch in &batches {
                if let Some(col) = batch.column_by_name("values") {
                    values.extend_from_slice(downcast::<Float32Array>(col, "float")?.values());
                }
            }
            rebuild(values, format)?
        }
        DataType::Binary => downcast::<BinaryArray>(values_col, "binary")?.value(0).to_vec(),
        DataType::LargeBinary => downcast::<LargeBinaryArray>(values_col, "binary")?.value(0).to_vec(),
        other => {
            return Err(EmbrError::Transformer(format!(
                "unsupported 'values' column type {}",
                other
            )))
        }
    };

    // The `id` of a legacy row is random, so only the recorded hash is checked
    let id_hash = record.hash.as_deref().and_then(|s| ObjectHash::from_hex(s).ok());
    Ok(Restored {
        payload,
        id_hash,
        record,
        blob_text,
    })
}

fn rebuild(values: Vec<f32>, format: PayloadFormat) -> Result<Vec<u8>> {
    match format {
        PayloadFormat::Text => Err(EmbrError::Transformer(
            "record marked as text carries vector values".into(),
        )),
        other => codec::encode_vector(&values, other),
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, what: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| EmbrError::Transformer(format!("'values' column is not {}", what)))
}

fn string_cell(batch: &RecordBatch, name: &str) -> Result<Option<String>> {
    let Some(col) = batch.column_by_name(name) else {
        return Ok(None);
    };
    let strings = col
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| EmbrError::Transformer(format!("'{}' column is not a string", name)))?;
    if strings.is_empty() || strings.is_null(0) {
        return Ok(None);
    }
    Ok(Some(strings.value(0).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_npy, encode_raw};
    use crate::object::encode_object;
    use tempfile::TempDir;

    fn roundtrip(payload: &[u8], meta: Option<&Metadata>) -> Restored {
        let (_, native) = encode_object(payload, codec::DEFAULT_LEVEL).unwrap();
        let Transformed::Parquet(bytes) = forward(&native, meta, None).unwrap() else {
            panic!("expected a Parquet record");
        };
        inverse(&bytes).unwrap()
    }

    #[test]
    fn test_npy_roundtrip_is_byte_exact() {
        let values: Vec<f32> = (0..100).map(|i| i as f32 * 0.5).collect();
        let npy = encode_npy(&values);
        let restored = roundtrip(&npy, None);
        assert_eq!(restored.payload, npy);
        assert_eq!(restored.record.file_type, "npy");
        assert_eq!(restored.record.dimensions, 100);
        assert_eq!(restored.id_hash, Some(ObjectHash::from_data(&npy)));
    }

    #[test]
    fn test_raw_roundtrip_is_byte_exact() {
        let raw = encode_raw(&[1.0, -2.5, 3.25, 4.0]);
        assert_eq!(roundtrip(&raw, None).payload, raw);
    }

    #[test]
    fn test_metadata_is_carried() {
        let meta = Metadata::new()
            .with("source_file", "docs/a.txt")
            .with("model", "m1")
            .with("timestamp", "1700000000");
        let restored = roundtrip(&encode_raw(&[1.0, 2.0]), Some(&meta));
        assert_eq!(restored.record.source.as_deref(), Some("docs/a.txt"));
        assert_eq!(restored.record.model.as_deref(), Some("m1"));
        assert_eq!(restored.record.timestamp, Some(1_700_000_000));

        let sidecar = restored.metadata();
        assert_eq!(sidecar.source_file(), Some("docs/a.txt"));
        assert_eq!(sidecar.model(), Some("m1"));
        assert_eq!(sidecar.dimensions(), Some(2));
    }

    #[test]
    fn test_missing_timestamp_is_generated() {
        let restored = roundtrip(&encode_raw(&[1.0]), None);
        assert!(restored.metadata().timestamp().unwrap() > 0);
    }

    #[test]
    fn test_text_passthrough() {
        let json = br#"{"embedding": [1, 2, 3]}"#;
        let (_, native) = encode_object(json, 3).unwrap();
        match forward(&native, None, None).unwrap() {
            Transformed::Passthrough(bytes) => assert_eq!(bytes, json.to_vec()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_blob_text_is_explicit() {
        let (_, native) = encode_object(&encode_raw(&[1.0]), 3).unwrap();
        let bytes = forward(&native, None, Some("hello world")).unwrap().into_bytes();
        assert_eq!(inverse(&bytes).unwrap().blob_text.as_deref(), Some("hello world"));

        // Nothing leaks into the next transform
        let bytes = forward(&native, None, None).unwrap().into_bytes();
        assert_eq!(inverse(&bytes).unwrap().blob_text, None);
    }

    #[test]
    fn test_legacy_object_gets_random_id() {
        let temp_dir = TempDir::new().unwrap();
        let store = ObjectStore::new(temp_dir.path().join("objects"));
        let raw = encode_raw(&[7.0, 8.0]);
        let bytes = forward(&raw, None, None).unwrap().into_bytes();
        let restored = inverse(&bytes).unwrap();
        assert_eq!(restored.payload, raw);
        assert_eq!(restored.record.hash, None);
        assert_eq!(restored.id_hash, None);
        assert_eq!(restored.write_to(&store).unwrap(), ObjectHash::from_data(&raw));
    }

    #[test]
    fn test_legacy_npy_object_is_restorable() {
        let temp_dir = TempDir::new().unwrap();
        let store = ObjectStore::new(temp_dir.path().join("objects"));
        let npy = encode_npy(&[0.5, 1.5, 2.5]);
        let bytes = forward(&npy, None, None).unwrap().into_bytes();
        let hash = inverse(&bytes).unwrap().write_to(&store).unwrap();
        assert_eq!(hash, ObjectHash::from_data(&npy));
        assert_eq!(store.read_payload(&hash).unwrap(), npy);
    }

    #[test]
    fn test_write_to_checks_hash() {
        let temp_dir = TempDir::new().unwrap();
        let store = ObjectStore::new(temp_dir.path().join("objects"));
        let mut restored = roundtrip(&encode_raw(&[1.0, 2.0]), None);
        let hash = restored.write_to(&store).unwrap();
        assert!(store.exists(&hash));

        restored.payload = encode_raw(&[9.0, 9.0]);
        assert!(matches!(
            restored.write_to(&store).unwrap_err(),
            EmbrError::HashMismatch { .. }
        ));
    }

    #[test]
    fn test_inverse_rejects_garbage() {
        assert!(inverse(b"definitely not parquet").is_err());
        assert!(transformer_for("avro").is_err());
        assert_eq!(transformer_for("Parquet").unwrap().name(), "parquet");
    }
}
