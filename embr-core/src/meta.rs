//! Sidecar metadata (`<hash>.meta`)
//!
//! Line-oriented `key=value` pairs. The older `key: value` form is accepted on
//! read, and `provider` is read as an alias of `model`. Key order is preserved
//! so rewriting a file does not reshuffle it.

use crate::error::Result;

pub const KEY_SOURCE_FILE: &str = "source_file";
pub const KEY_FILE_TYPE: &str = "file_type";
pub const KEY_MODEL: &str = "model";
pub const KEY_TIMESTAMP: &str = "timestamp";
pub const KEY_DIMENSIONS: &str = "dimensions";

const LEGACY_MODEL_KEY: &str = "provider";

/// Weight applied to this object's side in a weighted merge
pub const KEY_MERGE_WEIGHT: &str = "merge_weight";

/// Ordered string map stored beside each object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut meta = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let pair = match (line.find('='), line.find(':')) {
                (Some(eq), Some(colon)) if colon < eq => line.split_at(colon),
                (Some(eq), _) => line.split_at(eq),
                (None, Some(colon)) => line.split_at(colon),
                (None, None) => continue,
            };
            let key = pair.0.trim();
            let value = pair.1[1..].trim();
            if !key.is_empty() {
                meta.set(key, value);
            }
        }
        meta
    }

    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace, keeping the original position of an existing key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_file(&self) -> Option<&str> {
        self.get(KEY_SOURCE_FILE)
    }

    pub fn model(&self) -> Option<&str> {
        self.get(KEY_MODEL).or_else(|| self.get(LEGACY_MODEL_KEY))
    }

    pub fn file_type(&self) -> Option<&str> {
        self.get(KEY_FILE_TYPE)
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.get(KEY_TIMESTAMP).and_then(|v| v.parse().ok())
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.get(KEY_DIMENSIONS).and_then(|v| v.parse().ok())
    }

    pub fn merge_weight(&self) -> Option<f32> {
        self.get(KEY_MERGE_WEIGHT)
            .and_then(|v| v.parse().ok())
            .filter(|w: &f32| w.is_finite() && *w >= 0.0)
    }
}

/// Read and parse a `.meta` file
pub fn read_metadata(path: &std::path::Path) -> Result<Metadata> {
    let text = std::fs::read_to_string(path)?;
    Ok(Metadata::parse(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_both_syntaxes() {
        let meta = Metadata::parse(
            "source_file=docs/a.txt\ntimestamp: 1700000000\nfile_type=npy\n\nprovider=openai\n",
        );
        assert_eq!(meta.source_file(), Some("docs/a.txt"));
        assert_eq!(meta.timestamp(), Some(1_700_000_000));
        assert_eq!(meta.file_type(), Some("npy"));
        assert_eq!(meta.model(), Some("openai"));
    }

    #[test]
    fn test_model_key_wins_over_provider() {
        let meta = Metadata::parse("provider=old\nmodel=new\n");
        assert_eq!(meta.model(), Some("new"));
    }

    #[test]
    fn test_unknown_keys_survive_rewrite() {
        let meta = Metadata::parse("model=m1\ncustom_key=keep me\n");
        let text = meta.to_text();
        assert_eq!(text, "model=m1\ncustom_key=keep me\n");
        assert_eq!(Metadata::parse(&text), meta);
    }

    #[test]
    fn test_value_may_contain_separators() {
        let meta = Metadata::parse("note=a=b\nurl=http://x\n");
        assert_eq!(meta.get("note"), Some("a=b"));
        assert_eq!(meta.get("url"), Some("http://x"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut meta = Metadata::new().with("a", "1").with("b", "2");
        meta.set("a", "3");
        assert_eq!(meta.to_text(), "a=3\nb=2\n");
    }

    #[test]
    fn test_merge_weight_filters_invalid() {
        assert_eq!(Metadata::parse("merge_weight=0.25").merge_weight(), Some(0.25));
        assert_eq!(Metadata::parse("merge_weight=-1").merge_weight(), None);
        assert_eq!(Metadata::parse("merge_weight=abc").merge_weight(), None);
    }
}
