//! Sink adapter for the external document store.
//!
//! Scores, alerts, baselines and daily summaries are written as JSON
//! documents through the [`DocumentStore`] trait. Writes go through the
//! [`SinkWriter`] so a slow or unavailable store never stalls scoring.

pub mod file;
#[cfg(feature = "remote")]
pub mod http;
pub mod memory;
pub mod writer;

use crate::core::baseline::BaselineSnapshot;
use crate::core::biography::DailySummary;
use crate::core::escalation::Alert;
use crate::core::fusion::CompositeScore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

// Re-export commonly used types
pub use file::FileStore;
#[cfg(feature = "remote")]
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use writer::{SinkWriter, WriterConfig};

/// Collection holding immutable composite scores.
pub const SCORES: &str = "composite_scores";
/// Collection holding alerts, keyed like their triggering score.
pub const ALERTS: &str = "alerts";
/// Collection holding one upsertable baseline per subject.
pub const BASELINES: &str = "baselines";
/// Collection holding daily activity summaries.
pub const DAILY_SUMMARIES: &str = "daily_summaries";

/// Sink errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    /// SinkUnavailableError: the write may succeed later
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("document {collection}/{key} rejected: {reason}")]
    Rejected {
        collection: String,
        key: String,
        reason: String,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

/// Minimal document-store interface.
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document.
    fn put(&self, collection: &str, key: &str, document: &Value) -> Result<(), SinkError>;

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, SinkError>;

    /// All documents in a collection, ordered by key.
    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, SinkError>;
}

/// A record waiting to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    Score(Box<CompositeScore>),
    Alert(Box<Alert>),
    Baseline(Box<BaselineSnapshot>),
    DailySummary(Box<DailySummary>),
}

impl SinkRecord {
    /// Alerts are never dropped on overflow.
    pub fn is_alert(&self) -> bool {
        matches!(self, SinkRecord::Alert(_))
    }

    pub fn collection(&self) -> &'static str {
        match self {
            SinkRecord::Score(_) => SCORES,
            SinkRecord::Alert(_) => ALERTS,
            SinkRecord::Baseline(_) => BASELINES,
            SinkRecord::DailySummary(_) => DAILY_SUMMARIES,
        }
    }

    pub fn key(&self) -> String {
        match self {
            SinkRecord::Score(s) => s.key(),
            SinkRecord::Alert(a) => a.key().to_string(),
            SinkRecord::Baseline(b) => b.subject_id.clone(),
            SinkRecord::DailySummary(d) => d.key(),
        }
    }

    pub fn to_document(&self) -> Result<Value, SinkError> {
        let result = match self {
            SinkRecord::Score(s) => serde_json::to_value(s),
            SinkRecord::Alert(a) => serde_json::to_value(a),
            SinkRecord::Baseline(b) => serde_json::to_value(b),
            SinkRecord::DailySummary(d) => serde_json::to_value(d),
        };
        result.map_err(|e| SinkError::Serialization(e.to_string()))
    }

    /// Write this record directly to `store`.
    pub fn write_to(&self, store: &dyn DocumentStore) -> Result<(), SinkError> {
        store.put(self.collection(), &self.key(), &self.to_document()?)
    }
}

/// Read one typed document.
pub fn load<T: DeserializeOwned>(store: &dyn DocumentStore, collection: &str, key: &str) -> Result<Option<T>, SinkError> {
    match store.get(collection, key)? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| SinkError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Read every document of a collection as `T`, skipping ones that fail to
/// decode.
pub fn load_all<T: DeserializeOwned>(store: &dyn DocumentStore, collection: &str) -> Result<Vec<T>, SinkError> {
    Ok(store
        .list(collection)?
        .into_iter()
        .filter_map(|(_, value)| serde_json::from_value(value).ok())
        .collect())
}

/// Last persisted baseline for a subject.
pub fn load_baseline(store: &dyn DocumentStore, subject_id: &str) -> Result<Option<BaselineSnapshot>, SinkError> {
    load(store, BASELINES, subject_id)
}

/// Percent-encode a key into a single path segment.
///
/// Every byte outside `[A-Za-z0-9-_.]` becomes `%XX`, and a leading `.` is
/// escaped too, so distinct keys always map to distinct segments.
pub(crate) fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') || (byte == b'.' && i > 0);
        if plain {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// Inverse of [`encode_key`]. Returns `None` for malformed input.
pub(crate) fn decode_key(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = segment.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("S1_1700000000000_3"), "S1_1700000000000_3");
        assert_eq!(encode_key("ward/7 bed:2"), "ward%2F7%20bed%3A2");
        assert_eq!(encode_key(".."), "%2E.");
        assert_eq!(encode_key("100%"), "100%25");
    }

    #[test]
    fn test_encoded_keys_stay_distinct() {
        let keys = ["a/b", "a_b", "a%2Fb", "José", "Jos_", "Jos?"];
        let encoded: std::collections::HashSet<String> = keys.iter().map(|k| encode_key(k)).collect();
        assert_eq!(encoded.len(), keys.len());
        for key in keys {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
        assert_eq!(decode_key("bad%2"), None);
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(SinkError::Unavailable("down".to_string()).is_retryable());
        assert!(!SinkError::Serialization("bad".to_string()).is_retryable());
    }
}
