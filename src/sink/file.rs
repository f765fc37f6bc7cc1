//! File-backed document store.
//!
//! Each document lives at `<root>/<collection>/<key>.json`. Writes go to a
//! temporary file first and are renamed into place.

use super::{decode_key, encode_key, DocumentStore, SinkError};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Document store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(encode_key(collection))
    }

    fn document_path(&self, collection: &str, key: &str) -> PathBuf {
        self.collection_dir(collection).join(format!("{}.json", encode_key(key)))
    }
}

fn unavailable(e: std::io::Error) -> SinkError {
    SinkError::Unavailable(e.to_string())
}

impl DocumentStore for FileStore {
    fn put(&self, collection: &str, key: &str, document: &Value) -> Result<(), SinkError> {
        let dir = self.collection_dir(collection);
        std::fs::create_dir_all(&dir).map_err(unavailable)?;

        let json = serde_json::to_vec_pretty(document).map_err(|e| SinkError::Serialization(e.to_string()))?;
        let path = self.document_path(collection, key);
        let tmp = path.with_extension("json.tmp");

        std::fs::write(&tmp, json).map_err(unavailable)?;
        std::fs::rename(&tmp, &path).map_err(unavailable)?;
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, SinkError> {
        let path = self.document_path(collection, key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(unavailable)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| SinkError::Serialization(format!("{}: {e}", path.display())))
    }

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, SinkError> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut documents = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(unavailable)? {
            let path = entry.map_err(unavailable)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_key) else {
                continue;
            };
            let content = std::fs::read_to_string(&path).map_err(unavailable)?;
            match serde_json::from_str(&content) {
                Ok(value) => documents.push((key, value)),
                Err(e) => tracing::warn!(path = %path.display(), "Skipping unreadable document: {e}"),
            }
        }
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(documents)
    }
}
