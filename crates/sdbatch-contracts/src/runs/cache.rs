use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub mtime_ms: u64,
    pub width: u32,
    pub height: u32,
}

/// Path-keyed image metadata, invalidated by modification time.
///
/// Writes merge only the keys this instance touched into the file on disk, so
/// concurrent runs sharing a cache file settle on last-writer-wins per key.
#[derive(Debug, Clone)]
pub struct ImageMetaCache {
    path: Option<PathBuf>,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl ImageMetaCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            payload: Some(Map::new()),
            dirty_keys: Vec::new(),
        }
    }

    /// Cached metadata for `image`, or `None` when missing or stale.
    pub fn get(&mut self, image: &Path, mtime_ms: u64) -> Option<ImageMeta> {
        let key = cache_key(image);
        let payload = self.ensure_loaded();
        let meta: ImageMeta = serde_json::from_value(payload.get(&key)?.clone()).ok()?;
        if meta.mtime_ms != mtime_ms {
            return None;
        }
        Some(meta)
    }

    pub fn set(&mut self, image: &Path, meta: ImageMeta) -> anyhow::Result<()> {
        let key = cache_key(image);
        let snapshot = serde_json::to_value(meta)?;
        let payload = self.ensure_loaded();
        if payload.get(&key) == Some(&snapshot) {
            return Ok(());
        }
        payload.insert(key.clone(), snapshot);
        if !self.dirty_keys.contains(&key) {
            self.dirty_keys.push(key);
        }
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        let Some(path) = self.path.clone() else {
            self.dirty_keys.clear();
            return Ok(());
        };
        if self.payload.is_none() || self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self) -> &mut Map<String, Value> {
        if self.payload.is_none() {
            let loaded = self
                .path
                .as_deref()
                .and_then(read_json_object)
                .unwrap_or_default();
            self.payload = Some(loaded);
        }
        self.payload.get_or_insert_with(Map::new)
    }
}

fn cache_key(image: &Path) -> String {
    image.to_string_lossy().to_string()
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
