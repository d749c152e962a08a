use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sdbatch_contracts::runs::cache::{ImageMeta, ImageMetaCache};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Filesystem access the engine needs for image fields.
pub trait ImageFiles {
    fn is_directory(&self, path: &Path) -> bool;

    /// Direct children of `path` as absolute paths, in enumeration order.
    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>>;

    fn read_image_size(&self, path: &Path) -> Result<(u32, u32)>;

    fn read_base64(&self, path: &Path) -> Result<String>;

    fn read_text(&self, path: &Path) -> Option<String>;
}

pub struct LocalFiles {
    cache: Mutex<ImageMetaCache>,
}

impl LocalFiles {
    pub fn new(cache: ImageMetaCache) -> Self {
        Self {
            cache: Mutex::new(cache),
        }
    }

    pub fn uncached() -> Self {
        Self::new(ImageMetaCache::in_memory())
    }
}

impl ImageFiles for LocalFiles {
    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let root = std::path::absolute(path)
            .with_context(|| format!("failed resolving {}", path.display()))?;
        let mut entries = Vec::new();
        for entry in
            fs::read_dir(&root).with_context(|| format!("failed listing {}", root.display()))?
        {
            let entry = entry?;
            let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
            entries.push(DirEntry {
                path: entry.path(),
                is_dir,
            });
        }
        Ok(entries)
    }

    fn read_image_size(&self, path: &Path) -> Result<(u32, u32)> {
        let mtime_ms = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis() as u64)
            .unwrap_or(0);
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("image cache lock poisoned"))?;
        if let Some(meta) = cache.get(path, mtime_ms) {
            return Ok((meta.width, meta.height));
        }
        let (width, height) = image::image_dimensions(path)
            .with_context(|| format!("failed reading image size of {}", path.display()))?;
        cache.set(
            path,
            ImageMeta {
                mtime_ms,
                width,
                height,
            },
        )?;
        Ok((width, height))
    }

    fn read_base64(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        Ok(BASE64.encode(bytes))
    }

    fn read_text(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::{ImageFiles, LocalFiles};

    #[test]
    fn local_files_reads_dimensions_and_lists_children() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image_path = temp.path().join("pose.png");
        RgbImage::from_pixel(24, 16, Rgb([1, 2, 3])).save(&image_path)?;
        std::fs::create_dir(temp.path().join("nested"))?;

        let files = LocalFiles::uncached();
        assert_eq!(files.read_image_size(&image_path)?, (24, 16));
        assert_eq!(files.read_image_size(&image_path)?, (24, 16));
        assert!(files.is_directory(temp.path()));
        assert!(!files.read_base64(&image_path)?.is_empty());

        let mut entries = files.list_directory(temp.path())?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert!(entries[0].path.is_absolute());
        assert!(!entries[1].is_dir);
        Ok(())
    }
}
