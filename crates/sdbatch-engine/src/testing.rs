use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use sdbatch_contracts::catalog::Catalog;
use serde_json::json;

use crate::files::{DirEntry, ImageFiles};

/// In-memory filesystem: directories list children in insertion order.
#[derive(Debug, Default)]
pub struct MemoryFiles {
    dirs: BTreeMap<PathBuf, Vec<DirEntry>>,
    images: BTreeMap<PathBuf, (u32, u32)>,
    texts: BTreeMap<PathBuf, String>,
}

impl MemoryFiles {
    pub fn with_image(mut self, path: &str, width: u32, height: u32) -> Self {
        let path = PathBuf::from(path);
        self.register_parent(&path, false);
        self.images.insert(path, (width, height));
        self
    }

    pub fn with_text(mut self, path: &str, text: &str) -> Self {
        let path = PathBuf::from(path);
        self.register_parent(&path, false);
        self.texts.insert(path, text.to_string());
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        let path = PathBuf::from(path);
        self.register_parent(&path, true);
        self.dirs.entry(path).or_default();
        self
    }

    fn register_parent(&mut self, path: &Path, is_dir: bool) {
        let Some(parent) = path.parent() else {
            return;
        };
        let children = self.dirs.entry(parent.to_path_buf()).or_default();
        if !children.iter().any(|entry| entry.path == path) {
            children.push(DirEntry {
                path: path.to_path_buf(),
                is_dir,
            });
        }
    }
}

impl ImageFiles for MemoryFiles {
    fn is_directory(&self, path: &Path) -> bool {
        self.dirs.contains_key(path)
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such directory {}", path.display()))
    }

    fn read_image_size(&self, path: &Path) -> Result<(u32, u32)> {
        self.images
            .get(path)
            .copied()
            .ok_or_else(|| anyhow!("no such image {}", path.display()))
    }

    fn read_base64(&self, path: &Path) -> Result<String> {
        if self.images.contains_key(path) {
            return Ok(format!("b64:{}", path.display()));
        }
        Err(anyhow!("no such image {}", path.display()))
    }

    fn read_text(&self, path: &Path) -> Option<String> {
        self.texts.get(path).cloned()
    }
}

pub fn catalog() -> Catalog {
    Catalog::from_value(json!({
        "checkpoints": [
            {"name": "sd15/realistic.safetensors [aa11]", "hash": "aa11"},
            {"name": "sdxl/turbo.safetensors [bb22]", "hash": "bb22", "accelerator": "turbo"},
            {"name": "sdxl/anime.safetensors [cc33]", "hash": "cc33"}
        ],
        "vaes": ["vae-ft-mse.safetensors", "sdxl_vae.safetensors"],
        "samplers": [
            {"name": "Euler a", "aliases": ["k_euler_a"]},
            {"name": "DPM++ 2M", "aliases": ["k_dpmpp_2m"]},
            {"name": "LCM"}
        ],
        "upscalers": [
            {"name": "None", "index": 0},
            {"name": "Lanczos", "index": 1},
            {"name": "4x-UltraSharp", "filename": "/models/ESRGAN/4x-UltraSharp.pth", "index": 5}
        ],
        "styles": [
            {"name": "noir", "prompt": "film noir, {prompt}", "negativePrompt": "color"},
            {"name": "vivid", "prompt": "vivid colors"}
        ],
        "controlnetModels": ["control_v11p_sd15_openpose [cab727d4]", "control_v11p_sd15_canny [d14c016b]"],
        "controlnetModules": ["openpose", "openpose_full", "canny", "lineart", "lineart_coarse"],
        "adetailerModels": ["face_yolov8n.pt", "hand_yolov8n.pt"],
        "loras": [{"name": "detail_tweaker", "alias": "add_detail"}]
    }))
    .unwrap_or_default()
}
