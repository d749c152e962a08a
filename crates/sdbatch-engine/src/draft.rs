use sdbatch_contracts::config::{AdetailerLayerSpec, TiledDiffusionSpec, TiledVaeSpec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A fully scalar request: one value per field, ready for a backend query.
///
/// Serialized field names are the names overlays address in `overwrite`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResolvedDraft {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Subject text with style tokens stripped, used as the high-res pass prompt.
    pub upscale_prompt: Option<String>,
    #[serde(alias = "checkpoints")]
    pub checkpoint: Option<String>,
    pub vae: Option<String>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub cfg: Option<f64>,
    pub steps: Option<u32>,
    pub seed: Option<i64>,
    pub denoising: Option<f64>,
    pub clip_skip: Option<u32>,
    pub restore_faces: bool,
    pub tiling: bool,
    pub enable_high_res: bool,
    pub upscaler: Option<String>,
    pub scale_factor: Option<f64>,
    pub init_image: Option<String>,
    /// Filename pattern, tokens still unrendered.
    pub filename: Option<String>,
    pub cut_off: Option<String>,
    pub style: Option<String>,
    /// `image_name` of the first ControlNet layer.
    pub pose: Option<String>,
    pub control_net: Vec<ControlNetUnit>,
    pub adetailer: Vec<AdetailerLayerSpec>,
    pub tiled_diffusion: Option<TiledDiffusionSpec>,
    #[serde(alias = "tiledVAE")]
    pub tiled_vae: Option<TiledVaeSpec>,
    pub ultimate_sd_upscale: Option<UpscaleScript>,
    pub overlay: Option<String>,
    #[serde(skip)]
    pub iteration: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlNetUnit {
    pub model: String,
    pub module: Option<String>,
    pub input_image: Option<String>,
    pub image_name: Option<String>,
    pub weight: Option<f64>,
    pub guidance_start: Option<f64>,
    pub guidance_end: Option<f64>,
    pub control_mode: Option<String>,
    pub resize_mode: Option<String>,
    pub pixel_perfect: Option<bool>,
    pub processor_res: Option<u32>,
}

/// Ultimate SD upscale settings with the target geometry worked out.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleScript {
    pub upscaler: Option<String>,
    pub upscaler_index: Option<u32>,
    pub scale_factor: f64,
    pub target_width: u32,
    pub target_height: u32,
    pub tile_width: Option<u32>,
    pub tile_height: Option<u32>,
    pub mask_blur: Option<u32>,
    pub padding: Option<u32>,
    pub redraw_mode: Option<String>,
    pub seams_fix: Option<String>,
}

impl ResolvedDraft {
    /// Dedup and ordering key.
    pub fn sort_key(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_default();
        format!(
            "{}{}{}{}{}",
            self.checkpoint.as_deref().unwrap_or_default(),
            self.vae.as_deref().unwrap_or_default(),
            self.upscaler.as_deref().unwrap_or_default(),
            body,
            self.iteration
        )
    }

    pub fn short_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sort_key().as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..4])
    }

    /// The image that drives img2img, if any.
    pub fn source_image(&self) -> Option<&str> {
        self.init_image.as_deref().filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::ResolvedDraft;

    #[test]
    fn sort_key_separates_iterations() {
        let first = ResolvedDraft {
            prompt: "boat".to_string(),
            checkpoint: Some("a.safetensors".to_string()),
            ..ResolvedDraft::default()
        };
        let mut second = first.clone();
        second.iteration = 1;

        assert_ne!(first.sort_key(), second.sort_key());
        assert!(first.sort_key().starts_with("a.safetensors{"));
        assert_eq!(first.short_id().len(), 8);
        assert_eq!(first.short_id(), first.clone().short_id());
    }

    #[test]
    fn serialized_names_are_camel_case_without_iteration() -> anyhow::Result<()> {
        let draft = ResolvedDraft {
            clip_skip: Some(2),
            iteration: 3,
            ..ResolvedDraft::default()
        };
        let value = serde_json::to_value(&draft)?;
        assert_eq!(value["clipSkip"], serde_json::json!(2));
        assert!(value.get("iteration").is_none());
        assert!(value.get("enableHighRes").is_some());
        Ok(())
    }
}
