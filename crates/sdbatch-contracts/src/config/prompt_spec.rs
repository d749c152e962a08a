use serde::{Deserialize, Serialize};

use super::candidates::{Candidates, OneOrMany, SeedSpec, Toggle};

/// One `prompts[]` entry of the batch configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptSpec {
    pub prompt: Option<Candidates<String>>,
    pub prompt_style: Option<Candidates<String>>,
    pub prompt_subject: Option<Candidates<String>>,
    pub negative_prompt: Option<Candidates<String>>,
    pub negative_prompt_style: Option<Candidates<String>>,
    pub negative_prompt_subject: Option<Candidates<String>>,
    pub checkpoints: Option<Candidates<CheckpointChoice>>,
    pub vae: Option<Candidates<String>>,
    pub sampler: Option<Candidates<String>>,
    pub scheduler: Option<Candidates<String>>,
    pub width: Option<Candidates<u32>>,
    pub height: Option<Candidates<u32>>,
    pub cfg: Option<Candidates<f64>>,
    pub steps: Option<Candidates<u32>>,
    pub seed: Option<SeedSpec>,
    pub denoising: Option<Candidates<f64>>,
    pub clip_skip: Option<Candidates<u32>>,
    pub restore_faces: Option<Toggle>,
    pub tiling: Option<Toggle>,
    pub enable_high_res: Option<Toggle>,
    pub upscaler: Option<Candidates<String>>,
    pub scale_factor: Option<Candidates<f64>>,
    pub init_image: Option<Candidates<String>>,
    pub filename: Option<Candidates<String>>,
    pub cut_off: Option<Candidates<String>>,
    pub style: Option<Candidates<String>>,
    pub tiled_diffusion: Option<Candidates<TiledDiffusionSpec>>,
    #[serde(rename = "tiledVAE", alias = "tiledVae")]
    pub tiled_vae: Option<Candidates<TiledVaeSpec>>,
    pub ultimate_sd_upscale: Option<Candidates<UltimateSdUpscaleSpec>>,
    pub control_net: Option<OneOrMany<ControlNetLayerSpec>>,
    pub adetailer: Option<OneOrMany<AdetailerLayerSpec>>,
    pub count: Option<u32>,
}

/// A checkpoint authored by name or as an entry with text deltas and a VAE override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointChoice {
    Name(String),
    Entry(CheckpointOption),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOption {
    pub checkpoint: String,
    #[serde(default)]
    pub vae: Option<String>,
    #[serde(default)]
    pub prompt_before: Option<String>,
    #[serde(default)]
    pub prompt_after: Option<String>,
    #[serde(default)]
    pub negative_prompt_before: Option<String>,
    #[serde(default)]
    pub negative_prompt_after: Option<String>,
    #[serde(default)]
    pub filename_before: Option<String>,
    #[serde(default)]
    pub filename_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlNetLayerSpec {
    /// Model name, or an ordered list of fallback names.
    pub model: OneOrMany<String>,
    #[serde(default)]
    pub module: Option<OneOrMany<String>>,
    #[serde(default, alias = "input_image")]
    pub input_image: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub guidance_start: Option<f64>,
    #[serde(default)]
    pub guidance_end: Option<f64>,
    #[serde(default)]
    pub control_mode: Option<String>,
    #[serde(default)]
    pub resize_mode: Option<String>,
    #[serde(default)]
    pub pixel_perfect: Option<bool>,
    #[serde(default)]
    pub processor_res: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiledDiffusionSpec {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub scale_factor: Option<f64>,
    #[serde(default)]
    pub upscaler: Option<String>,
    #[serde(default)]
    pub tile_width: Option<u32>,
    #[serde(default)]
    pub tile_height: Option<u32>,
    #[serde(default)]
    pub tile_overlap: Option<u32>,
    #[serde(default)]
    pub tile_batch_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiledVaeSpec {
    #[serde(default)]
    pub encoder_tile_size: Option<u32>,
    #[serde(default)]
    pub decoder_tile_size: Option<u32>,
    #[serde(default)]
    pub fast_encoder: Option<bool>,
    #[serde(default)]
    pub fast_decoder: Option<bool>,
    #[serde(default)]
    pub color_fix: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UltimateSdUpscaleSpec {
    #[serde(default)]
    pub upscaler: Option<String>,
    #[serde(default)]
    pub scale_factor: Option<f64>,
    #[serde(default)]
    pub tile_width: Option<u32>,
    #[serde(default)]
    pub tile_height: Option<u32>,
    #[serde(default)]
    pub mask_blur: Option<u32>,
    #[serde(default)]
    pub padding: Option<u32>,
    #[serde(default)]
    pub redraw_mode: Option<String>,
    #[serde(default)]
    pub seams_fix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdetailerLayerSpec {
    pub model: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub denoising: Option<f64>,
    #[serde(default)]
    pub mask_blur: Option<u32>,
}
