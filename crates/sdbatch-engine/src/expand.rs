use std::collections::BTreeMap;

use anyhow::Result;
use rand::Rng;
use sdbatch_contracts::config::{
    CheckpointChoice, PromptSpec, TiledDiffusionSpec, TiledVaeSpec, UltimateSdUpscaleSpec,
};

use crate::controlnet::{resolve_stacks, ControlNetStack};
use crate::draft::ResolvedDraft;
use crate::files::ImageFiles;
use crate::normalize::{images, optional, seeds, toggle};

/// Normalized candidate arrays of one prompt entry, one per expansion axis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldCandidates {
    pub prompt: Vec<Option<String>>,
    pub prompt_style: Vec<Option<String>>,
    pub prompt_subject: Vec<Option<String>>,
    pub negative_prompt: Vec<Option<String>>,
    pub negative_prompt_style: Vec<Option<String>>,
    pub negative_prompt_subject: Vec<Option<String>>,
    pub checkpoints: Vec<Option<CheckpointChoice>>,
    pub vae: Vec<Option<String>>,
    pub sampler: Vec<Option<String>>,
    pub scheduler: Vec<Option<String>>,
    pub width: Vec<Option<u32>>,
    pub height: Vec<Option<u32>>,
    pub cfg: Vec<Option<f64>>,
    pub steps: Vec<Option<u32>>,
    pub seed: Vec<Option<i64>>,
    pub denoising: Vec<Option<f64>>,
    pub clip_skip: Vec<Option<u32>>,
    pub restore_faces: Vec<bool>,
    pub tiling: Vec<bool>,
    pub enable_high_res: Vec<bool>,
    pub upscaler: Vec<Option<String>>,
    pub scale_factor: Vec<Option<f64>>,
    pub init_image: Vec<Option<String>>,
    pub filename: Vec<Option<String>>,
    pub cut_off: Vec<Option<String>>,
    pub style: Vec<Option<String>>,
    pub tiled_diffusion: Vec<Option<TiledDiffusionSpec>>,
    pub tiled_vae: Vec<Option<TiledVaeSpec>>,
    pub ultimate_sd_upscale: Vec<Option<UltimateSdUpscaleSpec>>,
    pub control_net: Vec<ControlNetStack>,
    /// Problems found while normalizing, for the run's notice list.
    pub notices: Vec<String>,
}

/// One pick per axis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    pub prompt: Option<String>,
    pub prompt_style: Option<String>,
    pub prompt_subject: Option<String>,
    pub negative_prompt: Option<String>,
    pub negative_prompt_style: Option<String>,
    pub negative_prompt_subject: Option<String>,
    pub checkpoint: Option<CheckpointChoice>,
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
    pub filename: Option<String>,
    pub cut_off: Option<String>,
    pub style: Option<String>,
    pub tiled_diffusion: Option<TiledDiffusionSpec>,
    pub tiled_vae: Option<TiledVaeSpec>,
    pub ultimate_sd_upscale: Option<UltimateSdUpscaleSpec>,
    pub control_net: ControlNetStack,
}

impl FieldCandidates {
    pub fn from_spec(spec: &PromptSpec, files: &dyn ImageFiles) -> Result<Self> {
        let layers = spec
            .control_net
            .as_ref()
            .map(|layers| layers.to_vec())
            .unwrap_or_default();
        let mut notices = Vec::new();
        let init_image = images(files, spec.init_image.as_ref(), &mut notices)?;
        Ok(Self {
            prompt: optional(spec.prompt.as_ref()),
            prompt_style: optional(spec.prompt_style.as_ref()),
            prompt_subject: optional(spec.prompt_subject.as_ref()),
            negative_prompt: optional(spec.negative_prompt.as_ref()),
            negative_prompt_style: optional(spec.negative_prompt_style.as_ref()),
            negative_prompt_subject: optional(spec.negative_prompt_subject.as_ref()),
            checkpoints: optional(spec.checkpoints.as_ref()),
            vae: optional(spec.vae.as_ref()),
            sampler: optional(spec.sampler.as_ref()),
            scheduler: optional(spec.scheduler.as_ref()),
            width: optional(spec.width.as_ref()),
            height: optional(spec.height.as_ref()),
            cfg: optional(spec.cfg.as_ref()),
            steps: optional(spec.steps.as_ref()),
            seed: seeds(spec.seed.as_ref()),
            denoising: optional(spec.denoising.as_ref()),
            clip_skip: optional(spec.clip_skip.as_ref()),
            restore_faces: toggle(spec.restore_faces),
            tiling: toggle(spec.tiling),
            enable_high_res: toggle(spec.enable_high_res),
            upscaler: optional(spec.upscaler.as_ref()),
            scale_factor: optional(spec.scale_factor.as_ref()),
            init_image,
            filename: optional(spec.filename.as_ref()),
            cut_off: optional(spec.cut_off.as_ref()),
            style: optional(spec.style.as_ref()),
            tiled_diffusion: optional(spec.tiled_diffusion.as_ref()),
            tiled_vae: optional(spec.tiled_vae.as_ref()),
            ultimate_sd_upscale: optional(spec.ultimate_sd_upscale.as_ref()),
            control_net: resolve_stacks(files, &layers)?,
            notices,
        })
    }

    /// Axis lengths in expansion order; the last axis varies fastest.
    pub fn lengths(&self) -> Vec<usize> {
        vec![
            self.prompt.len(),
            self.prompt_style.len(),
            self.prompt_subject.len(),
            self.negative_prompt.len(),
            self.negative_prompt_style.len(),
            self.negative_prompt_subject.len(),
            self.checkpoints.len(),
            self.vae.len(),
            self.sampler.len(),
            self.scheduler.len(),
            self.width.len(),
            self.height.len(),
            self.cfg.len(),
            self.steps.len(),
            self.seed.len(),
            self.denoising.len(),
            self.clip_skip.len(),
            self.restore_faces.len(),
            self.tiling.len(),
            self.enable_high_res.len(),
            self.upscaler.len(),
            self.scale_factor.len(),
            self.init_image.len(),
            self.filename.len(),
            self.cut_off.len(),
            self.style.len(),
            self.tiled_diffusion.len(),
            self.tiled_vae.len(),
            self.ultimate_sd_upscale.len(),
            self.control_net.len(),
        ]
    }

    pub fn combinations(&self) -> usize {
        self.lengths().iter().product()
    }

    /// Picks one candidate per axis; `index` follows [`FieldCandidates::lengths`].
    pub fn select(&self, index: &[usize]) -> Selection {
        Selection {
            prompt: self.prompt[index[0]].clone(),
            prompt_style: self.prompt_style[index[1]].clone(),
            prompt_subject: self.prompt_subject[index[2]].clone(),
            negative_prompt: self.negative_prompt[index[3]].clone(),
            negative_prompt_style: self.negative_prompt_style[index[4]].clone(),
            negative_prompt_subject: self.negative_prompt_subject[index[5]].clone(),
            checkpoint: self.checkpoints[index[6]].clone(),
            vae: self.vae[index[7]].clone(),
            sampler: self.sampler[index[8]].clone(),
            scheduler: self.scheduler[index[9]].clone(),
            width: self.width[index[10]],
            height: self.height[index[11]],
            cfg: self.cfg[index[12]],
            steps: self.steps[index[13]],
            seed: self.seed[index[14]],
            denoising: self.denoising[index[15]],
            clip_skip: self.clip_skip[index[16]],
            restore_faces: self.restore_faces[index[17]],
            tiling: self.tiling[index[18]],
            enable_high_res: self.enable_high_res[index[19]],
            upscaler: self.upscaler[index[20]].clone(),
            scale_factor: self.scale_factor[index[21]],
            init_image: self.init_image[index[22]].clone(),
            filename: self.filename[index[23]].clone(),
            cut_off: self.cut_off[index[24]].clone(),
            style: self.style[index[25]].clone(),
            tiled_diffusion: self.tiled_diffusion[index[26]].clone(),
            tiled_vae: self.tiled_vae[index[27]].clone(),
            ultimate_sd_upscale: self.ultimate_sd_upscale[index[28]].clone(),
            control_net: self.control_net[index[29]].clone(),
        }
    }
}

/// Every selection of the full cross-product, in odometer order.
pub fn cartesian(fields: &FieldCandidates) -> Vec<Selection> {
    let lengths = fields.lengths();
    if lengths.iter().any(|len| *len == 0) {
        return Vec::new();
    }
    let mut index = vec![0usize; lengths.len()];
    let mut out = Vec::with_capacity(fields.combinations());
    loop {
        out.push(fields.select(&index));
        let mut axis = lengths.len();
        loop {
            if axis == 0 {
                return out;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < lengths[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

/// One uniform pick per axis. `None` when an axis has no candidates.
pub fn sample<R: Rng + ?Sized>(fields: &FieldCandidates, rng: &mut R) -> Option<Selection> {
    let lengths = fields.lengths();
    if lengths.iter().any(|len| *len == 0) {
        return None;
    }
    let index: Vec<usize> = lengths.iter().map(|len| rng.gen_range(0..*len)).collect();
    Some(fields.select(&index))
}

/// Drafts keyed by [`ResolvedDraft::sort_key`]: duplicates collapse, output is sorted.
#[derive(Debug, Default)]
pub struct DraftSet {
    drafts: BTreeMap<String, ResolvedDraft>,
}

impl DraftSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an identical draft was already present.
    pub fn insert(&mut self, draft: ResolvedDraft) -> bool {
        let key = draft.sort_key();
        if self.drafts.contains_key(&key) {
            return false;
        }
        self.drafts.insert(key, draft);
        true
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn into_sorted(self) -> Vec<ResolvedDraft> {
        self.drafts.into_values().collect()
    }
}
