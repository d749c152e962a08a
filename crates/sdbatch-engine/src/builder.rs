//! Turns one selection into fully scalar drafts.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use sdbatch_contracts::catalog::CatalogKind;
use sdbatch_contracts::config::{CheckpointChoice, CheckpointOption, PromptSpec};
use sdbatch_contracts::errors::{CodedError, FatalKind};
use serde_json::json;

use crate::context::RunContext;
use crate::draft::{ControlNetUnit, ResolvedDraft, UpscaleScript};
use crate::expand::Selection;

const PROMPT_TOKEN: &str = "{prompt}";
const DEFAULT_UPSCALE_SIZE: u32 = 512;
const DEFAULT_UPSCALE_FACTOR: f64 = 2.0;

/// Builds the `count` drafts of one selection.
pub fn build_drafts(
    ctx: &mut RunContext<'_>,
    spec: &PromptSpec,
    selection: Selection,
) -> Result<Vec<ResolvedDraft>> {
    let catalog = ctx.catalog;
    let mut draft = ResolvedDraft {
        scheduler: non_empty(selection.scheduler.clone()),
        width: selection.width,
        height: selection.height,
        cfg: selection.cfg,
        steps: selection.steps,
        seed: selection.seed,
        denoising: selection.denoising,
        clip_skip: selection.clip_skip,
        restore_faces: selection.restore_faces,
        tiling: selection.tiling,
        enable_high_res: selection.enable_high_res,
        scale_factor: selection.scale_factor,
        init_image: non_empty(selection.init_image.clone()),
        filename: non_empty(selection.filename.clone()),
        cut_off: non_empty(selection.cut_off.clone()),
        tiled_vae: selection.tiled_vae.clone(),
        ..ResolvedDraft::default()
    };
    merge_prompts(&mut draft, &selection);

    let (checkpoint, option) = match selection.checkpoint.clone() {
        None => (None, None),
        Some(CheckpointChoice::Name(name)) => (non_empty(Some(name)), None),
        Some(CheckpointChoice::Entry(entry)) => {
            (non_empty(Some(entry.checkpoint.clone())), Some(entry))
        }
    };
    if let Some(name) = checkpoint {
        draft.checkpoint = Some(ctx.require(CatalogKind::Checkpoint, &[name])?);
    }

    let vae = option
        .as_ref()
        .and_then(|entry| entry.vae.clone())
        .or_else(|| selection.vae.clone());
    draft.vae = match non_empty(vae) {
        Some(name) if is_passthrough_vae(&name) => Some(name),
        Some(name) => ctx.optional(CatalogKind::Vae, &name)?,
        None => None,
    };

    draft.sampler = match non_empty(selection.sampler.clone()) {
        Some(name) => Some(ctx.require(CatalogKind::Sampler, &[name])?),
        None => None,
    };
    if let Some(entry) = draft.checkpoint.as_deref().and_then(|name| catalog.checkpoint(name)) {
        if let Some(required) = entry.required_sampler() {
            match draft.sampler.as_deref() {
                None => {
                    draft.sampler = Some(
                        catalog
                            .lookup(CatalogKind::Sampler, &[required])
                            .unwrap_or_else(|| required.to_string()),
                    );
                }
                Some(chosen) if !chosen.eq_ignore_ascii_case(required) => {
                    let error = CodedError::new(
                        FatalKind::SamplerMismatch,
                        format!(
                            "checkpoint '{}' requires sampler '{}', got '{}'",
                            entry.name, required, chosen
                        ),
                    )
                    .with_details(json!({
                        "checkpoint": entry.name,
                        "required": required,
                        "sampler": chosen,
                    }));
                    return Err(error.into());
                }
                Some(_) => {}
            }
        }
    }

    if let Some(name) = non_empty(selection.upscaler.clone()) {
        draft.upscaler = Some(ctx.require(CatalogKind::Upscaler, &[name])?);
    }

    if let Some(name) = non_empty(selection.style.clone()) {
        let name = ctx.require(CatalogKind::Style, &[name])?;
        if let Some(style) = catalog.style(&name) {
            if let Some(template) = style.prompt.as_deref() {
                draft.prompt = apply_template(&draft.prompt, template);
            }
            if let Some(template) = style.negative_prompt.as_deref() {
                let base = draft.negative_prompt.clone().unwrap_or_default();
                draft.negative_prompt = Some(apply_template(&base, template));
            }
        }
        draft.style = Some(name);
    }

    if let Some(entry) = option.as_ref() {
        apply_checkpoint_deltas(&mut draft, entry);
    }

    for image in &selection.control_net {
        let layer = &image.layer;
        let model = ctx.require(CatalogKind::ControlNetModel, &layer.model.to_vec())?;
        let module = match layer.module.as_ref().map(|names| names.to_vec()) {
            None => None,
            Some(names) if names.iter().all(|name| name.eq_ignore_ascii_case("none")) => {
                Some("none".to_string())
            }
            Some(names) => Some(ctx.require(CatalogKind::ControlNetModule, &names)?),
        };
        if let Some(fragment) = image.prompt.as_deref() {
            draft.prompt = apply_template(&draft.prompt, fragment);
        }
        draft.control_net.push(ControlNetUnit {
            model,
            module,
            input_image: image.input_image.clone(),
            image_name: image.image_name.clone(),
            weight: layer.weight,
            guidance_start: layer.guidance_start,
            guidance_end: layer.guidance_end,
            control_mode: layer.control_mode.clone(),
            resize_mode: layer.resize_mode.clone(),
            pixel_perfect: layer.pixel_perfect,
            processor_res: layer.processor_res,
        });
    }
    draft.pose = selection
        .control_net
        .first()
        .and_then(|image| image.image_name.clone());

    draft.prompt = strip_prompt_token(&draft.prompt);
    draft.negative_prompt = draft.negative_prompt.as_deref().map(strip_prompt_token);
    draft.prompt = resolve_loras(ctx, &draft.prompt)?;
    if let Some(negative) = draft.negative_prompt.clone() {
        draft.negative_prompt = Some(resolve_loras(ctx, &negative)?);
    }

    infer_size(ctx, &mut draft)?;

    if let Some(mut tiled) = selection.tiled_diffusion.clone() {
        let scale = tiled.scale_factor.or(draft.scale_factor).unwrap_or(1.0);
        draft.width = draft.width.map(|value| scaled(value, scale));
        draft.height = draft.height.map(|value| scaled(value, scale));
        draft.scale_factor = None;
        tiled.scale_factor = None;
        if let Some(name) = non_empty(tiled.upscaler.take()) {
            tiled.upscaler = Some(ctx.require(CatalogKind::Upscaler, &[name])?);
        }
        draft.tiled_diffusion = Some(tiled);
    }

    if let Some(upscale) = selection.ultimate_sd_upscale.clone() {
        let scale = upscale.scale_factor.unwrap_or(DEFAULT_UPSCALE_FACTOR);
        let upscaler = match non_empty(upscale.upscaler) {
            Some(name) => Some(ctx.require(CatalogKind::Upscaler, &[name])?),
            None => None,
        };
        let upscaler_index = upscaler
            .as_deref()
            .and_then(|name| catalog.upscaler(name))
            .and_then(|entry| entry.index);
        draft.ultimate_sd_upscale = Some(UpscaleScript {
            upscaler,
            upscaler_index,
            scale_factor: scale,
            target_width: scaled(draft.width.unwrap_or(DEFAULT_UPSCALE_SIZE), scale),
            target_height: scaled(draft.height.unwrap_or(DEFAULT_UPSCALE_SIZE), scale),
            tile_width: upscale.tile_width,
            tile_height: upscale.tile_height,
            mask_blur: upscale.mask_blur,
            padding: upscale.padding,
            redraw_mode: upscale.redraw_mode,
            seams_fix: upscale.seams_fix,
        });
    }

    for layer in spec
        .adetailer
        .as_ref()
        .map(|layers| layers.to_vec())
        .unwrap_or_default()
    {
        let mut layer = layer;
        layer.model = ctx.require(CatalogKind::AdetailerModel, &[layer.model.as_str()])?;
        draft.adetailer.push(layer);
    }

    let count = spec.count.unwrap_or(1).max(1);
    Ok((0..count)
        .map(|iteration| {
            let mut copy = draft.clone();
            copy.iteration = iteration;
            if let Some(seed) = copy.seed.filter(|seed| *seed != -1) {
                copy.seed = Some(seed.saturating_add(i64::from(iteration)));
            }
            copy
        })
        .collect())
}

/// Style/subject merge. Only a complete pair replaces the plain prompt.
fn merge_prompts(draft: &mut ResolvedDraft, selection: &Selection) {
    let style = non_empty(selection.prompt_style.clone());
    let subject = non_empty(selection.prompt_subject.clone());
    draft.upscale_prompt = subject.as_deref().map(strip_prompt_token);
    let positive_merge = style.is_some() && subject.is_some();
    draft.prompt = if positive_merge {
        merge_style_subject(style, subject).unwrap_or_default()
    } else {
        non_empty(selection.prompt.clone())
            .or(style)
            .or(subject)
            .unwrap_or_default()
    };

    let negative_style = non_empty(selection.negative_prompt_style.clone());
    let negative_subject = non_empty(selection.negative_prompt_subject.clone());
    draft.negative_prompt = if negative_style.is_some() && negative_subject.is_some() {
        merge_style_subject(negative_style, negative_subject)
    } else {
        let plain = if positive_merge {
            None
        } else {
            non_empty(selection.negative_prompt.clone())
        };
        plain.or(negative_style).or(negative_subject)
    };
}

/// Leftover `{prompt}` tokens survive until the draft is complete.
pub fn merge_style_subject(style: Option<String>, subject: Option<String>) -> Option<String> {
    match (style, subject) {
        (Some(style), Some(subject)) => Some(if style.contains(PROMPT_TOKEN) {
            style.replace(PROMPT_TOKEN, &subject)
        } else if subject.contains(PROMPT_TOKEN) {
            subject.replace(PROMPT_TOKEN, &style)
        } else {
            format!("{subject} BREAK {style}")
        }),
        (Some(one), None) | (None, Some(one)) => Some(one),
        (None, None) => None,
    }
}

/// `{prompt}` in `template` takes `base`; otherwise `template` is appended.
fn apply_template(base: &str, template: &str) -> String {
    if template.contains(PROMPT_TOKEN) {
        return template.replace(PROMPT_TOKEN, base);
    }
    if base.contains(PROMPT_TOKEN) {
        return base.replace(PROMPT_TOKEN, template);
    }
    join_comma(base, template)
}

fn apply_checkpoint_deltas(draft: &mut ResolvedDraft, entry: &CheckpointOption) {
    if let Some(before) = entry.prompt_before.as_deref() {
        draft.prompt = join_comma(before, &draft.prompt);
    }
    if let Some(after) = entry.prompt_after.as_deref() {
        draft.prompt = join_comma(&draft.prompt, after);
    }
    if let Some(before) = entry.negative_prompt_before.as_deref() {
        let current = draft.negative_prompt.clone().unwrap_or_default();
        draft.negative_prompt = Some(join_comma(before, &current));
    }
    if let Some(after) = entry.negative_prompt_after.as_deref() {
        let current = draft.negative_prompt.clone().unwrap_or_default();
        draft.negative_prompt = Some(join_comma(&current, after));
    }
    if let Some(before) = entry.filename_before.as_deref() {
        let current = draft.filename.clone().unwrap_or_default();
        draft.filename = Some(join_comma(before, &current));
    }
    if let Some(after) = entry.filename_after.as_deref() {
        let current = draft.filename.clone().unwrap_or_default();
        draft.filename = Some(join_comma(&current, after));
    }
}

pub(crate) fn join_comma(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{head}, {tail}"),
    }
}

fn strip_prompt_token(text: &str) -> String {
    text.replace(PROMPT_TOKEN, "")
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

fn lora_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<lora:([^:>]+)((?::[^>]*)?)>").expect("lora regex should compile")
    })
}

fn resolve_loras(ctx: &mut RunContext<'_>, text: &str) -> Result<String> {
    let catalog = ctx.catalog;
    let mut misses: Vec<String> = Vec::new();
    let rewritten = lora_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).map(|value| value.as_str()).unwrap_or_default();
            let weight = caps.get(2).map(|value| value.as_str()).unwrap_or_default();
            match catalog.lookup(CatalogKind::Lora, &[name]) {
                Some(found) => format!("<lora:{found}{weight}>"),
                None => {
                    misses.push(name.to_string());
                    caps.get(0)
                        .map(|value| value.as_str().to_string())
                        .unwrap_or_default()
                }
            }
        })
        .to_string();
    for miss in misses {
        ctx.notice(format!("lora '{miss}' not found in catalog"))?;
    }
    Ok(rewritten)
}

/// Fills unset dimensions from the init image, else the first ControlNet image.
fn infer_size(ctx: &RunContext<'_>, draft: &mut ResolvedDraft) -> Result<()> {
    if draft.width.is_some() && draft.height.is_some() {
        return Ok(());
    }
    let source = draft.source_image().map(str::to_string).or_else(|| {
        draft
            .control_net
            .iter()
            .find_map(|unit| unit.input_image.clone())
    });
    let Some(source) = source else {
        return Ok(());
    };
    let (width, height) = ctx.files.read_image_size(Path::new(&source))?;
    draft.width.get_or_insert(width);
    draft.height.get_or_insert(height);
    Ok(())
}

fn scaled(value: u32, scale: f64) -> u32 {
    (f64::from(value) * scale).round() as u32
}

fn is_passthrough_vae(name: &str) -> bool {
    name.eq_ignore_ascii_case("automatic") || name.eq_ignore_ascii_case("none")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
