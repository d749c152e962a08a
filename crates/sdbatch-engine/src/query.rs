//! Draft to AUTOMATIC1111 payload.

use std::path::Path;

use anyhow::{Context, Result};
use sdbatch_contracts::runs::query::BackendQuery;
use serde_json::{json, Map, Value};

use crate::context::RunContext;
use crate::draft::{ResolvedDraft, UpscaleScript};
use crate::pattern::{render, TokenMode};

const USDU_SCRIPT: &str = "ultimate sd upscale";

/// Builds the backend query for `draft`, validating its filename pattern.
pub fn build_query(ctx: &mut RunContext<'_>, draft: &ResolvedDraft) -> Result<BackendQuery> {
    let mut payload = Map::new();
    payload.insert("prompt".to_string(), json!(draft.prompt));
    insert_opt(&mut payload, "negative_prompt", draft.negative_prompt.as_ref());
    payload.insert("seed".to_string(), json!(draft.seed.unwrap_or(-1)));
    insert_opt(&mut payload, "steps", draft.steps);
    insert_opt(&mut payload, "cfg_scale", draft.cfg);
    insert_opt(&mut payload, "width", draft.width);
    insert_opt(&mut payload, "height", draft.height);
    insert_opt(&mut payload, "sampler_name", draft.sampler.as_ref());
    insert_opt(&mut payload, "scheduler", draft.scheduler.as_ref());
    insert_opt(&mut payload, "denoising_strength", draft.denoising);
    payload.insert("restore_faces".to_string(), json!(draft.restore_faces));
    payload.insert("tiling".to_string(), json!(draft.tiling));
    payload.insert("save_images".to_string(), json!(true));

    let init_image = match draft.source_image() {
        Some(path) => Some(
            ctx.files
                .read_base64(Path::new(path))
                .with_context(|| format!("failed encoding init image {path}"))?,
        ),
        None => None,
    };

    if init_image.is_none() && draft.enable_high_res {
        payload.insert("enable_hr".to_string(), json!(true));
        insert_opt(&mut payload, "hr_upscaler", draft.upscaler.as_ref());
        insert_opt(&mut payload, "hr_scale", draft.scale_factor);
        insert_opt(&mut payload, "hr_prompt", draft.upscale_prompt.as_ref());
    }

    let mut overrides = Map::new();
    insert_opt(&mut overrides, "sd_model_checkpoint", draft.checkpoint.as_ref());
    insert_opt(&mut overrides, "sd_vae", draft.vae.as_ref());
    insert_opt(&mut overrides, "CLIP_stop_at_last_layers", draft.clip_skip);
    if let Some(pattern) = draft.filename.as_deref() {
        let rendered = render(pattern, draft, TokenMode::Backend)?;
        overrides.insert("samples_filename_pattern".to_string(), json!(rendered));
    }
    if !overrides.is_empty() {
        payload.insert("override_settings".to_string(), Value::Object(overrides));
        payload.insert(
            "override_settings_restore_afterwards".to_string(),
            json!(false),
        );
    }

    let scripts = alwayson_scripts(ctx, draft)?;
    if !scripts.is_empty() {
        payload.insert("alwayson_scripts".to_string(), Value::Object(scripts));
    }

    if let Some(image) = init_image {
        payload.insert("init_images".to_string(), json!([image]));
        if let Some(upscale) = draft.ultimate_sd_upscale.as_ref() {
            payload.insert("script_name".to_string(), json!(USDU_SCRIPT));
            payload.insert("script_args".to_string(), usdu_args(upscale));
        }
    } else if draft.ultimate_sd_upscale.is_some() {
        ctx.notice(format!(
            "draft {}: ultimate sd upscale needs an init image, skipped",
            draft.short_id()
        ))?;
    }

    Ok(BackendQuery::new(draft.short_id(), payload))
}

fn alwayson_scripts(ctx: &RunContext<'_>, draft: &ResolvedDraft) -> Result<Map<String, Value>> {
    let mut scripts = Map::new();

    if !draft.control_net.is_empty() {
        let mut units = Vec::new();
        for unit in &draft.control_net {
            let mut args = Map::new();
            args.insert("enabled".to_string(), json!(true));
            args.insert("model".to_string(), json!(unit.model));
            args.insert(
                "module".to_string(),
                json!(unit.module.as_deref().unwrap_or("none")),
            );
            if let Some(path) = unit.input_image.as_deref() {
                let image = ctx
                    .files
                    .read_base64(Path::new(path))
                    .with_context(|| format!("failed encoding control image {path}"))?;
                args.insert("image".to_string(), json!(image));
            }
            args.insert("weight".to_string(), json!(unit.weight.unwrap_or(1.0)));
            args.insert(
                "guidance_start".to_string(),
                json!(unit.guidance_start.unwrap_or(0.0)),
            );
            args.insert(
                "guidance_end".to_string(),
                json!(unit.guidance_end.unwrap_or(1.0)),
            );
            args.insert(
                "control_mode".to_string(),
                json!(unit.control_mode.as_deref().unwrap_or("Balanced")),
            );
            args.insert(
                "resize_mode".to_string(),
                json!(unit.resize_mode.as_deref().unwrap_or("Crop and Resize")),
            );
            args.insert(
                "pixel_perfect".to_string(),
                json!(unit.pixel_perfect.unwrap_or(false)),
            );
            insert_opt(&mut args, "processor_res", unit.processor_res);
            units.push(Value::Object(args));
        }
        scripts.insert("ControlNet".to_string(), json!({ "args": units }));
    }

    if !draft.adetailer.is_empty() {
        let mut args = vec![json!(true), json!(false)];
        for layer in &draft.adetailer {
            let mut pass = Map::new();
            pass.insert("ad_model".to_string(), json!(layer.model));
            insert_opt(&mut pass, "ad_prompt", layer.prompt.as_ref());
            insert_opt(&mut pass, "ad_negative_prompt", layer.negative_prompt.as_ref());
            insert_opt(&mut pass, "ad_confidence", layer.confidence);
            insert_opt(&mut pass, "ad_denoising_strength", layer.denoising);
            insert_opt(&mut pass, "ad_mask_blur", layer.mask_blur);
            args.push(Value::Object(pass));
        }
        scripts.insert("ADetailer".to_string(), json!({ "args": args }));
    }

    if let Some(tiled) = draft.tiled_diffusion.as_ref() {
        scripts.insert(
            "Tiled Diffusion".to_string(),
            json!({
                "args": [
                    true,
                    tiled.method.as_deref().unwrap_or("MultiDiffusion"),
                    false,
                    true,
                    draft.width.unwrap_or(1024),
                    draft.height.unwrap_or(1024),
                    tiled.tile_width.unwrap_or(96),
                    tiled.tile_height.unwrap_or(96),
                    tiled.tile_overlap.unwrap_or(48),
                    tiled.tile_batch_size.unwrap_or(4),
                    tiled.upscaler.as_deref().unwrap_or("None"),
                    1.0,
                ]
            }),
        );
    }

    if let Some(vae) = draft.tiled_vae.as_ref() {
        scripts.insert(
            "Tiled VAE".to_string(),
            json!({
                "args": [
                    true,
                    vae.encoder_tile_size.unwrap_or(1024),
                    vae.decoder_tile_size.unwrap_or(96),
                    true,
                    vae.fast_decoder.unwrap_or(true),
                    vae.fast_encoder.unwrap_or(true),
                    vae.color_fix.unwrap_or(false),
                ]
            }),
        );
    }

    if let Some(targets) = draft.cut_off.as_deref() {
        scripts.insert(
            "Cutoff".to_string(),
            json!({ "args": [true, targets, 2.0, false, false, "", "Lerp"] }),
        );
    }

    Ok(scripts)
}

/// Positional arguments of the Ultimate SD upscale script.
fn usdu_args(upscale: &UpscaleScript) -> Value {
    let redraw_mode = match upscale
        .redraw_mode
        .as_deref()
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("chess") => 1,
        Some("none") => 2,
        _ => 0,
    };
    let seams_fix = match upscale
        .seams_fix
        .as_deref()
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("band pass") | Some("band") => 1,
        Some("half tile offset pass") | Some("half") => 2,
        Some("half tile offset pass + intersections") | Some("half+intersections") => 3,
        _ => 0,
    };
    json!([
        null,
        upscale.tile_width.unwrap_or(512),
        upscale.tile_height.unwrap_or(0),
        upscale.mask_blur.unwrap_or(8),
        upscale.padding.unwrap_or(32),
        64,
        0.35,
        32,
        upscale.upscaler_index.unwrap_or(0),
        true,
        redraw_mode,
        false,
        4,
        seams_fix,
        2,
        upscale.target_width,
        upscale.target_height,
        upscale.scale_factor,
    ])
}

fn insert_opt<T: serde::Serialize>(
    payload: &mut Map<String, Value>,
    key: &str,
    value: Option<T>,
) {
    if let Some(value) = value {
        payload.insert(key.to_string(), json!(value));
    }
}

#[cfg(test)]
mod tests {
    use sdbatch_contracts::config::{AdetailerLayerSpec, TiledVaeSpec};
    use sdbatch_contracts::errors::{find_coded_error, FatalKind};
    use sdbatch_contracts::events::AuditLog;
    use sdbatch_contracts::runs::query::QueryKind;
    use serde_json::json;

    use super::build_query;
    use crate::context::RunContext;
    use crate::draft::{ControlNetUnit, ResolvedDraft, UpscaleScript};
    use crate::testing::{catalog, MemoryFiles};

    #[test]
    fn txt2img_payload_carries_settings_and_pattern() -> anyhow::Result<()> {
        let catalog = catalog();
        let files = MemoryFiles::default();
        let audit = AuditLog::disabled("test");
        let mut ctx = RunContext::new(&catalog, &files, &audit);
        let draft = ResolvedDraft {
            prompt: "a lake".to_string(),
            checkpoint: Some("sd15/realistic.safetensors [aa11]".to_string()),
            sampler: Some("Euler a".to_string()),
            cfg: Some(6.5),
            steps: Some(20),
            width: Some(512),
            height: Some(768),
            enable_high_res: true,
            upscaler: Some("Lanczos".to_string()),
            scale_factor: Some(1.5),
            upscale_prompt: Some("a lake".to_string()),
            filename: Some("{checkpoint}-{seed}-{sampler}".to_string()),
            cut_off: Some("red, blue".to_string()),
            tiled_vae: Some(TiledVaeSpec::default()),
            ..ResolvedDraft::default()
        };
        let query = build_query(&mut ctx, &draft)?;
        assert_eq!(query.kind, QueryKind::Txt2img);
        assert_eq!(query.draft_id, draft.short_id());
        let payload = &query.payload;
        assert_eq!(payload["seed"], json!(-1));
        assert_eq!(payload["cfg_scale"], json!(6.5));
        assert_eq!(payload["sampler_name"], json!("Euler a"));
        assert_eq!(payload["enable_hr"], json!(true));
        assert_eq!(payload["hr_upscaler"], json!("Lanczos"));
        assert_eq!(payload["hr_scale"], json!(1.5));
        assert_eq!(
            payload["override_settings"]["sd_model_checkpoint"],
            json!("sd15/realistic.safetensors [aa11]")
        );
        assert_eq!(
            payload["override_settings"]["samples_filename_pattern"],
            json!("[model_name]-[seed]-Euler a")
        );
        assert_eq!(payload["alwayson_scripts"]["Cutoff"]["args"][1], json!("red, blue"));
        assert!(payload["alwayson_scripts"].get("Tiled VAE").is_some());
        assert!(payload.get("init_images").is_none());
        Ok(())
    }

    #[test]
    fn img2img_payload_embeds_images_and_upscale_script() -> anyhow::Result<()> {
        let catalog = catalog();
        let files = MemoryFiles::default()
            .with_image("/inits/a.png", 512, 512)
            .with_image("/poses/p.png", 512, 512);
        let audit = AuditLog::disabled("test");
        let mut ctx = RunContext::new(&catalog, &files, &audit);
        let draft = ResolvedDraft {
            prompt: "a lake".to_string(),
            init_image: Some("/inits/a.png".to_string()),
            denoising: Some(0.4),
            control_net: vec![ControlNetUnit {
                model: "control_v11p_sd15_openpose [cab727d4]".to_string(),
                input_image: Some("/poses/p.png".to_string()),
                ..ControlNetUnit::default()
            }],
            adetailer: vec![AdetailerLayerSpec {
                model: "face_yolov8n.pt".to_string(),
                ..AdetailerLayerSpec::default()
            }],
            ultimate_sd_upscale: Some(UpscaleScript {
                upscaler: Some("4x-UltraSharp".to_string()),
                upscaler_index: Some(5),
                scale_factor: 2.0,
                target_width: 1024,
                target_height: 1024,
                ..UpscaleScript::default()
            }),
            ..ResolvedDraft::default()
        };
        let query = build_query(&mut ctx, &draft)?;
        assert_eq!(query.kind, QueryKind::Img2img);
        let payload = &query.payload;
        assert_eq!(payload["init_images"], json!(["b64:/inits/a.png"]));
        assert_eq!(payload["denoising_strength"], json!(0.4));
        assert_eq!(payload["script_name"], json!("ultimate sd upscale"));
        assert_eq!(payload["script_args"][8], json!(5));
        assert_eq!(payload["script_args"][15], json!(1024));
        let unit = &payload["alwayson_scripts"]["ControlNet"]["args"][0];
        assert_eq!(unit["image"], json!("b64:/poses/p.png"));
        assert_eq!(unit["module"], json!("none"));
        assert_eq!(
            payload["alwayson_scripts"]["ADetailer"]["args"][2]["ad_model"],
            json!("face_yolov8n.pt")
        );
        Ok(())
    }

    #[test]
    fn bad_pattern_token_fails_query_build() {
        let catalog = catalog();
        let files = MemoryFiles::default();
        let audit = AuditLog::disabled("test");
        let mut ctx = RunContext::new(&catalog, &files, &audit);
        let draft = ResolvedDraft {
            filename: Some("{prompt_words}".to_string()),
            ..ResolvedDraft::default()
        };
        let err = build_query(&mut ctx, &draft).unwrap_err();
        let coded = find_coded_error(&err).expect("coded error");
        assert_eq!(coded.kind, FatalKind::InvalidPatternToken);
    }

    #[test]
    fn upscale_script_without_init_image_is_skipped_with_notice() -> anyhow::Result<()> {
        let catalog = catalog();
        let files = MemoryFiles::default();
        let audit = AuditLog::disabled("test");
        let mut ctx = RunContext::new(&catalog, &files, &audit);
        let draft = ResolvedDraft {
            ultimate_sd_upscale: Some(UpscaleScript::default()),
            ..ResolvedDraft::default()
        };
        let query = build_query(&mut ctx, &draft)?;
        assert!(query.payload.get("script_name").is_none());
        assert_eq!(ctx.notices().len(), 1);
        Ok(())
    }
}
