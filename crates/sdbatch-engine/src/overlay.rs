use anyhow::Result;
use sdbatch_contracts::config::PermutationOverlay;
use sdbatch_contracts::errors::{CodedError, FatalKind};
use serde_json::{json, Value};

use crate::builder::join_comma;
use crate::draft::ResolvedDraft;

/// Authoring names that differ from the draft's own field names.
const OVERWRITE_ALIASES: &[(&str, &str)] =
    &[("checkpoints", "checkpoint"), ("tiledVAE", "tiledVae")];

/// The variant of `draft` produced by `overlay`, tagged with the overlay name.
pub fn apply_overlay(
    draft: &ResolvedDraft,
    overlay: &PermutationOverlay,
) -> Result<ResolvedDraft> {
    let mut variant = overwrite(draft, overlay)?;
    variant.iteration = draft.iteration;

    for (search, replace) in &overlay.prompt_replace {
        variant.prompt = replace_text(&variant.prompt, search, replace);
    }
    if let Some(negative) = variant.negative_prompt.as_mut() {
        for (search, replace) in &overlay.negative_prompt_replace {
            *negative = replace_text(negative, search, replace);
        }
    }

    if overlay.filename_before.is_some() || overlay.filename_after.is_some() {
        variant.filename = Some(format!(
            "{}{}{}",
            overlay.filename_before.as_deref().unwrap_or_default(),
            variant.filename.as_deref().unwrap_or_default(),
            overlay.filename_after.as_deref().unwrap_or_default()
        ));
    }
    if let Some(filename) = variant.filename.as_mut() {
        for (search, replace) in &overlay.filename_replace {
            *filename = replace_text(filename, search, replace);
        }
    }

    if let Some(before) = overlay.prompt_before.as_deref() {
        variant.prompt = join_comma(before, &variant.prompt);
    }
    if let Some(after) = overlay.prompt_after.as_deref() {
        variant.prompt = join_comma(&variant.prompt, after);
    }
    if let Some(before) = overlay.negative_prompt_before.as_deref() {
        let current = variant.negative_prompt.clone().unwrap_or_default();
        variant.negative_prompt = Some(join_comma(before, &current));
    }
    if let Some(after) = overlay.negative_prompt_after.as_deref() {
        let current = variant.negative_prompt.clone().unwrap_or_default();
        variant.negative_prompt = Some(join_comma(&current, after));
    }

    variant.overlay = Some(overlay.name.clone());
    Ok(variant)
}

fn overwrite(draft: &ResolvedDraft, overlay: &PermutationOverlay) -> Result<ResolvedDraft> {
    if overlay.overwrite.is_empty() {
        return Ok(draft.clone());
    }
    let mut fields = match serde_json::to_value(draft)? {
        Value::Object(fields) => fields,
        _ => Default::default(),
    };
    for (key, value) in &overlay.overwrite {
        let key = OVERWRITE_ALIASES
            .iter()
            .find(|(alias, _)| alias == key)
            .map(|(_, field)| (*field).to_string())
            .unwrap_or_else(|| key.clone());
        fields.insert(key, value.clone());
    }
    serde_json::from_value(Value::Object(fields)).map_err(|err| {
        CodedError::new(
            FatalKind::InvalidOverlay,
            format!("overlay '{}' cannot overwrite draft: {err}", overlay.name),
        )
        .with_details(json!({
            "overlay": overlay.name,
            "keys": overlay.overwrite.keys().collect::<Vec<&String>>(),
        }))
        .into()
    })
}

fn replace_text(text: &str, search: &str, replace: &str) -> String {
    if search.is_empty() {
        return text.to_string();
    }
    text.replace(search, replace)
}

#[cfg(test)]
mod tests {
    use sdbatch_contracts::config::PermutationOverlay;
    use sdbatch_contracts::errors::{find_coded_error, FatalKind};
    use serde_json::json;

    use super::apply_overlay;
    use crate::draft::ResolvedDraft;

    fn base() -> ResolvedDraft {
        ResolvedDraft {
            prompt: "a red car".to_string(),
            negative_prompt: None,
            cfg: Some(7.0),
            filename: Some("{seed}".to_string()),
            iteration: 1,
            ..ResolvedDraft::default()
        }
    }

    fn overlay(value: serde_json::Value) -> anyhow::Result<PermutationOverlay> {
        Ok(serde_json::from_value(value)?)
    }

    #[test]
    fn overlay_applies_every_delta_in_order() -> anyhow::Result<()> {
        let variant = apply_overlay(
            &base(),
            &overlay(json!({
                "name": "blue",
                "overwrite": {"cfg": 4.5, "steps": 12},
                "promptReplace": [["red", "blue"], ["car", "truck"]],
                "promptAfter": "night",
                "negativePromptBefore": "lowres",
                "filenameBefore": "blue-",
                "filenameReplace": [["seed", "steps"]]
            }))?,
        )?;
        assert_eq!(variant.prompt, "a blue truck, night");
        assert_eq!(variant.negative_prompt.as_deref(), Some("lowres"));
        assert_eq!(variant.cfg, Some(4.5));
        assert_eq!(variant.steps, Some(12));
        assert_eq!(variant.filename.as_deref(), Some("blue-{steps}"));
        assert_eq!(variant.overlay.as_deref(), Some("blue"));
        assert_eq!(variant.iteration, 1);
        Ok(())
    }

    #[test]
    fn overwrite_accepts_authoring_field_names() -> anyhow::Result<()> {
        let variant = apply_overlay(
            &base(),
            &overlay(json!({
                "name": "anime",
                "overwrite": {
                    "checkpoints": "sdxl/anime.safetensors [cc33]",
                    "tiledVAE": {"encoderTileSize": 512}
                }
            }))?,
        )?;
        assert_eq!(
            variant.checkpoint.as_deref(),
            Some("sdxl/anime.safetensors [cc33]")
        );
        let tiled = variant.tiled_vae.expect("tiled vae overwrite");
        assert_eq!(tiled.encoder_tile_size, Some(512));
        assert_eq!(variant.prompt, "a red car");
        Ok(())
    }

    #[test]
    fn unknown_or_mistyped_overwrite_is_fatal() -> anyhow::Result<()> {
        for bad in [json!({"cfgScale": 3}), json!({"steps": "many"})] {
            let err = apply_overlay(&base(), &overlay(json!({"name": "bad", "overwrite": bad}))?)
                .unwrap_err();
            let coded = find_coded_error(&err).expect("coded error");
            assert_eq!(coded.kind, FatalKind::InvalidOverlay);
        }
        Ok(())
    }
}
