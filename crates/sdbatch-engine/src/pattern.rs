//! Filename pattern tokens.
//!
//! Authors write `{token}` placeholders. `Literal` rendering replaces each with
//! the draft's value; `Backend` rendering hands the per-image values (seed,
//! size, ...) to the backend's own `[token]` vocabulary instead.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use sdbatch_contracts::catalog::resolver::file_stem;
use sdbatch_contracts::errors::{CodedError, FatalKind};
use serde_json::json;

use crate::draft::ResolvedDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    Literal,
    Backend,
}

pub const AUTHOR_TOKENS: &[&str] = &[
    "filename",
    "cfg",
    "checkpoint",
    "clipSkip",
    "cutOff",
    "denoising",
    "enableHighRes",
    "height",
    "restoreFaces",
    "sampler",
    "scaleFactor",
    "seed",
    "steps",
    "tiling",
    "upscaler",
    "vae",
    "width",
    "pose",
    "count",
];

const BACKEND_REWRITES: &[(&str, &str)] = &[
    ("cfg", "[cfg]"),
    ("checkpoint", "[model_name]"),
    ("clipSkip", "[clip_skip]"),
    ("height", "[height]"),
    ("seed", "[seed]"),
    ("steps", "[steps]"),
    ("width", "[width]"),
];

/// Bracket tokens the backend understands in `samples_filename_pattern`.
pub const BACKEND_TOKENS: &[&str] = &[
    "seed",
    "seed_first",
    "seed_last",
    "steps",
    "cfg",
    "width",
    "height",
    "sampler",
    "scheduler",
    "model_name",
    "model_hash",
    "clip_skip",
    "denoising",
    "datetime",
    "date",
    "job_timestamp",
    "prompt_hash",
    "negative_prompt_hash",
    "full_prompt_hash",
    "prompt",
    "prompt_no_styles",
    "prompt_spaces",
    "prompt_words",
    "styles",
    "batch_number",
    "batch_size",
    "generation_number",
    "hasprompt",
    "vae_filename",
    "vae_hash",
    "image_hash",
    "user",
    "none",
];

fn curly_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("curly token regex should compile"))
}

fn bracket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[([^\[\]]*)\]").expect("bracket token regex should compile")
    })
}

/// Renders `pattern` for `draft`, rejecting unknown tokens.
pub fn render(pattern: &str, draft: &ResolvedDraft, mode: TokenMode) -> Result<String> {
    if let Some(unknown) = curly_re()
        .captures_iter(pattern)
        .filter_map(|caps| caps.get(1))
        .map(|token| token.as_str())
        .find(|token| !AUTHOR_TOKENS.contains(token))
    {
        let error = CodedError::new(
            FatalKind::InvalidPatternToken,
            format!("unknown filename token '{{{unknown}}}' in '{pattern}'"),
        )
        .with_details(json!({"token": unknown, "pattern": pattern}));
        return Err(error.into());
    }

    let rendered = curly_re()
        .replace_all(pattern, |caps: &regex::Captures<'_>| {
            let token = caps.get(1).map(|value| value.as_str()).unwrap_or_default();
            if mode == TokenMode::Backend {
                if let Some((_, rewrite)) = BACKEND_REWRITES.iter().find(|(name, _)| *name == token)
                {
                    return (*rewrite).to_string();
                }
            }
            token_value(token, draft)
        })
        .to_string();

    if mode == TokenMode::Backend {
        validate_backend_tokens(&rendered)?;
    }
    Ok(rendered)
}

/// Fails on any `[token]` the backend would not expand.
pub fn validate_backend_tokens(rendered: &str) -> Result<()> {
    for caps in bracket_re().captures_iter(rendered) {
        let inner = caps.get(1).map(|value| value.as_str()).unwrap_or_default();
        let name = inner.split('<').next().unwrap_or_default().trim();
        if BACKEND_TOKENS.contains(&name) {
            continue;
        }
        let error = CodedError::new(
            FatalKind::InvalidBackendToken,
            format!("unsupported backend token '[{inner}]' in '{rendered}'"),
        )
        .with_details(json!({"token": inner, "pattern": rendered}));
        return Err(error.into());
    }
    Ok(())
}

fn token_value(token: &str, draft: &ResolvedDraft) -> String {
    fn show<T: ToString>(value: Option<T>) -> String {
        value.map(|value| value.to_string()).unwrap_or_default()
    }
    match token {
        "filename" => draft
            .source_image()
            .and_then(|path| Path::new(path).file_stem())
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default(),
        "cfg" => show(draft.cfg),
        "checkpoint" => show(draft.checkpoint.as_deref().map(file_stem)),
        "clipSkip" => show(draft.clip_skip),
        "cutOff" => show(draft.cut_off.as_deref()),
        "denoising" => show(draft.denoising.map(|value| format!("{value:.2}"))),
        "enableHighRes" => draft.enable_high_res.to_string(),
        "height" => show(draft.height),
        "restoreFaces" => draft.restore_faces.to_string(),
        "sampler" => show(draft.sampler.as_deref()),
        "scaleFactor" => show(draft.scale_factor),
        "seed" => show(draft.seed),
        "steps" => show(draft.steps),
        "tiling" => draft.tiling.to_string(),
        "upscaler" => show(draft.upscaler.as_deref()),
        "vae" => show(draft.vae.as_deref().map(file_stem)),
        "width" => show(draft.width),
        "pose" => show(draft.pose.as_deref()),
        "count" => (draft.iteration + 1).to_string(),
        _ => String::new(),
    }
}
