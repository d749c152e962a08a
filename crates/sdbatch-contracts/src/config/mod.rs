mod candidates;
mod overlay;
mod prompt_spec;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use candidates::{BothMarker, Candidates, OneOrMany, SeedSpec, Toggle};
pub use overlay::PermutationOverlay;
pub use prompt_spec::{
    AdetailerLayerSpec, CheckpointChoice, CheckpointOption, ControlNetLayerSpec, PromptSpec,
    TiledDiffusionSpec, TiledVaeSpec, UltimateSdUpscaleSpec,
};

/// Top-level batch configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub prompts: Vec<PromptSpec>,
    #[serde(default)]
    pub permutations: Vec<PermutationOverlay>,
    #[serde(default)]
    pub random_selection: bool,
    #[serde(default)]
    pub interrogate: bool,
}

impl BatchConfig {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("invalid batch configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("in {}", path.display()))
    }
}
