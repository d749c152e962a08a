use serde::{Deserialize, Serialize};

use super::resolver::{file_stem, strip_hash_suffix, CatalogMatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub name: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Distillation family such as `lcm` or `turbo`.
    #[serde(default)]
    pub accelerator: Option<String>,
}

impl CheckpointEntry {
    pub fn required_sampler(&self) -> Option<&'static str> {
        let accelerator = self.accelerator.as_deref()?.trim().to_ascii_lowercase();
        match accelerator.as_str() {
            "lcm" => Some("LCM"),
            "turbo" => Some("Euler a"),
            "lightning" | "hyper" => Some("DPM++ SDE"),
            _ => None,
        }
    }
}

impl CatalogMatch for CheckpointEntry {
    fn canonical_name(&self) -> &str {
        &self.name
    }

    fn matches_exact(&self, candidate: &str) -> bool {
        self.name == candidate
            || strip_hash_suffix(&self.name) == candidate
            || file_stem(&self.name) == candidate
            || self
                .hash
                .as_deref()
                .is_some_and(|hash| hash.eq_ignore_ascii_case(candidate))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerEntry {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CatalogMatch for SamplerEntry {
    fn canonical_name(&self) -> &str {
        &self.name
    }

    fn matches_exact(&self, candidate: &str) -> bool {
        self.name == candidate || self.aliases.iter().any(|alias| alias == candidate)
    }

    fn matches_partial(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self
                .aliases
                .iter()
                .any(|alias| alias.to_lowercase().contains(needle))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscalerEntry {
    pub name: String,
    #[serde(default)]
    pub filename: Option<String>,
    /// Position in the backend's upscaler list, used by positional script args.
    #[serde(default)]
    pub index: Option<u32>,
}

impl CatalogMatch for UpscalerEntry {
    fn canonical_name(&self) -> &str {
        &self.name
    }

    fn matches_exact(&self, candidate: &str) -> bool {
        self.name == candidate
            || self.filename.as_deref().is_some_and(|filename| {
                filename == candidate || file_stem(filename) == candidate
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleEntry {
    pub name: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
}

impl CatalogMatch for StyleEntry {
    fn canonical_name(&self) -> &str {
        &self.name
    }

    fn matches_exact(&self, candidate: &str) -> bool {
        self.name == candidate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraEntry {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl CatalogMatch for LoraEntry {
    fn canonical_name(&self) -> &str {
        &self.name
    }

    fn matches_exact(&self, candidate: &str) -> bool {
        self.name == candidate
            || file_stem(&self.name) == candidate
            || self.alias.as_deref() == Some(candidate)
    }
}
