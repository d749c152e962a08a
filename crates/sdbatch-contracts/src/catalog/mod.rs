mod entries;
pub mod resolver;

use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::errors::{fatal, FatalKind};

pub use entries::{CheckpointEntry, LoraEntry, SamplerEntry, StyleEntry, UpscalerEntry};
pub use resolver::{find, CatalogMatch};

/// Entity kinds the engine looks up by user-typed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Checkpoint,
    Vae,
    Sampler,
    Upscaler,
    Style,
    ControlNetModel,
    ControlNetModule,
    AdetailerModel,
    Lora,
}

impl CatalogKind {
    pub fn label(self) -> &'static str {
        match self {
            CatalogKind::Checkpoint => "checkpoint",
            CatalogKind::Vae => "vae",
            CatalogKind::Sampler => "sampler",
            CatalogKind::Upscaler => "upscaler",
            CatalogKind::Style => "style",
            CatalogKind::ControlNetModel => "controlnet model",
            CatalogKind::ControlNetModule => "controlnet module",
            CatalogKind::AdetailerModel => "adetailer model",
            CatalogKind::Lora => "lora",
        }
    }

    /// `None` for kinds whose misses are tolerated.
    pub fn fatal_kind(self) -> Option<FatalKind> {
        match self {
            CatalogKind::Checkpoint => Some(FatalKind::CheckpointNotFound),
            CatalogKind::Sampler => Some(FatalKind::SamplerNotFound),
            CatalogKind::Upscaler => Some(FatalKind::UpscalerNotFound),
            CatalogKind::Style => Some(FatalKind::StyleNotFound),
            CatalogKind::ControlNetModel => Some(FatalKind::ControlNetModelNotFound),
            CatalogKind::ControlNetModule => Some(FatalKind::ControlNetModuleNotFound),
            CatalogKind::AdetailerModel => Some(FatalKind::AdetailerModelNotFound),
            CatalogKind::Vae | CatalogKind::Lora => None,
        }
    }

    pub fn is_required(self) -> bool {
        self.fatal_kind().is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CatalogDocument {
    checkpoints: Vec<CheckpointEntry>,
    vaes: Vec<String>,
    samplers: Vec<SamplerEntry>,
    upscalers: Vec<UpscalerEntry>,
    styles: Vec<StyleEntry>,
    #[serde(alias = "controlNetModels")]
    controlnet_models: Vec<String>,
    #[serde(alias = "controlNetModules")]
    controlnet_modules: Vec<String>,
    adetailer_models: Vec<String>,
    loras: Vec<LoraEntry>,
}

/// Read-only snapshot of what the backend offers, keyed by canonical name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    checkpoints: IndexMap<String, CheckpointEntry>,
    vaes: IndexMap<String, String>,
    samplers: IndexMap<String, SamplerEntry>,
    upscalers: IndexMap<String, UpscalerEntry>,
    styles: IndexMap<String, StyleEntry>,
    controlnet_models: IndexMap<String, String>,
    controlnet_modules: IndexMap<String, String>,
    adetailer_models: IndexMap<String, String>,
    loras: IndexMap<String, LoraEntry>,
}

impl Catalog {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let document: CatalogDocument =
            serde_json::from_str(raw).context("invalid catalog document")?;
        Ok(Self::from_document(document))
    }

    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        let document: CatalogDocument =
            serde_json::from_value(value).context("invalid catalog document")?;
        Ok(Self::from_document(document))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading catalog {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("in {}", path.display()))
    }

    fn from_document(document: CatalogDocument) -> Self {
        Self {
            checkpoints: keyed(document.checkpoints, |entry| entry.name.clone()),
            vaes: keyed(document.vaes, Clone::clone),
            samplers: keyed(document.samplers, |entry| entry.name.clone()),
            upscalers: keyed(document.upscalers, |entry| entry.name.clone()),
            styles: keyed(document.styles, |entry| entry.name.clone()),
            controlnet_models: keyed(document.controlnet_models, Clone::clone),
            controlnet_modules: keyed(document.controlnet_modules, Clone::clone),
            adetailer_models: keyed(document.adetailer_models, Clone::clone),
            loras: keyed(document.loras, |entry| entry.name.clone()),
        }
    }

    /// Canonical name of the first matching entry.
    pub fn lookup<S: AsRef<str>>(&self, kind: CatalogKind, candidates: &[S]) -> Option<String> {
        let name = match kind {
            CatalogKind::Checkpoint => find(candidates, self.checkpoints.values())
                .map(CatalogMatch::canonical_name),
            CatalogKind::Vae => find(candidates, self.vaes.values()).map(String::as_str),
            CatalogKind::Sampler => {
                find(candidates, self.samplers.values()).map(CatalogMatch::canonical_name)
            }
            CatalogKind::Upscaler => {
                find(candidates, self.upscalers.values()).map(CatalogMatch::canonical_name)
            }
            CatalogKind::Style => {
                find(candidates, self.styles.values()).map(CatalogMatch::canonical_name)
            }
            CatalogKind::ControlNetModel => {
                find(candidates, self.controlnet_models.values()).map(String::as_str)
            }
            CatalogKind::ControlNetModule => {
                find(candidates, self.controlnet_modules.values()).map(String::as_str)
            }
            CatalogKind::AdetailerModel => {
                find(candidates, self.adetailer_models.values()).map(String::as_str)
            }
            CatalogKind::Lora => {
                find(candidates, self.loras.values()).map(CatalogMatch::canonical_name)
            }
        };
        name.map(str::to_string)
    }

    /// Like [`Catalog::lookup`], failing with the kind's coded error on a miss.
    ///
    /// Optional kinds return `Ok(None)` on a miss.
    pub fn resolve<S: AsRef<str>>(
        &self,
        kind: CatalogKind,
        candidates: &[S],
    ) -> anyhow::Result<Option<String>> {
        if let Some(name) = self.lookup(kind, candidates) {
            return Ok(Some(name));
        }
        match kind.fatal_kind() {
            Some(fatal_kind) => {
                let requested = candidates
                    .iter()
                    .map(|candidate| format!("'{}'", candidate.as_ref()))
                    .collect::<Vec<String>>()
                    .join(", ");
                Err(fatal(
                    fatal_kind,
                    format!("{} {} not found in catalog", kind.label(), requested),
                ))
            }
            None => Ok(None),
        }
    }

    pub fn checkpoint(&self, name: &str) -> Option<&CheckpointEntry> {
        self.checkpoints.get(name)
    }

    pub fn style(&self, name: &str) -> Option<&StyleEntry> {
        self.styles.get(name)
    }

    pub fn upscaler(&self, name: &str) -> Option<&UpscalerEntry> {
        self.upscalers.get(name)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &CheckpointEntry> {
        self.checkpoints.values()
    }
}

fn keyed<T>(rows: Vec<T>, key: impl Fn(&T) -> String) -> IndexMap<String, T> {
    let mut map = IndexMap::new();
    for row in rows {
        let name = key(&row);
        if name.trim().is_empty() {
            continue;
        }
        map.insert(name, row);
    }
    map
}
