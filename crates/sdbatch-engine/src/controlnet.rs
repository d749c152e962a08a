use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use sdbatch_contracts::catalog::resolver::file_stem;
use sdbatch_contracts::config::ControlNetLayerSpec;

use crate::files::ImageFiles;

/// One layer of a candidate stack, with its image already picked.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlNetImage {
    pub layer: ControlNetLayerSpec,
    pub input_image: Option<String>,
    pub image_name: Option<String>,
    /// Sidecar text of an image found under an `instruct` folder.
    pub prompt: Option<String>,
}

impl ControlNetImage {
    fn bare(layer: &ControlNetLayerSpec) -> Self {
        Self {
            layer: layer.clone(),
            input_image: None,
            image_name: None,
            prompt: None,
        }
    }
}

pub type ControlNetStack = Vec<ControlNetImage>;

/// Candidate stacks for a prompt entry: the cross-product of every layer's images.
///
/// A layer whose directory holds no matching file drops out of the stacks
/// instead of dropping the prompt, so no layers at all still gives one empty stack.
pub fn resolve_stacks(
    files: &dyn ImageFiles,
    layers: &[ControlNetLayerSpec],
) -> Result<Vec<ControlNetStack>> {
    let mut stacks: Vec<ControlNetStack> = vec![Vec::new()];
    for layer in layers {
        let options = layer_candidates(files, layer)?;
        if options.is_empty() {
            continue;
        }
        let mut next = Vec::with_capacity(stacks.len() * options.len());
        for stack in &stacks {
            for option in &options {
                let mut grown = stack.clone();
                grown.push(option.clone());
                next.push(grown);
            }
        }
        stacks = next;
    }
    Ok(stacks)
}

fn layer_candidates(
    files: &dyn ImageFiles,
    layer: &ControlNetLayerSpec,
) -> Result<Vec<ControlNetImage>> {
    let Some(input) = layer.input_image.as_deref().filter(|value| !value.is_empty()) else {
        return Ok(vec![ControlNetImage::bare(layer)]);
    };
    let root = Path::new(input);
    if !files.is_directory(root) {
        let mut single = ControlNetImage::bare(layer);
        single.input_image = Some(input.to_string());
        single.image_name = Some(file_stem(input).to_string());
        single.prompt = instruct_prompt(files, root);
        return Ok(vec![single]);
    }

    let folder = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut found: Vec<(PathBuf, String)> = Vec::new();
    for entry in files.list_directory(root)? {
        if entry.is_dir {
            continue;
        }
        let name = if folder.is_empty() {
            path_stem(&entry.path)
        } else {
            format!("{}-{}", folder, path_stem(&entry.path))
        };
        found.push((entry.path, name));
    }

    if let Some(pattern) = layer.regex.as_deref().filter(|value| !value.is_empty()) {
        found.retain(|(path, _)| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().contains(pattern))
        });
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(found
        .into_iter()
        .map(|(path, name)| {
            let mut image = ControlNetImage::bare(layer);
            image.prompt = instruct_prompt(files, &path);
            image.input_image = Some(path.to_string_lossy().to_string());
            image.image_name = Some(name);
            image
        })
        .collect())
}

fn path_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn instruct_prompt(files: &dyn ImageFiles, image: &Path) -> Option<String> {
    let parent = image.parent()?;
    let in_instruct = parent.components().any(|component| {
        matches!(component, Component::Normal(name) if name.eq_ignore_ascii_case("instruct"))
    });
    if !in_instruct {
        return None;
    }
    let text = files.read_text(&image.with_extension("txt"))?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.to_string())
}

#[cfg(test)]
mod tests {
    use sdbatch_contracts::config::{ControlNetLayerSpec, OneOrMany};

    use super::resolve_stacks;
    use crate::testing::MemoryFiles;

    fn layer(model: &str, input: Option<&str>, regex: Option<&str>) -> ControlNetLayerSpec {
        ControlNetLayerSpec {
            model: OneOrMany::one(model.to_string()),
            input_image: input.map(str::to_string),
            regex: regex.map(str::to_string),
            ..ControlNetLayerSpec::default()
        }
    }

    #[test]
    fn no_layers_is_one_empty_stack() -> anyhow::Result<()> {
        let files = MemoryFiles::default();
        let stacks = resolve_stacks(&files, &[])?;
        assert_eq!(stacks, vec![Vec::new()]);
        Ok(())
    }

    #[test]
    fn layer_without_image_is_kept_unchanged() -> anyhow::Result<()> {
        let files = MemoryFiles::default();
        let stacks = resolve_stacks(&files, &[layer("openpose", None, None)])?;
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0][0].input_image, None);
        Ok(())
    }

    #[test]
    fn directory_lists_direct_files_named_after_the_folder() -> anyhow::Result<()> {
        let files = MemoryFiles::default()
            .with_image("/poses/walk.png", 512, 768)
            .with_dir("/poses/hero")
            .with_image("/poses/hero/run.png", 512, 768)
            .with_text("/poses/notes.txt", "reference shots")
            .with_image("/poses/alpha.png", 512, 768);

        let stacks = resolve_stacks(&files, &[layer("openpose", Some("/poses"), Some(".png"))])?;
        let names: Vec<Option<String>> = stacks
            .iter()
            .map(|stack| stack[0].image_name.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                Some("poses-alpha".to_string()),
                Some("poses-walk".to_string()),
            ]
        );
        assert_eq!(stacks[1][0].input_image.as_deref(), Some("/poses/walk.png"));
        Ok(())
    }

    #[test]
    fn every_layer_branches_into_the_cross_product() -> anyhow::Result<()> {
        let files = MemoryFiles::default()
            .with_image("/poses/a.png", 64, 64)
            .with_image("/poses/b.png", 64, 64)
            .with_image("/edges/x.png", 64, 64)
            .with_image("/edges/y.png", 64, 64);

        let stacks = resolve_stacks(
            &files,
            &[
                layer("openpose", Some("/poses"), None),
                layer("canny", Some("/edges"), None),
            ],
        )?;
        assert_eq!(stacks.len(), 4);
        let pairs: Vec<(String, String)> = stacks
            .iter()
            .map(|stack| {
                (
                    stack[0].image_name.clone().unwrap_or_default(),
                    stack[1].image_name.clone().unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("poses-a".to_string(), "edges-x".to_string()),
                ("poses-a".to_string(), "edges-y".to_string()),
                ("poses-b".to_string(), "edges-x".to_string()),
                ("poses-b".to_string(), "edges-y".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn empty_directory_keeps_the_prompt() -> anyhow::Result<()> {
        let files = MemoryFiles::default().with_dir("/empty");
        let stacks = resolve_stacks(&files, &[layer("openpose", Some("/empty"), None)])?;
        assert_eq!(stacks, vec![Vec::new()]);
        Ok(())
    }

    #[test]
    fn instruct_folder_attaches_sidecar_text() -> anyhow::Result<()> {
        let files = MemoryFiles::default()
            .with_image("/sets/instruct/cat.png", 64, 64)
            .with_text("/sets/instruct/cat.txt", " make it snow \n");
        let stacks = resolve_stacks(
            &files,
            &[layer("canny", Some("/sets/instruct"), Some(".png"))],
        )?;
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0][0].prompt.as_deref(), Some("make it snow"));
        Ok(())
    }
}
