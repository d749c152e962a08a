use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named delta set layered on top of every resolved draft.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermutationOverlay {
    pub name: String,
    /// Draft fields to overwrite, keyed by the draft's JSON field names.
    pub overwrite: Map<String, Value>,
    pub prompt_replace: Vec<(String, String)>,
    pub negative_prompt_replace: Vec<(String, String)>,
    pub filename_replace: Vec<(String, String)>,
    pub prompt_before: Option<String>,
    pub prompt_after: Option<String>,
    pub negative_prompt_before: Option<String>,
    pub negative_prompt_after: Option<String>,
    pub filename_before: Option<String>,
    pub filename_after: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::PermutationOverlay;

    #[test]
    fn overlay_reads_replace_pairs_in_order() -> anyhow::Result<()> {
        let overlay: PermutationOverlay = serde_json::from_value(json!({
            "name": "night",
            "overwrite": {"cfg": 4},
            "promptReplace": [["day", "night"], ["sun", "moon"]],
            "filenameAfter": "-night"
        }))?;
        assert_eq!(overlay.name, "night");
        assert_eq!(overlay.overwrite.get("cfg"), Some(&json!(4)));
        assert_eq!(
            overlay.prompt_replace,
            vec![
                ("day".to_string(), "night".to_string()),
                ("sun".to_string(), "moon".to_string())
            ]
        );
        assert_eq!(overlay.filename_after.as_deref(), Some("-night"));
        assert!(overlay.negative_prompt_replace.is_empty());
        Ok(())
    }
}
