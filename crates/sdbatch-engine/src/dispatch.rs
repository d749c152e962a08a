use std::env;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use sdbatch_contracts::runs::query::BackendQuery;
use serde_json::{json, Value};

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:7860";
pub const API_BASE_ENV: &str = "SDBATCH_API_BASE";

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub images: u64,
    /// Backend `info` payload, when it returns one.
    pub info: Option<Value>,
}

/// Sends backend queries, one at a time.
pub trait QueryDispatcher {
    fn name(&self) -> &str;
    fn dispatch(&self, query: &BackendQuery) -> Result<DispatchOutcome>;
    /// Caption for a base64 image, used to fill empty img2img prompts.
    fn interrogate(&self, image_b64: &str) -> Result<String>;
}

pub struct HttpDispatcher {
    api_base: String,
    http: HttpClient,
}

impl HttpDispatcher {
    /// `api_base` wins over the environment, which wins over the local default.
    pub fn new(api_base: Option<String>) -> Self {
        let api_base = api_base
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| non_empty_env(API_BASE_ENV))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            api_base,
            http: HttpClient::new(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/sdapi/v1/{}", self.api_base, path)
    }
}

impl QueryDispatcher for HttpDispatcher {
    fn name(&self) -> &str {
        "http"
    }

    fn dispatch(&self, query: &BackendQuery) -> Result<DispatchOutcome> {
        let url = self.endpoint(query.endpoint());
        let response = self
            .http
            .post(&url)
            .json(&query.payload)
            .send()
            .with_context(|| format!("{} request to {url} failed", query.endpoint()))?;
        let parsed = response_json_or_error(query.endpoint(), response)?;
        let images = parsed
            .get("images")
            .and_then(Value::as_array)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0);
        let info = parsed.get("info").map(|info| match info {
            Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| info.clone()),
            other => other.clone(),
        });
        Ok(DispatchOutcome { images, info })
    }

    fn interrogate(&self, image_b64: &str) -> Result<String> {
        let url = self.endpoint("interrogate");
        let response = self
            .http
            .post(&url)
            .json(&json!({"image": image_b64, "model": "clip"}))
            .send()
            .with_context(|| format!("interrogate request to {url} failed"))?;
        let parsed = response_json_or_error("interrogate", response)?;
        let caption = parsed
            .get("caption")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        Ok(caption.to_string())
    }
}

/// Records queries instead of sending them.
#[derive(Default)]
pub struct DryrunDispatcher {
    sent: Mutex<Vec<BackendQuery>>,
}

impl DryrunDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<BackendQuery> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

impl QueryDispatcher for DryrunDispatcher {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn dispatch(&self, query: &BackendQuery) -> Result<DispatchOutcome> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("dryrun dispatcher lock poisoned"))?
            .push(query.clone());
        Ok(DispatchOutcome {
            images: 1,
            info: None,
        })
    }

    fn interrogate(&self, _image_b64: &str) -> Result<String> {
        Ok("dryrun caption".to_string())
    }
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use sdbatch_contracts::runs::query::BackendQuery;
    use serde_json::Map;

    use super::{truncate_text, DryrunDispatcher, HttpDispatcher, QueryDispatcher};

    #[test]
    fn explicit_api_base_is_trimmed() {
        let dispatcher = HttpDispatcher::new(Some(" http://gpu-box:7860/ ".to_string()));
        assert_eq!(dispatcher.api_base(), "http://gpu-box:7860");
        assert_eq!(
            dispatcher.endpoint("txt2img"),
            "http://gpu-box:7860/sdapi/v1/txt2img"
        );
    }

    #[test]
    fn dryrun_records_queries_in_order() -> anyhow::Result<()> {
        let dispatcher = DryrunDispatcher::new();
        dispatcher.dispatch(&BackendQuery::new("a", Map::new()))?;
        dispatcher.dispatch(&BackendQuery::new("b", Map::new()))?;
        let ids: Vec<String> = dispatcher
            .sent()
            .into_iter()
            .map(|query| query.draft_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn truncate_text_marks_cut() {
        assert_eq!(truncate_text("abcdef", 3), "abc...");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
