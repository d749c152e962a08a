pub mod builder;
pub mod context;
pub mod controlnet;
pub mod dispatch;
pub mod draft;
pub mod expand;
pub mod files;
pub mod normalize;
pub mod overlay;
pub mod pattern;
pub mod query;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use sdbatch_contracts::catalog::Catalog;
use sdbatch_contracts::config::BatchConfig;
use sdbatch_contracts::events::AuditLog;
use sdbatch_contracts::runs::query::{BackendQuery, QueryKind};
use sdbatch_contracts::runs::summary::{now_utc_iso, write_summary, RunSummary};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub use context::RunContext;
pub use dispatch::{DispatchOutcome, DryrunDispatcher, HttpDispatcher, QueryDispatcher};
pub use draft::ResolvedDraft;
pub use files::{ImageFiles, LocalFiles};
pub use pattern::TokenMode;

use crate::builder::build_drafts;
use crate::expand::{cartesian, sample, DraftSet, FieldCandidates};
use crate::overlay::apply_overlay;
use crate::pattern::render;
use crate::query::build_query;

/// Resolved drafts of one configuration, sorted by their dedup key.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub drafts: Vec<ResolvedDraft>,
    pub notices: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub notices: Vec<String>,
}

/// Expands batch configurations and sends the resulting queries.
pub struct BatchEngine {
    run_id: String,
    out_dir: Option<PathBuf>,
    audit: AuditLog,
    catalog: Catalog,
    files: Box<dyn ImageFiles>,
    summary_path: Option<PathBuf>,
    started_at: String,
}

impl BatchEngine {
    /// Events go to `events_path`, else `<out_dir>/events.jsonl`, else nowhere.
    pub fn new(
        catalog: Catalog,
        files: Box<dyn ImageFiles>,
        out_dir: Option<PathBuf>,
        events_path: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(dir) = out_dir.as_ref() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }
        let run_id = out_dir
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));
        let events_path =
            events_path.or_else(|| out_dir.as_ref().map(|dir| dir.join("events.jsonl")));
        let audit = match events_path {
            Some(path) => AuditLog::new(path, run_id.clone()),
            None => AuditLog::disabled(run_id.clone()),
        };
        let summary_path = out_dir.as_ref().map(|dir| dir.join("summary.json"));
        let started_at = now_utc_iso();

        audit.emit(
            "run_started",
            map_object(json!({
                "out_dir": out_dir.as_ref().map(|dir| dir.to_string_lossy().to_string()),
            })),
        )?;

        Ok(Self {
            run_id,
            out_dir,
            audit,
            catalog,
            files,
            summary_path,
            started_at,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn out_dir(&self) -> Option<&Path> {
        self.out_dir.as_deref()
    }

    pub fn audit_log(&self) -> AuditLog {
        self.audit.clone()
    }

    pub fn expand(&self, config: &BatchConfig) -> Result<Expansion> {
        self.expand_with_rng(config, &mut rand::thread_rng())
    }

    /// Cross-product or random expansion of every prompt entry, overlays included.
    pub fn expand_with_rng<R: Rng + ?Sized>(
        &self,
        config: &BatchConfig,
        rng: &mut R,
    ) -> Result<Expansion> {
        let mut ctx = RunContext::new(&self.catalog, self.files.as_ref(), &self.audit);
        let mut set = DraftSet::new();

        for (index, spec) in config.prompts.iter().enumerate() {
            let label = format!("prompt #{}", index + 1);
            let fields = FieldCandidates::from_spec(spec, self.files.as_ref())
                .with_context(|| format!("failed normalizing {label}"))?;
            for message in &fields.notices {
                ctx.notice(format!("{label}: {message}"))?;
            }
            let selections = if config.random_selection {
                sample(&fields, rng).into_iter().collect()
            } else {
                cartesian(&fields)
            };
            for selection in selections {
                let drafts = build_drafts(&mut ctx, spec, selection)
                    .with_context(|| format!("failed resolving {label}"))?;
                for draft in drafts {
                    for overlay in &config.permutations {
                        set.insert(apply_overlay(&draft, overlay)?);
                    }
                    set.insert(draft);
                }
            }
        }

        let drafts = set.into_sorted();
        let mut rows = Vec::with_capacity(drafts.len());
        for draft in &drafts {
            let filename = match draft.filename.as_deref() {
                Some(pattern) => Some(render(pattern, draft, TokenMode::Literal)?),
                None => None,
            };
            rows.push(json!({
                "id": draft.short_id(),
                "iteration": draft.iteration,
                "filename": filename,
                "draft": draft,
            }));
        }
        self.audit.emit(
            "drafts_resolved",
            map_object(json!({
                "count": drafts.len(),
                "random_selection": config.random_selection,
                "drafts": rows,
            })),
        )?;

        Ok(Expansion {
            drafts,
            notices: ctx.into_notices(),
        })
    }

    /// One query per draft. Any invalid draft fails the whole batch.
    pub fn build_queries(
        &self,
        drafts: &[ResolvedDraft],
    ) -> Result<(Vec<BackendQuery>, Vec<String>)> {
        let mut ctx = RunContext::new(&self.catalog, self.files.as_ref(), &self.audit);
        let mut queries = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let query = build_query(&mut ctx, draft)
                .with_context(|| format!("failed building query for draft {}", draft.short_id()))?;
            queries.push(query);
        }
        Ok((queries, ctx.into_notices()))
    }

    /// Expands `config`, validates every query, then dispatches them in order.
    pub fn run(
        &self,
        config: &BatchConfig,
        dispatcher: &dyn QueryDispatcher,
        dry_run: bool,
    ) -> Result<RunReport> {
        let expansion = self.expand(config)?;
        let (queries, query_notices) = self.build_queries(&expansion.drafts)?;
        let mut notices = expansion.notices;
        for notice in query_notices {
            if !notices.contains(&notice) {
                notices.push(notice);
            }
        }

        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: String::new(),
            total_drafts: queries.len() as u64,
            txt2img: count_kind(&queries, QueryKind::Txt2img),
            img2img: count_kind(&queries, QueryKind::Img2img),
            dispatched: 0,
            dry_run,
        };

        for mut query in queries {
            if let Err(err) = self.dispatch_one(config, dispatcher, &mut query) {
                self.audit.emit(
                    "dispatch_failed",
                    map_object(json!({
                        "draft_id": query.draft_id,
                        "endpoint": query.endpoint(),
                        "error": format!("{err:#}"),
                    })),
                )?;
                self.finish(&mut summary, dispatcher)?;
                return Err(err);
            }
            summary.dispatched += 1;
        }

        self.finish(&mut summary, dispatcher)?;
        Ok(RunReport { summary, notices })
    }

    fn dispatch_one(
        &self,
        config: &BatchConfig,
        dispatcher: &dyn QueryDispatcher,
        query: &mut BackendQuery,
    ) -> Result<()> {
        let needs_caption = config.interrogate
            && query.kind == QueryKind::Img2img
            && query.prompt().trim().is_empty();
        if needs_caption {
            if let Some(image) = query.first_init_image().map(str::to_string) {
                let caption = dispatcher.interrogate(&image)?;
                query
                    .payload
                    .insert("prompt".to_string(), Value::String(caption.clone()));
                self.audit.emit(
                    "prompt_interrogated",
                    map_object(json!({
                        "draft_id": query.draft_id,
                        "caption": caption,
                    })),
                )?;
            }
        }

        let outcome = dispatcher.dispatch(query)?;
        self.audit.emit(
            "query_dispatched",
            map_object(json!({
                "draft_id": query.draft_id,
                "endpoint": query.endpoint(),
                "dispatcher": dispatcher.name(),
                "images": outcome.images,
                "query": query.sanitized(),
            })),
        )?;
        Ok(())
    }

    fn finish(&self, summary: &mut RunSummary, dispatcher: &dyn QueryDispatcher) -> Result<()> {
        summary.finished_at = now_utc_iso();
        if let Some(path) = self.summary_path.as_ref() {
            let mut extra = Map::new();
            extra.insert(
                "dispatcher".to_string(),
                Value::String(dispatcher.name().to_string()),
            );
            write_summary(path, summary, Some(&extra))?;
        }
        self.audit.emit(
            "run_finished",
            map_object(json!({
                "summary_path": self
                    .summary_path
                    .as_ref()
                    .map(|path| path.to_string_lossy().to_string()),
                "dispatched": summary.dispatched,
                "total_drafts": summary.total_drafts,
            })),
        )?;
        Ok(())
    }
}

fn count_kind(queries: &[BackendQuery], kind: QueryKind) -> u64 {
    queries.iter().filter(|query| query.kind == kind).count() as u64
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use anyhow::bail;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use sdbatch_contracts::config::BatchConfig;
    use sdbatch_contracts::errors::{find_coded_error, FatalKind};
    use sdbatch_contracts::runs::query::BackendQuery;
    use serde_json::{json, Value};

    use super::{BatchEngine, DispatchOutcome, DryrunDispatcher, QueryDispatcher};
    use crate::testing::{catalog, MemoryFiles};

    fn engine(files: MemoryFiles) -> anyhow::Result<BatchEngine> {
        BatchEngine::new(catalog(), Box::new(files), None, None)
    }

    fn config(value: Value) -> anyhow::Result<BatchConfig> {
        Ok(serde_json::from_value(value)?)
    }

    #[derive(Default)]
    struct CountingDispatcher {
        sent: Cell<usize>,
        fail_at: Option<usize>,
    }

    impl QueryDispatcher for CountingDispatcher {
        fn name(&self) -> &str {
            "counting"
        }

        fn dispatch(&self, _query: &BackendQuery) -> anyhow::Result<DispatchOutcome> {
            if self.fail_at == Some(self.sent.get()) {
                bail!("connection refused");
            }
            self.sent.set(self.sent.get() + 1);
            Ok(DispatchOutcome {
                images: 1,
                info: None,
            })
        }

        fn interrogate(&self, _image_b64: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    #[test]
    fn cross_product_cardinality_counts_overlays_and_iterations() -> anyhow::Result<()> {
        let engine = engine(MemoryFiles::default())?;
        let expansion = engine.expand(&config(json!({
            "prompts": [
                {"prompt": ["a boat", "a car"], "cfg": [5, 7], "count": 2},
                {"prompt": "a tree"}
            ],
            "permutations": [
                {"name": "night", "promptAfter": "night"},
                {"name": "fog", "promptAfter": "fog"}
            ]
        }))?)?;
        assert_eq!(expansion.drafts.len(), (2 * 2 * 2 + 1) * 3);
        Ok(())
    }

    #[test]
    fn empty_init_directory_builds_txt2img_with_notice() -> anyhow::Result<()> {
        let engine = engine(MemoryFiles::default().with_dir("/inits/empty"))?;
        let expansion = engine.expand(&config(json!({
            "prompts": [{"prompt": "a quiet street", "initImage": "/inits/empty"}]
        }))?)?;
        assert_eq!(expansion.drafts.len(), 1);
        assert_eq!(expansion.drafts[0].init_image, None);
        assert_eq!(
            expansion.notices,
            vec!["prompt #1: initImage directory '/inits/empty' has no files".to_string()]
        );
        Ok(())
    }

    #[test]
    fn random_selection_yields_one_selection_per_entry() -> anyhow::Result<()> {
        let engine = engine(MemoryFiles::default())?;
        let cfg = config(json!({
            "randomSelection": true,
            "prompts": [
                {"prompt": ["a", "b", "c"], "cfg": [4, 5, 6], "count": 3},
                {"prompt": ["d", "e"]}
            ],
            "permutations": [{"name": "alt", "promptBefore": "alt"}]
        }))?;
        let expansion = engine.expand_with_rng(&cfg, &mut StdRng::seed_from_u64(7))?;
        assert_eq!(expansion.drafts.len(), (3 + 1) * 2);
        Ok(())
    }

    #[test]
    fn expansion_is_deterministic() -> anyhow::Result<()> {
        let engine = engine(MemoryFiles::default())?;
        let cross = config(json!({
            "prompts": [{"prompt": ["b", "a"], "steps": [20, 10], "seed": "1-3"}],
            "permutations": [{"name": "x", "overwrite": {"cfg": 2}}]
        }))?;
        let first = serde_json::to_value(&engine.expand(&cross)?.drafts)?;
        let second = serde_json::to_value(&engine.expand(&cross)?.drafts)?;
        assert_eq!(first, second);

        let mut random = cross.clone();
        random.random_selection = true;
        let first = engine.expand_with_rng(&random, &mut StdRng::seed_from_u64(42))?;
        let second = engine.expand_with_rng(&random, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(first.drafts, second.drafts);
        Ok(())
    }

    #[test]
    fn invalid_filename_token_stops_before_dispatch() -> anyhow::Result<()> {
        let engine = engine(MemoryFiles::default())?;
        for (filename, kind) in [
            ("{seed}-{bogus}", FatalKind::InvalidPatternToken),
            ("{seed}-[nonsense]", FatalKind::InvalidBackendToken),
        ] {
            let dispatcher = CountingDispatcher::default();
            let cfg = config(json!({
                "prompts": [
                    {"prompt": "fine", "filename": "{seed}"},
                    {"prompt": "broken", "filename": filename}
                ]
            }))?;
            let err = engine.run(&cfg, &dispatcher, false).unwrap_err();
            assert_eq!(find_coded_error(&err).map(|coded| coded.kind), Some(kind));
            assert_eq!(dispatcher.sent.get(), 0);
        }
        Ok(())
    }

    #[test]
    fn dry_run_writes_events_and_summary() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out_dir = temp.path().join("batch-01");
        let files = MemoryFiles::default().with_image("/in/cat.png", 640, 480);
        let engine = BatchEngine::new(catalog(), Box::new(files), Some(out_dir.clone()), None)?;
        assert_eq!(engine.run_id(), "batch-01");

        let dispatcher = DryrunDispatcher::new();
        let cfg = config(json!({
            "interrogate": true,
            "prompts": [
                {"prompt": "a red car", "vae": "missing-vae.pt"},
                {"initImage": "/in/cat.png", "denoising": 0.4}
            ]
        }))?;
        let report = engine.run(&cfg, &dispatcher, true)?;

        assert_eq!(report.summary.total_drafts, 2);
        assert_eq!(report.summary.txt2img, 1);
        assert_eq!(report.summary.img2img, 1);
        assert_eq!(report.summary.dispatched, 2);
        assert_eq!(
            report.notices,
            vec!["vae 'missing-vae.pt' not found in catalog".to_string()]
        );

        let sent = dispatcher.sent();
        let img2img = sent
            .iter()
            .find(|query| query.endpoint() == "img2img")
            .expect("img2img query");
        assert_eq!(img2img.prompt(), "dryrun caption");

        let summary: Value =
            serde_json::from_str(&fs::read_to_string(out_dir.join("summary.json"))?)?;
        assert_eq!(summary["run_id"], json!("batch-01"));
        assert_eq!(summary["dry_run"], json!(true));
        assert_eq!(summary["dispatcher"], json!("dryrun"));

        let events = fs::read_to_string(out_dir.join("events.jsonl"))?;
        let types: Vec<String> = events
            .lines()
            .map(|line| serde_json::from_str::<Value>(line))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("run_started"));
        assert_eq!(types.last().map(String::as_str), Some("run_finished"));
        assert!(types.iter().any(|kind| kind == "notice"));
        assert!(types.iter().any(|kind| kind == "drafts_resolved"));
        assert_eq!(
            types.iter().filter(|kind| *kind == "query_dispatched").count(),
            2
        );
        Ok(())
    }

    #[test]
    fn transport_failure_is_logged_and_propagated() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out_dir = temp.path().join("run");
        let engine = BatchEngine::new(
            catalog(),
            Box::new(MemoryFiles::default()),
            Some(out_dir.clone()),
            None,
        )?;
        let dispatcher = CountingDispatcher {
            fail_at: Some(1),
            ..CountingDispatcher::default()
        };
        let cfg = config(json!({"prompts": [{"prompt": ["a", "b", "c"]}]}))?;
        let err = engine.run(&cfg, &dispatcher, false).unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));
        assert_eq!(dispatcher.sent.get(), 1);

        let events = fs::read_to_string(out_dir.join("events.jsonl"))?;
        assert!(events.contains("\"dispatch_failed\""));
        let summary: Value =
            serde_json::from_str(&fs::read_to_string(out_dir.join("summary.json"))?)?;
        assert_eq!(summary["dispatched"], json!(1));
        Ok(())
    }
}
