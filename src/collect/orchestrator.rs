//! Collection task runner.
//!
//! A task walks source → keyword → row: replay the list trace for the
//! keyword, filter titles with the task's [`KeywordMatcher`], replay the
//! detail trace per surviving row and upsert the combined record. Progress
//! only moves forward, and every boundary checks the task's cancellation
//! token.

use crate::collect::model::{CollectionTask, RecordDraft, Source, TaskStatus, TaskUpdate};
use crate::collect::registry::{CancelRegistry, NotActive};
use crate::collect::store::{StoreError, Stores};
use crate::features::captcha::CaptchaSolver;
use crate::features::keywords::{KeywordMatcher, MatchMode};
use crate::replay::{Interpreter, ReplayLimits, Row};
use crate::scraping::session::{BrowserLauncher, BrowserSession, SessionError};
use crate::trace::{parse_trace_as, CompileError, Params, Trace, TraceKind};
use moka::future::Cache;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    NotActive(#[from] NotActive),

    #[error("source {0} not found")]
    SourceNotFound(u64),

    #[error("source {0} has no active list trace")]
    MissingListTrace(u64),

    #[error("at least one keyword is required")]
    NoKeywords,

    #[error("invalid trace: {0}")]
    Trace(#[from] CompileError),

    #[error("browser unavailable: {0}")]
    Browser(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,
}

/// A request to collect `keywords` from one source, or from every active
/// source when `source_id` is `0`.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectRequest {
    #[serde(default)]
    pub source_id: u64,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub found: usize,
    pub saved: usize,
}

// Progress milestones.
const PREPARED: u8 = 10;
const BROWSER_READY: u8 = 20;
const KEYWORD_SPAN: usize = 70;
const COLLECTED: u8 = 90;

/// Forward-only progress: never regresses and stays below 100 until the
/// run actually completes.
#[derive(Debug, Default)]
struct Progress {
    last: u8,
}

impl Progress {
    fn advance(&mut self, to: u8) -> u8 {
        self.last = self.last.max(to.min(99));
        self.last
    }
}

fn keyword_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return BROWSER_READY;
    }
    (BROWSER_READY as usize + done * KEYWORD_SPAN / total) as u8
}

/// Where one running task is and how it reports.
struct RunContext<'a> {
    task: &'a CollectionTask,
    token: CancellationToken,
    matcher: KeywordMatcher,
    progress: Progress,
    totals: Totals,
    done_units: usize,
    total_units: usize,
}

impl RunContext<'_> {
    fn check_cancel(&self) -> Result<(), OrchestratorError> {
        if self.token.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct Orchestrator {
    stores: Stores,
    registry: Arc<CancelRegistry>,
    launcher: Arc<dyn BrowserLauncher>,
    captcha: Option<Arc<dyn CaptchaSolver>>,
    limits: ReplayLimits,
    // Keyed by (trace id, updated_at millis) so a re-upload misses.
    trace_cache: Cache<(u64, i64), Arc<Trace>>,
}

impl Orchestrator {
    pub fn new(stores: Stores, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            stores,
            registry: Arc::new(CancelRegistry::new()),
            launcher,
            captcha: None,
            limits: ReplayLimits::default(),
            trace_cache: Cache::new(256),
        }
    }

    pub fn with_captcha(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.captcha = Some(solver);
        self
    }

    pub fn with_limits(mut self, limits: ReplayLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    /// Validate the request and persist a pending task.
    pub async fn prepare(&self, req: CollectRequest) -> Result<CollectionTask, OrchestratorError> {
        let keywords: Vec<String> = req
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        if keywords.is_empty() {
            return Err(OrchestratorError::NoKeywords);
        }

        let source_name = if req.source_id == 0 {
            "all active sources".to_string()
        } else {
            self.stores
                .sources
                .get_source(req.source_id)
                .await?
                .ok_or(OrchestratorError::SourceNotFound(req.source_id))?
                .name
        };

        let task = CollectionTask::new(req.source_id, &source_name, keywords, req.match_mode);
        self.stores.tasks.create(&task).await?;
        info!(task = %task.id, source = req.source_id, "📝 collection task created");
        Ok(task)
    }

    /// Create a task and run it in the background. Returns the pending task.
    pub async fn submit(self: &Arc<Self>, req: CollectRequest) -> Result<CollectionTask, OrchestratorError> {
        let task = self.prepare(req).await?;
        let this = Arc::clone(self);
        let pending = task.clone();
        tokio::spawn(async move {
            this.execute(pending).await;
        });
        Ok(task)
    }

    /// Run a prepared task to a terminal state and return its final record.
    pub async fn execute(&self, task: CollectionTask) -> CollectionTask {
        let token = self.registry.register(&task.id);
        self.report(
            &task.id,
            &token,
            TaskUpdate::status(TaskStatus::Running)
                .with_progress(PREPARED)
                .with_message("preparing collection"),
        )
        .await;

        let mut ctx = RunContext {
            task: &task,
            token: token.clone(),
            matcher: KeywordMatcher::new(&task.keywords, task.match_mode),
            progress: Progress::default(),
            totals: Totals::default(),
            done_units: 0,
            total_units: 0,
        };
        ctx.progress.advance(PREPARED);
        let result = self.collect(&mut ctx).await;
        let totals = ctx.totals;

        // Losing the registry entry means `cancel` already wrote the status.
        if self.registry.finish(&task.id) {
            let update = match result {
                Ok(()) => {
                    info!(
                        task = %task.id,
                        "✅ collection finished: {} found, {} saved",
                        totals.found,
                        totals.saved
                    );
                    TaskUpdate::status(TaskStatus::Completed)
                        .with_progress(100)
                        .with_counts(totals.found, totals.saved)
                        .with_message(format!(
                            "collection finished: {} found, {} saved",
                            totals.found, totals.saved
                        ))
                }
                Err(OrchestratorError::Cancelled) => TaskUpdate::status(TaskStatus::Cancelled)
                    .with_counts(totals.found, totals.saved)
                    .with_message("task cancelled"),
                Err(e) => {
                    error!(task = %task.id, "❌ collection failed: {}", e);
                    TaskUpdate::status(TaskStatus::Failed)
                        .with_counts(totals.found, totals.saved)
                        .with_message(format!("collection failed: {}", e))
                }
            };
            if let Err(e) = self.stores.tasks.update(&task.id, update).await {
                warn!(task = %task.id, "failed to record final task state: {}", e);
            }
        } else {
            info!(task = %task.id, "🛑 collection stopped after cancellation");
        }

        match self.stores.tasks.get(&task.id).await {
            Ok(Some(latest)) => latest,
            _ => task,
        }
    }

    /// Cancel a running task. Pending or finished tasks are not active.
    pub async fn cancel(&self, task_id: &str) -> Result<CollectionTask, OrchestratorError> {
        self.registry.cancel(task_id)?;
        info!(task = %task_id, "🛑 cancelling collection task");
        let task = self
            .stores
            .tasks
            .update(
                task_id,
                TaskUpdate::status(TaskStatus::Cancelled).with_message("task cancelled by user"),
            )
            .await?;
        Ok(task)
    }

    /// Intermediate status write. Suppressed once the task is cancelled so
    /// the cancelled message stays put.
    async fn report(&self, task_id: &str, token: &CancellationToken, update: TaskUpdate) {
        if token.is_cancelled() {
            return;
        }
        if let Err(e) = self.stores.tasks.update(task_id, update).await {
            warn!(task = %task_id, "failed to update task progress: {}", e);
        }
    }

    async fn progress(&self, ctx: &mut RunContext<'_>, to: u8, message: String) {
        let p = ctx.progress.advance(to);
        self.report(
            &ctx.task.id,
            &ctx.token,
            TaskUpdate::message(message)
                .with_progress(p)
                .with_counts(ctx.totals.found, ctx.totals.saved),
        )
        .await;
    }

    async fn resolve_sources(&self, source_id: u64) -> Result<Vec<Source>, OrchestratorError> {
        if source_id != 0 {
            let source = self
                .stores
                .sources
                .get_source(source_id)
                .await?
                .ok_or(OrchestratorError::SourceNotFound(source_id))?;
            return Ok(vec![source]);
        }
        Ok(self
            .stores
            .sources
            .list_sources()
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect())
    }

    async fn collect(&self, ctx: &mut RunContext<'_>) -> Result<(), OrchestratorError> {
        let sources = self.resolve_sources(ctx.task.source_id).await?;
        let single = ctx.task.source_id != 0;
        ctx.total_units = sources.len() * ctx.task.keywords.len();
        ctx.check_cancel()?;

        let session = self.launcher.launch().await?;
        self.progress(ctx, BROWSER_READY, "browser started".to_string())
            .await;

        let result = self
            .collect_sources(&*session, ctx, &sources, single)
            .await;
        if let Err(e) = session.shutdown().await {
            warn!("browser shutdown failed: {}", e);
        }
        result?;

        self.progress(
            ctx,
            COLLECTED,
            format!(
                "saving results: {} found, {} saved",
                ctx.totals.found, ctx.totals.saved
            ),
        )
        .await;
        Ok(())
    }

    async fn collect_sources(
        &self,
        session: &dyn BrowserSession,
        ctx: &mut RunContext<'_>,
        sources: &[Source],
        single: bool,
    ) -> Result<(), OrchestratorError> {
        for (index, source) in sources.iter().enumerate() {
            ctx.check_cancel()?;
            match self.collect_source(session, ctx, source).await {
                Ok(()) => {}
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(e) if single => return Err(e),
                Err(e) => {
                    warn!("⚠️ source {} ({}) skipped: {}", source.id, source.name, e);
                    // Keep the keyword span honest for the skipped source.
                    ctx.done_units = (index + 1) * ctx.task.keywords.len();
                }
            }
        }
        Ok(())
    }

    async fn collect_source(
        &self,
        session: &dyn BrowserSession,
        ctx: &mut RunContext<'_>,
        source: &Source,
    ) -> Result<(), OrchestratorError> {
        let list_trace = self
            .load_trace(source.id, TraceKind::List)
            .await?
            .ok_or(OrchestratorError::MissingListTrace(source.id))?;
        let detail_trace = match self.load_trace(source.id, TraceKind::Detail).await {
            Ok(Some(trace)) => Some(trace),
            Ok(None) => {
                info!("source {} has no detail trace, list fields only", source.id);
                None
            }
            Err(e) => {
                warn!("source {} detail trace unusable: {}", source.id, e);
                None
            }
        };

        let task = ctx.task;
        let interpreter = self.interpreter(session, &ctx.token);
        for keyword in &task.keywords {
            ctx.check_cancel()?;
            let at = keyword_progress(ctx.done_units, ctx.total_units);
            self.progress(ctx, at, format!("collecting '{}' from {}", keyword, source.name))
                .await;

            let rows = match interpreter.run(&list_trace, &Params::keyword(keyword)).await {
                Ok(extraction) => extraction.into_rows(),
                Err(e) if e.is_cancelled() => return Err(OrchestratorError::Cancelled),
                Err(e) => {
                    warn!("⚠️ list replay for '{}' on {} failed: {}", keyword, source.name, e);
                    ctx.done_units += 1;
                    continue;
                }
            };
            info!("📋 '{}' on {}: {} rows", keyword, source.name, rows.len());

            for row in rows {
                ctx.check_cancel()?;
                self.collect_row(&interpreter, ctx, source, keyword, row, detail_trace.as_deref())
                    .await?;
            }
            ctx.done_units += 1;
        }
        Ok(())
    }

    async fn collect_row(
        &self,
        interpreter: &Interpreter<'_>,
        ctx: &mut RunContext<'_>,
        source: &Source,
        keyword: &str,
        row: Row,
        detail_trace: Option<&Trace>,
    ) -> Result<(), OrchestratorError> {
        let title = row.get("title").map(String::as_str).unwrap_or_default();
        if !ctx.matcher.is_match(title) {
            return Ok(());
        }
        ctx.totals.found += 1;

        let url = row.get("url").cloned().unwrap_or_default();
        let detail = match detail_trace {
            Some(trace) => match interpreter.run(trace, &Params::detail_url(&url)).await {
                Ok(extraction) => extraction.into_detail(),
                Err(e) if e.is_cancelled() => return Err(OrchestratorError::Cancelled),
                Err(e) => {
                    warn!("⚠️ detail replay for {} failed, row skipped: {}", url, e);
                    return Ok(());
                }
            },
            None => Row::new(),
        };

        let draft = RecordDraft::from_rows(source.id, keyword, &row, &detail);
        match self.stores.records.upsert(&draft).await {
            Ok(outcome) => {
                if outcome.is_saved() {
                    ctx.totals.saved += 1;
                }
                info!("💾 {:?}: {}", outcome, draft.title);
            }
            Err(e) => warn!("failed to store {}: {}", draft.url, e),
        }
        Ok(())
    }

    fn interpreter<'s>(&self, session: &'s dyn BrowserSession, token: &CancellationToken) -> Interpreter<'s> {
        let mut interpreter = Interpreter::new(session)
            .with_limits(self.limits.clone())
            .with_cancel(token.clone());
        if let Some(solver) = &self.captcha {
            interpreter = interpreter.with_captcha(Arc::clone(solver));
        }
        interpreter
    }

    /// The active trace for `(source_id, kind)`, parsed once per revision.
    pub async fn load_trace(
        &self,
        source_id: u64,
        kind: TraceKind,
    ) -> Result<Option<Arc<Trace>>, OrchestratorError> {
        let Some(record) = self.stores.traces.active_trace(source_id, kind).await? else {
            return Ok(None);
        };
        let key = (record.id, record.updated_at.timestamp_millis());
        if let Some(trace) = self.trace_cache.get(&key).await {
            return Ok(Some(trace));
        }
        let trace = Arc::new(parse_trace_as(&record.raw_content, Some(kind))?);
        self.trace_cache.insert(key, Arc::clone(&trace)).await;
        Ok(Some(trace))
    }
}

/// Seed traces from `<dir>/<source code>_<list|detail>.json` for sources
/// that have none stored yet. Returns how many were imported.
pub async fn import_trace_files(stores: &Stores, dir: &Path) -> Result<usize, OrchestratorError> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut imported = 0;
    for source in stores.sources.list_sources().await? {
        for kind in [TraceKind::List, TraceKind::Detail] {
            if stores.traces.active_trace(source.id, kind).await?.is_some() {
                continue;
            }
            let path = dir.join(format!("{}_{}.json", source.code, kind.as_str()));
            let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let trace = match parse_trace_as(&raw, Some(kind)) {
                Ok(t) => t,
                Err(e) => {
                    warn!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            stores
                .traces
                .save_trace(source.id, kind, &trace.name, &raw, &trace.entry_url)
                .await?;
            info!("📥 imported {} trace for {} from {}", kind, source.code, path.display());
            imported += 1;
        }
    }
    Ok(imported)
}
