//! Persistence for records, tasks, traces and sources.
//!
//! [`FileStore`] keeps each table in memory behind its own lock and mirrors it
//! to `<dir>/<table>.json` with an atomic write-then-rename. Every mutation
//! holds the table lock until the file is written, so an upsert's
//! read-compare-write is one atomic decision even across concurrent tasks.

use super::model::{
    CollectionTask, RecordDraft, RecordPage, RecordQuery, Source, TaskUpdate, TenderRecord,
    TraceRecord, UpsertOutcome, ACTIVE, DEFAULT_TASK_LIST_LIMIT,
};
use crate::features::keywords::{split_keywords, KeywordMatcher, MatchMode};
use crate::trace::TraceKind;
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store file {file}: {source}")]
    Corrupt {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or field-level merge keyed by URL.
    async fn upsert(&self, draft: &RecordDraft) -> Result<UpsertOutcome, StoreError>;
    async fn query(&self, query: &RecordQuery) -> Result<RecordPage, StoreError>;
    async fn get_by_url(&self, url: &str) -> Result<Option<TenderRecord>, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &CollectionTask) -> Result<(), StoreError>;
    async fn update(&self, id: &str, update: TaskUpdate) -> Result<CollectionTask, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<CollectionTask>, StoreError>;
    /// Newest first. `0` means the default limit.
    async fn list(&self, limit: usize) -> Result<Vec<CollectionTask>, StoreError>;
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Replace the trace for `(source_id, kind)` and mark it active.
    async fn save_trace(
        &self,
        source_id: u64,
        kind: TraceKind,
        name: &str,
        raw_content: &str,
        parsed_url: &str,
    ) -> Result<TraceRecord, StoreError>;
    async fn active_trace(
        &self,
        source_id: u64,
        kind: TraceKind,
    ) -> Result<Option<TraceRecord>, StoreError>;
    async fn list_traces(&self) -> Result<Vec<TraceRecord>, StoreError>;
    async fn delete_trace(&self, id: u64) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;
    async fn get_source(&self, id: u64) -> Result<Option<Source>, StoreError>;
    /// `id == 0` inserts, otherwise replaces.
    async fn save_source(&self, source: Source) -> Result<Source, StoreError>;
}

/// The four stores the orchestrator and HTTP layer work against.
#[derive(Clone)]
pub struct Stores {
    pub records: Arc<dyn RecordStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub traces: Arc<dyn TraceStore>,
    pub sources: Arc<dyn SourceStore>,
}

impl Stores {
    pub fn from_file_store(store: Arc<FileStore>) -> Self {
        Self {
            records: store.clone(),
            tasks: store.clone(),
            traces: store.clone(),
            sources: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

// ── File-backed implementation ───────────────────────────────────────────────

const RECORDS_FILE: &str = "tenders.json";
const TASKS_FILE: &str = "tasks.json";
const TRACES_FILE: &str = "traces.json";
const SOURCES_FILE: &str = "sources.json";

#[derive(Debug, Serialize, Deserialize)]
struct Table<T> {
    #[serde(default)]
    next_id: u64,
    #[serde(default = "Vec::new")]
    rows: Vec<T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            rows: Vec::new(),
        }
    }
}

impl<T> Table<T> {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }
}

#[derive(Debug)]
pub struct FileStore {
    dir: Option<PathBuf>,
    records: Mutex<Table<TenderRecord>>,
    tasks: Mutex<Table<CollectionTask>>,
    traces: Mutex<Table<TraceRecord>>,
    sources: Mutex<Table<Source>>,
}

async fn load_table<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<Table<T>, StoreError> {
    let path = dir.join(file);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            file: path.display().to_string(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Table::default()),
        Err(e) => Err(e.into()),
    }
}

impl FileStore {
    /// Open (or create) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let records: Table<TenderRecord> = load_table(&dir, RECORDS_FILE).await?;
        info!(
            "💾 store opened at {} ({} records)",
            dir.display(),
            records.rows.len()
        );
        Ok(Self {
            records: Mutex::new(records),
            tasks: Mutex::new(load_table(&dir, TASKS_FILE).await?),
            traces: Mutex::new(load_table(&dir, TRACES_FILE).await?),
            sources: Mutex::new(load_table(&dir, SOURCES_FILE).await?),
            dir: Some(dir),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            records: Mutex::new(Table::default()),
            tasks: Mutex::new(Table::default()),
            traces: Mutex::new(Table::default()),
            sources: Mutex::new(Table::default()),
        }
    }

    /// Atomic write via temp file + rename.
    async fn persist<T: Serialize>(&self, file: &str, table: &Table<T>) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(file);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(table)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("persisted {}", path.display());
        Ok(())
    }

    /// Insert `defaults` when no source exists yet.
    pub async fn seed_sources(&self, defaults: &[Source]) -> Result<usize, StoreError> {
        let mut table = self.sources.lock().await;
        if !table.rows.is_empty() || defaults.is_empty() {
            return Ok(0);
        }
        for source in defaults {
            let id = table.allocate_id();
            table.rows.push(Source {
                id,
                ..source.clone()
            });
        }
        self.persist(SOURCES_FILE, &*table).await?;
        info!("seeded {} sources", defaults.len());
        Ok(defaults.len())
    }
}

fn record_matches(record: &TenderRecord, query: &RecordQuery, matcher: Option<&KeywordMatcher>) -> bool {
    if let Some(id) = query.source_id.filter(|id| *id > 0) {
        if record.source_id != id {
            return false;
        }
    }
    if let Some(status) = query.status.as_deref().filter(|s| !s.is_empty()) {
        if record.status != status {
            return false;
        }
    }
    if let Some(from) = query.date_from.as_deref().filter(|s| !s.is_empty()) {
        if record.publish_date.as_str() < from {
            return false;
        }
    }
    if let Some(to) = query.date_to.as_deref().filter(|s| !s.is_empty()) {
        if record.publish_date.as_str() > to {
            return false;
        }
    }
    match matcher {
        None => true,
        Some(m) if m.mode() == MatchMode::Exact => m.is_match(&record.title),
        Some(m) => {
            let haystack = format!(
                "{}\n{}\n{}",
                record.title,
                record.keywords.join(","),
                record.content
            );
            m.is_match(&haystack)
        }
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn upsert(&self, draft: &RecordDraft) -> Result<UpsertOutcome, StoreError> {
        let mut table = self.records.lock().await;
        let now = Utc::now();

        // The table only keeps a change once it reached disk.
        match table.rows.iter().position(|r| r.url == draft.url) {
            Some(idx) => {
                let mut merged = table.rows[idx].clone();
                if !merged.merge(draft) {
                    return Ok(UpsertOutcome::Skipped);
                }
                merged.updated_at = now;
                let previous = std::mem::replace(&mut table.rows[idx], merged);
                if let Err(e) = self.persist(RECORDS_FILE, &*table).await {
                    table.rows[idx] = previous;
                    return Err(e);
                }
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let next_id = table.next_id;
                let id = table.allocate_id();
                table.rows.push(draft.clone().into_record(id, now));
                if let Err(e) = self.persist(RECORDS_FILE, &*table).await {
                    table.rows.pop();
                    table.next_id = next_id;
                    return Err(e);
                }
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn query(&self, query: &RecordQuery) -> Result<RecordPage, StoreError> {
        let matcher = query
            .keyword
            .as_deref()
            .map(split_keywords)
            .filter(|kws| !kws.is_empty())
            .map(|kws| KeywordMatcher::new(&kws, query.match_mode()));

        let table = self.records.lock().await;
        let mut hits: Vec<&TenderRecord> = table
            .rows
            .iter()
            .filter(|r| record_matches(r, query, matcher.as_ref()))
            .collect();
        hits.sort_by(|a, b| {
            b.publish_date
                .cmp(&a.publish_date)
                .then_with(|| b.id.cmp(&a.id))
        });

        let page_size = query.page_size();
        let total = hits.len();
        let data = hits
            .into_iter()
            .skip(query.skip())
            .take(page_size)
            .cloned()
            .collect();

        Ok(RecordPage {
            data,
            total,
            page: query.page.filter(|p| *p > 0).unwrap_or(1),
            page_size,
            total_pages: total.div_ceil(page_size),
        })
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<TenderRecord>, StoreError> {
        let table = self.records.lock().await;
        Ok(table.rows.iter().find(|r| r.url == url).cloned())
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn create(&self, task: &CollectionTask) -> Result<(), StoreError> {
        let mut table = self.tasks.lock().await;
        table.rows.push(task.clone());
        self.persist(TASKS_FILE, &*table).await
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<CollectionTask, StoreError> {
        let mut table = self.tasks.lock().await;
        let idx = table
            .rows
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        let mut next = table.rows[idx].clone();
        if !update.apply(&mut next) {
            return Ok(next);
        }
        let previous = std::mem::replace(&mut table.rows[idx], next.clone());
        if let Err(e) = self.persist(TASKS_FILE, &*table).await {
            table.rows[idx] = previous;
            return Err(e);
        }
        Ok(next)
    }

    async fn get(&self, id: &str) -> Result<Option<CollectionTask>, StoreError> {
        let table = self.tasks.lock().await;
        Ok(table.rows.iter().find(|t| t.id == id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<CollectionTask>, StoreError> {
        let limit = if limit == 0 { DEFAULT_TASK_LIST_LIMIT } else { limit };
        let table = self.tasks.lock().await;
        let mut tasks = table.rows.clone();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }
}

#[async_trait]
impl TraceStore for FileStore {
    async fn save_trace(
        &self,
        source_id: u64,
        kind: TraceKind,
        name: &str,
        raw_content: &str,
        parsed_url: &str,
    ) -> Result<TraceRecord, StoreError> {
        let mut table = self.traces.lock().await;
        let now = Utc::now();

        let saved = match table
            .rows
            .iter_mut()
            .find(|t| t.source_id == source_id && t.kind == kind)
        {
            Some(existing) => {
                existing.name = name.to_string();
                existing.raw_content = raw_content.to_string();
                existing.parsed_url = parsed_url.to_string();
                existing.status = ACTIVE.to_string();
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = TraceRecord {
                    id: table.allocate_id(),
                    source_id,
                    name: name.to_string(),
                    kind,
                    raw_content: raw_content.to_string(),
                    parsed_url: parsed_url.to_string(),
                    status: ACTIVE.to_string(),
                    created_at: now,
                    updated_at: now,
                };
                table.rows.push(record.clone());
                record
            }
        };

        self.persist(TRACES_FILE, &*table).await?;
        info!("trace saved: source_id={}, type={}", source_id, kind);
        Ok(saved)
    }

    async fn active_trace(
        &self,
        source_id: u64,
        kind: TraceKind,
    ) -> Result<Option<TraceRecord>, StoreError> {
        let table = self.traces.lock().await;
        Ok(table
            .rows
            .iter()
            .find(|t| t.source_id == source_id && t.kind == kind && t.is_active())
            .cloned())
    }

    async fn list_traces(&self) -> Result<Vec<TraceRecord>, StoreError> {
        let table = self.traces.lock().await;
        let mut rows = table.rows.clone();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn delete_trace(&self, id: u64) -> Result<bool, StoreError> {
        let mut table = self.traces.lock().await;
        let before = table.rows.len();
        table.rows.retain(|t| t.id != id);
        let removed = table.rows.len() != before;
        if removed {
            self.persist(TRACES_FILE, &*table).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl SourceStore for FileStore {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let table = self.sources.lock().await;
        let mut rows = table.rows.clone();
        rows.sort_by(|a, b| a.category.cmp(&b.category).then_with(|| a.name.cmp(&b.name)));
        Ok(rows)
    }

    async fn get_source(&self, id: u64) -> Result<Option<Source>, StoreError> {
        let table = self.sources.lock().await;
        Ok(table.rows.iter().find(|s| s.id == id).cloned())
    }

    async fn save_source(&self, mut source: Source) -> Result<Source, StoreError> {
        let mut table = self.sources.lock().await;
        if source.id == 0 {
            source.id = table.allocate_id();
            table.rows.push(source.clone());
        } else {
            let slot = table
                .rows
                .iter_mut()
                .find(|s| s.id == source.id)
                .ok_or_else(|| StoreError::NotFound(format!("source {}", source.id)))?;
            *slot = source.clone();
        }
        self.persist(SOURCES_FILE, &*table).await?;
        Ok(source)
    }
}
