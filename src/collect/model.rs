//! Persisted entities: records, tasks, traces and sources.

use crate::features::keywords::MatchMode;
use crate::trace::TraceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_QUERY_LIMIT: usize = 20;
pub const MAX_QUERY_LIMIT: usize = 100;
pub const DEFAULT_TASK_LIST_LIMIT: usize = 50;
pub const ACTIVE: &str = "active";

// ── Records ──────────────────────────────────────────────────────────────────

/// A tender or notice, unique by `url`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenderRecord {
    pub id: u64,
    pub source_id: u64,
    pub title: String,
    pub amount: String,
    pub publish_date: String,
    pub deadline: String,
    pub contact: String,
    pub phone: String,
    pub url: String,
    /// Every keyword this record was found under, oldest first.
    pub keywords: Vec<String>,
    pub content: String,
    /// JSON list of `{url, name}`.
    pub attachments: String,
    pub status: String,
    pub tags: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What one collection pass knows about a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDraft {
    pub source_id: u64,
    pub url: String,
    pub title: String,
    pub publish_date: String,
    pub keyword: String,
    pub amount: String,
    pub deadline: String,
    pub contact: String,
    pub phone: String,
    pub content: String,
    pub attachments: String,
}

impl RecordDraft {
    /// Combine a list row with its (possibly empty) detail row.
    pub fn from_rows(
        source_id: u64,
        keyword: &str,
        list_row: &BTreeMap<String, String>,
        detail: &BTreeMap<String, String>,
    ) -> Self {
        let list = |k: &str| list_row.get(k).cloned().unwrap_or_default();
        let det = |k: &str| detail.get(k).cloned().unwrap_or_default();
        Self {
            source_id,
            url: list("url"),
            title: list("title"),
            publish_date: list("date"),
            keyword: keyword.to_string(),
            amount: det("amount"),
            deadline: det("deadline"),
            contact: det("contact"),
            phone: det("phone"),
            content: det("content"),
            attachments: det("attachments"),
        }
    }

    pub(crate) fn into_record(self, id: u64, now: DateTime<Utc>) -> TenderRecord {
        TenderRecord {
            id,
            source_id: self.source_id,
            title: self.title,
            amount: self.amount,
            publish_date: self.publish_date,
            deadline: self.deadline,
            contact: self.contact,
            phone: self.phone,
            url: self.url,
            keywords: if self.keyword.is_empty() {
                Vec::new()
            } else {
                vec![self.keyword]
            },
            content: self.content,
            attachments: self.attachments,
            status: ACTIVE.to_string(),
            tags: String::new(),
            note: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl TenderRecord {
    /// Field-level merge: non-empty differing values win, keyword history is
    /// appended. Returns whether anything changed.
    pub fn merge(&mut self, draft: &RecordDraft) -> bool {
        let mut changed = false;
        let slots = [
            (&mut self.amount, &draft.amount),
            (&mut self.deadline, &draft.deadline),
            (&mut self.contact, &draft.contact),
            (&mut self.phone, &draft.phone),
            (&mut self.content, &draft.content),
            (&mut self.attachments, &draft.attachments),
        ];
        for (stored, new) in slots {
            if !new.is_empty() && stored.as_str() != new.as_str() {
                stored.clone_from(new);
                changed = true;
            }
        }
        if !draft.keyword.is_empty() && !self.keywords.contains(&draft.keyword) {
            self.keywords.push(draft.keyword.clone());
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Skipped,
}

impl UpsertOutcome {
    /// Created and updated rows count as saved.
    pub fn is_saved(&self) -> bool {
        !matches!(self, UpsertOutcome::Skipped)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecordQuery {
    pub source_id: Option<u64>,
    pub status: Option<String>,
    pub keyword: Option<String>,
    pub match_mode: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub page: Option<usize>,
}

impl RecordQuery {
    pub fn page_size(&self) -> usize {
        match self.limit {
            Some(0) | None => DEFAULT_QUERY_LIMIT,
            Some(n) => n.min(MAX_QUERY_LIMIT),
        }
    }

    /// `page` (1-based) wins over `offset`.
    pub fn skip(&self) -> usize {
        match self.page {
            Some(p) if p > 0 => (p - 1) * self.page_size(),
            _ => self.offset.unwrap_or(0),
        }
    }

    pub fn match_mode(&self) -> MatchMode {
        self.match_mode
            .as_deref()
            .and_then(|m| m.parse().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub data: Vec<TenderRecord>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

// ── Tasks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionTask {
    pub id: String,
    pub source_id: u64,
    #[serde(default)]
    pub source_name: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
    pub status: TaskStatus,
    pub progress: u8,
    pub found: usize,
    pub saved: usize,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CollectionTask {
    pub fn new(source_id: u64, source_name: &str, keywords: Vec<String>, match_mode: MatchMode) -> Self {
        let now = Utc::now();
        Self {
            id: format!(
                "task_{}_{}_{:04x}",
                source_id,
                now.timestamp(),
                rand::random::<u16>()
            ),
            source_id,
            source_name: source_name.to_string(),
            keywords,
            match_mode,
            status: TaskStatus::Pending,
            progress: 0,
            found: 0,
            saved: 0,
            message: "task created, waiting to run".to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// The mutable subset of a task. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub found: Option<usize>,
    pub saved: Option<usize>,
    pub message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            completed_at: status.is_terminal().then(Utc::now),
            ..Self::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::default().with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_counts(mut self, found: usize, saved: usize) -> Self {
        self.found = Some(found);
        self.saved = Some(saved);
        self
    }

    /// Applies the update and reports whether the task changed. A task that
    /// already reached a terminal status is final and is left untouched.
    pub(crate) fn apply(self, task: &mut CollectionTask) -> bool {
        if task.status.is_terminal() {
            return false;
        }
        if let Some(s) = self.status {
            task.status = s;
        }
        if let Some(p) = self.progress {
            task.progress = p;
        }
        if let Some(f) = self.found {
            task.found = f;
        }
        if let Some(s) = self.saved {
            task.saved = s;
        }
        if let Some(m) = self.message {
            task.message = m;
        }
        if self.completed_at.is_some() {
            task.completed_at = self.completed_at;
        }
        task.updated_at = Utc::now();
        true
    }
}

// ── Traces & sources ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: u64,
    pub source_id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    /// Canonical trace JSON or a raw recording, as uploaded.
    pub raw_content: String,
    #[serde(default)]
    pub parsed_url: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TraceRecord {
    pub fn is_active(&self) -> bool {
        self.status == ACTIVE
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(amount: &str, contact: &str, keyword: &str) -> RecordDraft {
        RecordDraft {
            url: "https://x.test/d/1".into(),
            title: "软件开发项目".into(),
            amount: amount.into(),
            contact: contact.into(),
            keyword: keyword.into(),
            ..RecordDraft::default()
        }
    }

    #[test]
    fn test_merge_keeps_stored_values_for_empty_fields() {
        let mut rec = draft("100万", "张工", "软件").into_record(1, Utc::now());
        assert!(rec.merge(&draft("120万", "", "软件")));
        assert_eq!(rec.amount, "120万");
        assert_eq!(rec.contact, "张工");
        assert!(!rec.merge(&draft("120万", "", "软件")));
    }

    #[test]
    fn test_merge_appends_keyword_history() {
        let mut rec = draft("", "", "软件").into_record(1, Utc::now());
        assert!(rec.merge(&draft("", "", "开发")));
        assert!(!rec.merge(&draft("", "", "软件")));
        assert_eq!(rec.keywords, vec!["软件", "开发"]);
    }

    #[test]
    fn test_query_paging_rules() {
        let q = RecordQuery::default();
        assert_eq!((q.page_size(), q.skip()), (20, 0));

        let q = RecordQuery {
            limit: Some(500),
            offset: Some(7),
            ..RecordQuery::default()
        };
        assert_eq!((q.page_size(), q.skip()), (100, 7));

        let q = RecordQuery {
            limit: Some(10),
            offset: Some(7),
            page: Some(3),
            ..RecordQuery::default()
        };
        assert_eq!(q.skip(), 20);
    }

    #[test]
    fn test_task_id_shape_and_update() {
        let mut task = CollectionTask::new(3, "山东省政府采购网", vec!["软件".into()], MatchMode::Any);
        let parts: Vec<&str> = task.id.split('_').collect();
        assert_eq!(parts[0], "task");
        assert_eq!(parts[1], "3");
        assert_eq!(parts[3].len(), 4);

        assert!(TaskUpdate::status(TaskStatus::Completed)
            .with_progress(120)
            .with_counts(5, 2)
            .apply(&mut task));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!((task.found, task.saved), (5, 2));
        assert!(task.completed_at.is_some());

        assert!(!TaskUpdate::message("collecting 'x'")
            .with_progress(40)
            .apply(&mut task));
        assert_eq!(task.progress, 100);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut task = CollectionTask::new(1, "市平台", vec!["软件".into()], MatchMode::Any);
        assert!(TaskUpdate::status(TaskStatus::Cancelled)
            .with_message("task cancelled by user")
            .apply(&mut task));
        let completed_at = task.completed_at;

        // A running report that lost the race with cancel.
        assert!(!TaskUpdate::status(TaskStatus::Running)
            .with_message("preparing collection")
            .with_progress(10)
            .apply(&mut task));
        assert!(!TaskUpdate::status(TaskStatus::Completed).apply(&mut task));

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.message, "task cancelled by user");
        assert_eq!(task.completed_at, completed_at);
    }
}
