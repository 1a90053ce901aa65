//! Trace compiler: raw recorder export → canonical [`Trace`].
//!
//! Pass 1 finds structure (list-row clicks that navigate, pagination
//! controls, row field layout). Pass 2 walks events in order and synthesizes
//! steps. Compilation is a pure function of the recording.

use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

use super::heuristics::{self, InputRole, ListFieldInfo};
use super::model::{placeholder, Pagination, Step, Trace, TraceKind, KEYWORD_PARAM, URL_PARAM};
use super::recording::{RawEvent, RawRecording};
use super::selector::best_selector;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("malformed trace JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown trace type '{0}' (expected list or detail)")]
    UnknownKind(String),
    #[error("invalid trace: {0}")]
    Invalid(String),
}

pub const NAVIGATE_WAIT_MS: u64 = 2000;
pub const CLICK_WAIT_MS: u64 = 2000;
pub const SEARCH_WAIT_MS: u64 = 3000;

const DETAIL_FIELDS: &[(&str, &str)] = &[
    ("amount", "span:contains('预算金额')"),
    ("contact", "span:contains('联系人')"),
    ("phone", "span:contains('联系电话')"),
];

pub const ATTACHMENTS_FIELD: &str = "attachments";
const ATTACHMENT_LINKS: &str = "a[href$='.pdf'], a[href$='.doc'], a[href$='.docx'], a[href$='.xls'], \
a[href$='.xlsx'], a[href$='.zip'], a[href$='.rar'], a[href*='download']";

// ── Entry points ─────────────────────────────────────────────────────────────

/// Parse either a canonical trace or a raw recording (compiled on the fly).
pub fn parse_trace(content: &str) -> Result<Trace, CompileError> {
    parse_trace_as(content, None)
}

/// Like [`parse_trace`], with the expected trace type when the caller knows it.
/// Raw recordings compile as `kind`; canonical traces must already match it.
pub fn parse_trace_as(content: &str, kind: Option<TraceKind>) -> Result<Trace, CompileError> {
    let value: serde_json::Value = serde_json::from_str(content)?;

    let is_canonical = value
        .get("steps")
        .and_then(|s| s.get(0))
        .and_then(|s| s.get("action"))
        .is_some();

    if is_canonical {
        let trace: Trace = serde_json::from_value(value)?;
        trace.validate()?;
        if let Some(expected) = kind {
            if trace.kind != expected {
                return Err(CompileError::Invalid(format!(
                    "trace is {} but {} was expected",
                    trace.kind, expected
                )));
            }
        }
        return Ok(trace);
    }

    let recording: RawRecording = serde_json::from_value(value)?;
    let kind = kind.unwrap_or_else(|| infer_kind(&recording));
    let trace = compile(&recording, kind);
    info!(
        "📝 recording compiled: {} events → {} steps ({})",
        recording.steps.len(),
        trace.steps.len(),
        kind
    );
    Ok(trace)
}

pub fn compile_str(content: &str, kind: TraceKind) -> Result<Trace, CompileError> {
    let recording: RawRecording = serde_json::from_str(content)?;
    Ok(compile(&recording, kind))
}

/// A recording of a detail page mentions it in its URL or title.
pub fn infer_kind(recording: &RawRecording) -> TraceKind {
    let url = entry_url(recording);
    if url.contains("detail") || recording.title.contains("详情") {
        TraceKind::Detail
    } else {
        TraceKind::List
    }
}

fn entry_url(recording: &RawRecording) -> String {
    if !recording.url.is_empty() {
        return recording.url.clone();
    }
    recording
        .steps
        .iter()
        .find(|e| e.is("navigate") && !e.url.is_empty())
        .map(|e| e.url.clone())
        .unwrap_or_default()
}

/// Compile a recording into a canonical trace of the given type.
pub fn compile(recording: &RawRecording, kind: TraceKind) -> Trace {
    let analysis = Analysis::run(recording);

    let (start, end) = match kind {
        // A list flow ends where a row click leaves the list page.
        TraceKind::List => (0, analysis.row_click.unwrap_or(recording.steps.len())),
        // A detail flow starts at the detail page itself.
        TraceKind::Detail => (
            recording
                .steps
                .iter()
                .rposition(|e| e.is("navigate") && !e.url.is_empty())
                .unwrap_or(0),
            recording.steps.len(),
        ),
    };

    let mut synth = Synthesizer::new(kind, start);
    for idx in start..end {
        synth.event(idx, &recording.steps[idx], &analysis);
    }
    let mut steps = synth.finish();
    steps.push(extract_step(kind, &analysis, &steps));

    Trace {
        name: recording.title.clone(),
        kind,
        entry_url: entry_url(recording),
        steps,
    }
}

// ── Pass 1: structural analysis ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct Analysis {
    /// First click on a list row that caused a page transition.
    row_click: Option<usize>,
    list_fields: Option<ListFieldInfo>,
    container: Option<&'static str>,
    pagination: Option<String>,
    /// Clicks immediately followed by `navigate`.
    navigation_clicks: HashSet<usize>,
}

impl Analysis {
    fn run(recording: &RawRecording) -> Self {
        let mut a = Analysis::default();
        for (idx, event) in recording.steps.iter().enumerate() {
            if !event.is_click() {
                continue;
            }
            let selector = best_selector(&event.candidate_selectors);
            if selector.is_empty() {
                continue;
            }

            if recording.followed_by_navigate(idx) {
                a.navigation_clicks.insert(idx);
                if a.row_click.is_none() && heuristics::is_list_row(&selector) {
                    debug!("list navigation click at event {}: {}", idx, selector);
                    a.row_click = Some(idx);
                    a.list_fields = heuristics::infer_list_fields(&event.candidate_selectors);
                    a.container = heuristics::list_container(&selector).or_else(|| {
                        event
                            .candidate_selectors
                            .iter()
                            .flatten()
                            .find_map(|s| heuristics::list_container(s))
                    });
                }
                continue;
            }

            if a.pagination.is_none() && heuristics::is_pagination_control(&selector) {
                debug!("pagination control at event {}: {}", idx, selector);
                a.pagination = Some(selector);
            }
        }
        a
    }
}

// ── Pass 2: step synthesis ───────────────────────────────────────────────────

struct Synthesizer {
    kind: TraceKind,
    start: usize,
    steps: Vec<Step>,
    /// Latest `change` not yet emitted: (selector, value).
    pending: Option<(String, String)>,
    last_click: Option<String>,
}

impl Synthesizer {
    fn new(kind: TraceKind, start: usize) -> Self {
        Self {
            kind,
            start,
            steps: Vec::new(),
            pending: None,
            last_click: None,
        }
    }

    fn event(&mut self, idx: usize, event: &RawEvent, analysis: &Analysis) {
        if event.is_noise() {
            return;
        }
        match event.kind.as_str() {
            "navigate" => {
                self.flush();
                let url = if self.kind == TraceKind::Detail && idx == self.start {
                    placeholder(URL_PARAM)
                } else {
                    event.url.clone()
                };
                if url.is_empty() {
                    return;
                }
                self.steps.push(Step::Navigate { url });
                self.steps.push(Step::wait_ms(NAVIGATE_WAIT_MS));
            }
            "click" | "doubleClick" => {
                let selector = best_selector(&event.candidate_selectors);
                if selector.is_empty()
                    || analysis.navigation_clicks.contains(&idx)
                    || heuristics::is_pagination_control(&selector)
                    || heuristics::is_input_container(&selector)
                {
                    return;
                }
                self.flush();
                if self.ends_with_click(&selector) {
                    return;
                }
                let wait = if heuristics::is_search_button(&selector) {
                    SEARCH_WAIT_MS
                } else {
                    CLICK_WAIT_MS
                };
                self.steps.push(Step::Click {
                    selector: selector.clone(),
                });
                self.steps.push(Step::wait_ms(wait));
                self.last_click = Some(selector);
            }
            "change" => {
                let selector = best_selector(&event.candidate_selectors);
                if selector.is_empty() {
                    return;
                }
                match self.pending.as_mut() {
                    Some((pending_sel, value)) if *pending_sel == selector => {
                        *value = event.value.clone();
                    }
                    _ => {
                        self.flush();
                        self.pending = Some((selector, event.value.clone()));
                    }
                }
            }
            "waitForElement" => {
                self.flush();
                let selector = best_selector(&event.candidate_selectors);
                if !selector.is_empty() {
                    self.steps.push(Step::Wait {
                        wait_time: None,
                        wait_for_visible: Some(selector),
                    });
                }
            }
            other => debug!("ignoring recorder event '{}'", other),
        }
    }

    fn ends_with_click(&self, selector: &str) -> bool {
        matches!(
            self.steps.as_slice(),
            [.., Step::Click { selector: prev }, Step::Wait { .. }] if prev == selector
        )
    }

    fn flush(&mut self) {
        let Some((selector, value)) = self.pending.take() else {
            return;
        };
        if value.is_empty() {
            return;
        }
        match heuristics::classify_input(&selector, &value) {
            InputRole::Captcha => {
                let image_selector = match self.last_click.clone() {
                    Some(img) => {
                        // Clicking the image only refreshed it.
                        if heuristics::is_captcha_image(&img) && self.ends_with_click(&img) {
                            self.steps.truncate(self.steps.len() - 2);
                        }
                        img
                    }
                    None => heuristics::DEFAULT_CAPTCHA_IMAGE.to_string(),
                };
                self.steps.push(Step::Captcha {
                    image_selector,
                    input_selector: selector,
                });
            }
            InputRole::Keyword => self.steps.push(Step::Input {
                selector,
                value: placeholder(KEYWORD_PARAM),
            }),
            InputRole::Literal => self.steps.push(Step::Input { selector, value }),
        }
    }

    fn finish(mut self) -> Vec<Step> {
        self.flush();
        self.steps
    }
}

// ── Finalization ─────────────────────────────────────────────────────────────

fn extract_step(kind: TraceKind, analysis: &Analysis, steps: &[Step]) -> Step {
    match kind {
        TraceKind::List => {
            let info = analysis.list_fields.clone().unwrap_or_default();
            let container = analysis
                .container
                .or_else(|| {
                    steps.iter().find_map(|s| match s {
                        Step::Click { selector } => heuristics::list_container(selector),
                        _ => None,
                    })
                })
                .unwrap_or(heuristics::DEFAULT_LIST_CONTAINER);

            Step::Extract {
                kind,
                selector: Some(container.to_string()),
                fields: BTreeMap::from([
                    ("title".to_string(), info.title_selector),
                    ("date".to_string(), info.date_selector),
                    ("url".to_string(), info.url_selector),
                ]),
                multi_fields: BTreeMap::new(),
                pagination: analysis.pagination.as_deref().map(Pagination::for_control),
            }
        }
        TraceKind::Detail => Step::Extract {
            kind,
            selector: None,
            fields: DETAIL_FIELDS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            multi_fields: BTreeMap::from([(ATTACHMENTS_FIELD.to_string(), ATTACHMENT_LINKS.to_string())]),
            pagination: None,
        },
    }
}
