//! Trace interpreter.
//!
//! Executes a canonical [`Trace`] against a [`BrowserSession`], strictly in
//! step order. Any step failure aborts the rest of that execution and comes
//! back as a [`StepError`] carrying the step index and action.

mod extract;

use crate::features::captcha::{CaptchaError, CaptchaSolver};
use crate::scraping::session::{BrowserSession, Locator, SessionError};
use crate::trace::{Params, Step, Trace, TraceKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use extract::Attachment;

/// One extracted item: field name → value.
pub type Row = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    List(Vec<Row>),
    Detail(Row),
    /// The trace ran but produced nothing (no extract step reached).
    None,
}

impl Extraction {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Extraction::List(rows) => rows,
            Extraction::Detail(row) => vec![row],
            Extraction::None => Vec::new(),
        }
    }

    pub fn into_detail(self) -> Row {
        match self {
            Extraction::Detail(row) => row,
            _ => Row::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation timed out: {0}")]
    NavigationTimeout(String),

    #[error(transparent)]
    Captcha(#[from] CaptchaError),

    #[error("trace needs a captcha but no resolver is configured")]
    CaptchaUnconfigured,

    #[error("browser session error: {0}")]
    Session(SessionError),

    #[error("cancelled")]
    Cancelled,
}

impl From<SessionError> for ReplayError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound { selector } => ReplayError::ElementNotFound(selector),
            SessionError::Timeout { what } => ReplayError::NavigationTimeout(what),
            SessionError::Navigation { url, details } => {
                ReplayError::NavigationTimeout(format!("{}: {}", url, details))
            }
            other => ReplayError::Session(other),
        }
    }
}

#[derive(Debug, Error)]
#[error("step {index} ({action}) failed: {source}")]
pub struct StepError {
    pub index: usize,
    pub action: &'static str,
    #[source]
    pub source: ReplayError,
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, ReplayError::Cancelled)
    }
}

/// Timing and size bounds for one execution. Every browser wait is bounded.
#[derive(Debug, Clone)]
pub struct ReplayLimits {
    pub page_timeout: Duration,
    /// Pause after every step.
    pub step_pause: Duration,
    /// Pause before reading an extract step and after pagination/returns.
    pub settle: Duration,
    pub url_poll_attempts: usize,
    pub url_poll_interval: Duration,
    pub max_items_per_page: usize,
}

impl Default for ReplayLimits {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(30),
            step_pause: Duration::from_millis(300),
            settle: Duration::from_secs(2),
            url_poll_attempts: 10,
            url_poll_interval: Duration::from_millis(500),
            max_items_per_page: 10,
        }
    }
}

pub struct Interpreter<'a> {
    session: &'a dyn BrowserSession,
    captcha: Option<Arc<dyn CaptchaSolver>>,
    limits: ReplayLimits,
    cancel: Option<CancellationToken>,
}

impl<'a> Interpreter<'a> {
    pub fn new(session: &'a dyn BrowserSession) -> Self {
        Self {
            session,
            captcha: None,
            limits: ReplayLimits::default(),
            cancel: None,
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

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run `trace` on a fresh page, which is closed afterwards.
    pub async fn run(&self, trace: &Trace, params: &Params) -> Result<Extraction, StepError> {
        let first_action = trace.steps.first().map(Step::action).unwrap_or("extract");
        let page = self.session.new_page().await.map_err(|e| StepError {
            index: 0,
            action: first_action,
            source: e.into(),
        })?;

        info!(
            "▶️ replay '{}' ({}, {} steps)",
            trace.name,
            trace.kind,
            trace.steps.len()
        );
        let result = self.run_steps(trace, params).await;

        if let Err(e) = self.session.close_page(&page.id).await {
            warn!("failed to close replay page: {}", e);
        }
        result
    }

    async fn run_steps(&self, trace: &Trace, params: &Params) -> Result<Extraction, StepError> {
        let mut out = Extraction::None;
        for (index, step) in trace.steps.iter().enumerate() {
            debug!("step {}/{}: {}", index + 1, trace.steps.len(), step.action());
            let res = match self.check_cancel() {
                Ok(()) => self.exec(step, params).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(Some(extraction)) => out = extraction,
                Ok(None) => {}
                Err(source) => {
                    return Err(StepError {
                        index,
                        action: step.action(),
                        source,
                    })
                }
            }
            pause(self.limits.step_pause).await;
        }
        Ok(out)
    }

    fn check_cancel(&self) -> Result<(), ReplayError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(ReplayError::Cancelled),
            _ => Ok(()),
        }
    }

    async fn exec(&self, step: &Step, params: &Params) -> Result<Option<Extraction>, ReplayError> {
        match step {
            Step::Navigate { url } => {
                let url = params.substitute(url);
                self.session.navigate(&url).await?;
                self.session.wait_stable(self.limits.page_timeout).await?;
            }
            Step::Click { selector } => {
                let selector = params.substitute(selector);
                self.session.click(&Locator::first(selector)).await?;
            }
            Step::Input { selector, value } => {
                let selector = params.substitute(selector);
                let value = params.substitute(value);
                self.session
                    .clear_and_type(&Locator::first(selector), &value)
                    .await?;
            }
            Step::Wait {
                wait_time,
                wait_for_visible,
            } => {
                if let Some(ms) = wait_time {
                    pause(Duration::from_millis(*ms)).await;
                }
                if let Some(selector) = wait_for_visible {
                    let selector = params.substitute(selector);
                    self.session
                        .wait_visible(&selector, self.limits.page_timeout)
                        .await?;
                }
            }
            Step::Captcha {
                image_selector,
                input_selector,
            } => {
                let solver = self.captcha.as_ref().ok_or(ReplayError::CaptchaUnconfigured)?;
                let image = self
                    .session
                    .screenshot(&Locator::first(params.substitute(image_selector)))
                    .await?;
                let text = solver.resolve(&image).await?;
                self.session
                    .clear_and_type(&Locator::first(params.substitute(input_selector)), &text)
                    .await?;
                info!("✅ captcha entered");
            }
            Step::Extract {
                kind,
                selector,
                fields,
                multi_fields,
                pagination,
            } => {
                pause(self.limits.settle).await;
                let extraction = match kind {
                    TraceKind::List => {
                        let rows_selector = selector.as_deref().unwrap_or_default();
                        Extraction::List(
                            self.extract_list(rows_selector, fields, pagination.as_ref())
                                .await?,
                        )
                    }
                    TraceKind::Detail => {
                        Extraction::Detail(self.extract_detail(fields, multi_fields, params).await?)
                    }
                };
                return Ok(Some(extraction));
            }
        }
        Ok(None)
    }
}

async fn pause(d: Duration) {
    if !d.is_zero() {
        tokio::time::sleep(d).await;
    }
}
