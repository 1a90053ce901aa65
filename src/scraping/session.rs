//! The browser seam used by the trace interpreter.
//!
//! Selectors handed to a session may be plain CSS, `xpath/<expr>`,
//! `pierce/<css>` or CSS with a `:contains('text')` pseudo-class followed by an
//! optional combinator (`span:contains('预算金额') + span`).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("element not found: {selector}")]
    NotFound { selector: String },

    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    #[error("navigation to {url} failed: {details}")]
    Navigation { url: String, details: String },

    #[error("browser error: {0}")]
    Browser(String),
}

/// Addresses one element on the active page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// First match of a selector.
    First(String),
    /// `index`-th match (0-based) of a selector.
    Nth { selector: String, index: usize },
    /// First match of `selector` inside the `index`-th match of `scope`.
    /// An empty `selector` addresses the scope element itself.
    Within {
        scope: String,
        index: usize,
        selector: String,
    },
}

impl Locator {
    pub fn first(selector: impl Into<String>) -> Self {
        Locator::First(selector.into())
    }

    pub fn within(scope: impl Into<String>, index: usize, selector: impl Into<String>) -> Self {
        Locator::Within {
            scope: scope.into(),
            index,
            selector: selector.into(),
        }
    }

    /// Human-readable form for error messages.
    pub fn describe(&self) -> String {
        match self {
            Locator::First(s) => s.clone(),
            Locator::Nth { selector, index } => format!("{}[{}]", selector, index),
            Locator::Within {
                scope,
                index,
                selector,
            } if selector.is_empty() => format!("{}[{}]", scope, index),
            Locator::Within {
                scope,
                index,
                selector,
            } => format!("{}[{}] {}", scope, index, selector),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub id: String,
    pub url: String,
}

/// One browser instance with one or more pages. All element operations target
/// the active page.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Open a blank page and make it active.
    async fn new_page(&self) -> Result<PageInfo, SessionError>;
    async fn navigate(&self, url: &str) -> Result<(), SessionError>;
    async fn current_url(&self) -> Result<String, SessionError>;

    /// Wait for the document to finish loading and the network to go quiet.
    async fn wait_stable(&self, timeout: Duration) -> Result<(), SessionError>;
    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), SessionError>;

    async fn count(&self, selector: &str) -> Result<usize, SessionError>;
    /// Visible text, trimmed. `None` when the element does not exist.
    async fn text(&self, locator: &Locator) -> Result<Option<String>, SessionError>;
    async fn attribute(&self, locator: &Locator, name: &str)
        -> Result<Option<String>, SessionError>;

    async fn click(&self, locator: &Locator) -> Result<(), SessionError>;
    async fn clear_and_type(&self, locator: &Locator, text: &str) -> Result<(), SessionError>;
    /// PNG bytes of the element.
    async fn screenshot(&self, locator: &Locator) -> Result<Vec<u8>, SessionError>;

    async fn pages(&self) -> Result<Vec<PageInfo>, SessionError>;
    async fn active_page(&self) -> Result<PageInfo, SessionError>;
    async fn activate_page(&self, id: &str) -> Result<(), SessionError>;
    async fn close_page(&self, id: &str) -> Result<(), SessionError>;

    async fn shutdown(&self) -> Result<(), SessionError>;
}

/// Produces fresh sessions; one per collection task.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError>;
}
