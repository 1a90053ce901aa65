//! List and detail extraction.

use super::{pause, Interpreter, ReplayError, Row};
use crate::scraping::session::{Locator, SessionError};
use crate::trace::model::CLICK_FIELD_PREFIX;
use crate::trace::{Pagination, Params};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

const URL_FIELD: &str = "url";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
}

/// Where a click-derived URL was found.
enum ClickTarget {
    /// The list page itself navigated; it must be restored.
    SameTab(String),
    /// A new tab opened; it has already been closed.
    NewTab(String),
}

fn contains_label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#":contains\(['"](.*?)['"]\)\s*(.*)$"#).expect("valid :contains regex")
    })
}

/// Label of a bare `tag:contains('label')` selector. `None` when the selector
/// has a trailing combinator (it already addresses the value element).
fn contains_label(selector: &str) -> Option<&str> {
    let caps = contains_label_regex().captures(selector)?;
    if !caps.get(2).map_or("", |m| m.as_str()).trim().is_empty() {
        return None;
    }
    caps.get(1).map(|m| m.as_str())
}

/// Text after the label and its `：`/`:` separator.
fn strip_label(text: &str, label: &str) -> String {
    let rest = match text.find(label) {
        Some(pos) => &text[pos + label.len()..],
        None => text,
    };
    rest.trim_start_matches(|c: char| c == '：' || c == ':' || c.is_whitespace())
        .trim()
        .to_string()
}

/// Resolve `href` against `base`. Script pseudo-links resolve to nothing.
fn resolve_href(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href == "#" || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    match url::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(u) => Some(u.to_string()),
        Err(_) => url::Url::parse(href).ok().map(|u| u.to_string()),
    }
}

impl Interpreter<'_> {
    // ── List ─────────────────────────────────────────────────────────────────

    pub(super) async fn extract_list(
        &self,
        row_selector: &str,
        fields: &BTreeMap<String, String>,
        pagination: Option<&Pagination>,
    ) -> Result<Vec<Row>, ReplayError> {
        let list_url = self.session.current_url().await?;
        let list_page = self.session.active_page().await?.id;
        let max_pages = pagination.map_or(1, |p| p.max_pages.max(1));
        let max_items = pagination.map_or(usize::MAX, |p| p.max_items);

        let mut rows: Vec<Row> = Vec::new();
        let mut seen_urls = HashSet::new();
        let mut page_no = 1;

        loop {
            let page_rows = self
                .read_list_page(row_selector, fields, &list_url, &list_page, page_no, pagination)
                .await?;
            let read = page_rows.len();
            for row in page_rows {
                if rows.len() >= max_items {
                    break;
                }
                let url = row.get(URL_FIELD).cloned().unwrap_or_default();
                if seen_urls.insert(url) {
                    rows.push(row);
                }
            }
            info!("📋 page {}: {} rows ({} total)", page_no, read, rows.len());

            let Some(p) = pagination else { break };
            if page_no >= max_pages || rows.len() >= max_items {
                break;
            }
            self.check_cancel()?;
            if !self.next_page(p, row_selector).await? {
                debug!("pagination stopped after page {}", page_no);
                break;
            }
            page_no += 1;
        }

        Ok(rows)
    }

    async fn read_list_page(
        &self,
        row_selector: &str,
        fields: &BTreeMap<String, String>,
        list_url: &str,
        list_page: &str,
        page_no: usize,
        pagination: Option<&Pagination>,
    ) -> Result<Vec<Row>, ReplayError> {
        let count = self.session.count(row_selector).await?;
        let mut rows = Vec::new();

        for index in 0..count {
            if rows.len() >= self.limits.max_items_per_page {
                info!("reached the per-page cap of {} items", self.limits.max_items_per_page);
                break;
            }
            self.check_cancel()?;

            let mut row = Row::new();
            let mut has_text = false;
            for (name, selector) in fields {
                if name == URL_FIELD {
                    continue;
                }
                let loc = Locator::within(row_selector, index, selector.as_str());
                if let Some(text) = self.session.text(&loc).await? {
                    has_text |= !text.is_empty();
                    row.insert(name.clone(), text);
                }
            }
            if !has_text {
                continue;
            }

            let url = match fields.get(URL_FIELD) {
                Some(selector) => {
                    self.row_url(row_selector, index, selector, list_url, list_page, page_no, pagination)
                        .await?
                }
                None => None,
            };
            match url {
                Some(url) => {
                    row.insert(URL_FIELD.to_string(), url);
                    rows.push(row);
                }
                None => debug!("row {} discarded: no url", index),
            }
        }
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    async fn row_url(
        &self,
        row_selector: &str,
        index: usize,
        selector: &str,
        list_url: &str,
        list_page: &str,
        page_no: usize,
        pagination: Option<&Pagination>,
    ) -> Result<Option<String>, ReplayError> {
        let target = match selector.strip_prefix(CLICK_FIELD_PREFIX) {
            Some(target) => if target.is_empty() { "span" } else { target },
            None => {
                let loc = Locator::within(row_selector, index, selector);
                if let Some(href) = self.session.attribute(&loc, "href").await? {
                    if let Some(url) = resolve_href(list_url, &href) {
                        return Ok(Some(url));
                    }
                }
                // SPA links without a usable href fall back to clicking.
                selector
            }
        };

        let loc = Locator::within(row_selector, index, target);
        match self.click_for_url(&loc, list_page).await {
            Ok(Some(ClickTarget::NewTab(url))) => Ok(Some(url)),
            Ok(Some(ClickTarget::SameTab(url))) => {
                self.return_to_list(list_url, page_no, pagination, row_selector)
                    .await?;
                Ok(Some(url))
            }
            Ok(None) => Ok(None),
            Err(ReplayError::ElementNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Click and watch for a URL change in this tab, then for a new tab.
    async fn click_for_url(
        &self,
        loc: &Locator,
        list_page: &str,
    ) -> Result<Option<ClickTarget>, ReplayError> {
        let origin = self.session.current_url().await?;
        let before: HashSet<String> = self
            .session
            .pages()
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        self.session.click(loc).await?;

        for _ in 0..self.limits.url_poll_attempts {
            pause(self.limits.url_poll_interval).await;
            let now = self.session.current_url().await?;
            if now != origin {
                return Ok(Some(ClickTarget::SameTab(now)));
            }
        }

        for page in self.session.pages().await? {
            if before.contains(&page.id) || page.url == origin || page.url.is_empty() {
                continue;
            }
            if page.url == "about:blank" {
                continue;
            }
            if let Err(e) = self.session.close_page(&page.id).await {
                warn!("failed to close detail tab: {}", e);
            }
            self.session.activate_page(list_page).await?;
            return Ok(Some(ClickTarget::NewTab(page.url)));
        }

        debug!("click on {} did not reveal a url", loc.describe());
        Ok(None)
    }

    /// Go back to the list after a same-tab navigation and re-advance to the
    /// page being read.
    async fn return_to_list(
        &self,
        list_url: &str,
        page_no: usize,
        pagination: Option<&Pagination>,
        row_selector: &str,
    ) -> Result<(), ReplayError> {
        self.session.navigate(list_url).await?;
        self.session.wait_stable(self.limits.page_timeout).await?;
        pause(self.limits.settle).await;

        if let Some(p) = pagination {
            for _ in 1..page_no {
                if !self.next_page(p, row_selector).await? {
                    warn!("could not re-advance to page {}", page_no);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Click the next-page control. `false` when there is no further page.
    async fn next_page(&self, p: &Pagination, row_selector: &str) -> Result<bool, ReplayError> {
        if self.session.count(&p.next_button).await? == 0 {
            return Ok(false);
        }
        let first_row = Locator::within(row_selector, 0, "");
        let before = self.session.text(&first_row).await?;

        match self.session.click(&Locator::first(p.next_button.as_str())).await {
            Ok(()) => {}
            Err(SessionError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.session.wait_stable(self.limits.page_timeout).await?;
        pause(self.limits.settle).await;

        let after = self.session.text(&first_row).await?;
        Ok(after.is_some() && after != before)
    }

    // ── Detail ───────────────────────────────────────────────────────────────

    pub(super) async fn extract_detail(
        &self,
        fields: &BTreeMap<String, String>,
        multi_fields: &BTreeMap<String, String>,
        params: &Params,
    ) -> Result<Row, ReplayError> {
        let mut row = Row::new();

        for (name, selector) in fields {
            let selector = params.substitute(selector);
            if let Some(value) = self.read_field(&selector).await? {
                row.insert(name.clone(), value);
            }
        }

        let page_url = self.session.current_url().await?;
        for (name, selector) in multi_fields {
            let selector = params.substitute(selector);
            let links = self.read_links(&selector, &page_url).await?;
            if !links.is_empty() {
                let json = serde_json::to_string(&links)
                    .map_err(|e| ReplayError::Session(SessionError::Browser(e.to_string())))?;
                row.insert(name.clone(), json);
            }
        }

        Ok(row)
    }

    /// Single-value field; label selectors yield the text after the label.
    async fn read_field(&self, selector: &str) -> Result<Option<String>, ReplayError> {
        let text = self.session.text(&Locator::first(selector)).await?;
        let Some(label) = contains_label(selector) else {
            return Ok(text.filter(|t| !t.is_empty()));
        };
        let Some(text) = text else {
            return Ok(None);
        };

        let value = strip_label(&text, label);
        if !value.is_empty() {
            return Ok(Some(value));
        }
        let sibling = format!("{} + *", selector);
        Ok(self
            .session
            .text(&Locator::first(sibling))
            .await?
            .filter(|t| !t.is_empty()))
    }

    async fn read_links(&self, selector: &str, page_url: &str) -> Result<Vec<Attachment>, ReplayError> {
        let count = self.session.count(selector).await?;
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for index in 0..count {
            let loc = Locator::Nth {
                selector: selector.to_string(),
                index,
            };
            let Some(href) = self.session.attribute(&loc, "href").await? else {
                continue;
            };
            let Some(url) = resolve_href(page_url, &href) else {
                continue;
            };
            if !seen.insert(url.clone()) {
                continue;
            }
            let name = self.session.text(&loc).await?.unwrap_or_default();
            links.push(Attachment { url, name });
        }
        Ok(links)
    }
}
