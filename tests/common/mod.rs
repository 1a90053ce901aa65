//! Scripted in-memory browser for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tender_scout::replay::ReplayLimits;
use tender_scout::scraping::session::{
    BrowserLauncher, BrowserSession, Locator, PageInfo, SessionError,
};

#[derive(Debug, Clone)]
pub enum ClickEffect {
    SameTab(String),
    NewTab(String),
    Nothing,
}

#[derive(Debug, Clone, Default)]
pub struct FakeRow {
    pub texts: HashMap<String, String>,
    pub hrefs: HashMap<String, String>,
    pub clicks: HashMap<String, ClickEffect>,
}

impl FakeRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, selector: &str, text: &str) -> Self {
        self.texts.insert(selector.into(), text.into());
        self
    }

    pub fn href(mut self, selector: &str, href: &str) -> Self {
        self.hrefs.insert(selector.into(), href.into());
        self
    }

    pub fn click(mut self, selector: &str, effect: ClickEffect) -> Self {
        self.clicks.insert(selector.into(), effect);
        self
    }

    fn whole_text(&self) -> String {
        let mut parts: Vec<(&String, &String)> = self.texts.iter().collect();
        parts.sort();
        parts
            .into_iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One page of the fake site.
#[derive(Debug, Clone, Default)]
pub struct FakeDoc {
    pub row_selector: String,
    pub rows: Vec<FakeRow>,
    pub texts: HashMap<String, String>,
    pub inputs: Vec<String>,
    pub buttons: HashMap<String, ClickEffect>,
    pub next: Option<(String, String)>,
    pub links: Option<(String, Vec<(String, String)>)>,
}

impl FakeDoc {
    pub fn list(row_selector: &str, rows: Vec<FakeRow>) -> Self {
        Self {
            row_selector: row_selector.into(),
            rows,
            ..Self::default()
        }
    }

    pub fn text(mut self, selector: &str, text: &str) -> Self {
        self.texts.insert(selector.into(), text.into());
        self
    }

    pub fn input(mut self, selector: &str) -> Self {
        self.inputs.push(selector.into());
        self
    }

    pub fn button(mut self, selector: &str, effect: ClickEffect) -> Self {
        self.buttons.insert(selector.into(), effect);
        self
    }

    pub fn next_page(mut self, selector: &str, url: &str) -> Self {
        self.next = Some((selector.into(), url.into()));
        self
    }

    pub fn links(mut self, selector: &str, links: &[(&str, &str)]) -> Self {
        self.links = Some((
            selector.into(),
            links
                .iter()
                .map(|(h, t)| (h.to_string(), t.to_string()))
                .collect(),
        ));
        self
    }
}

#[derive(Debug, Default)]
pub struct SiteState {
    pub docs: HashMap<String, FakeDoc>,
    /// Every navigation, typed value and click, in order.
    pub log: Vec<String>,
    pub launches: usize,
    pub shutdowns: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSite {
    pub state: Arc<Mutex<SiteState>>,
    pub navigate_delay: Duration,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, doc: FakeDoc) -> Self {
        self.state.lock().unwrap().docs.insert(url.into(), doc);
        self
    }

    pub fn with_navigate_delay(mut self, delay: Duration) -> Self {
        self.navigate_delay = delay;
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().launches
    }

    pub fn shutdowns(&self) -> usize {
        self.state.lock().unwrap().shutdowns
    }

    pub fn session(&self) -> FakeSession {
        FakeSession {
            site: self.clone(),
            pages: Mutex::new(Pages::default()),
        }
    }

    pub fn launcher(&self) -> Arc<FakeLauncher> {
        Arc::new(FakeLauncher { site: self.clone() })
    }

    fn doc(&self, url: &str) -> FakeDoc {
        let base = url.split('#').next().unwrap_or(url);
        self.state
            .lock()
            .unwrap()
            .docs
            .get(base)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, entry: String) {
        self.state.lock().unwrap().log.push(entry);
    }
}

#[derive(Debug, Default)]
struct Pages {
    pages: Vec<PageInfo>,
    active: Option<String>,
    next_id: usize,
}

impl Pages {
    fn open(&mut self, url: &str) -> PageInfo {
        self.next_id += 1;
        let page = PageInfo {
            id: format!("page-{}", self.next_id),
            url: url.to_string(),
        };
        self.pages.push(page.clone());
        page
    }

    fn active_mut(&mut self) -> Result<&mut PageInfo, SessionError> {
        let id = self
            .active
            .clone()
            .ok_or_else(|| SessionError::Browser("no active page".into()))?;
        self.pages
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| SessionError::Browser("active page closed".into()))
    }
}

pub struct FakeSession {
    site: FakeSite,
    pages: Mutex<Pages>,
}

impl FakeSession {
    fn active_url(&self) -> Result<String, SessionError> {
        Ok(self.pages.lock().unwrap().active_mut()?.url.clone())
    }

    fn active_doc(&self) -> Result<FakeDoc, SessionError> {
        Ok(self.site.doc(&self.active_url()?))
    }

    fn apply(&self, effect: &ClickEffect) -> Result<(), SessionError> {
        let mut pages = self.pages.lock().unwrap();
        match effect {
            ClickEffect::SameTab(url) => pages.active_mut()?.url = url.clone(),
            ClickEffect::NewTab(url) => {
                pages.open(url);
            }
            ClickEffect::Nothing => {}
        }
        Ok(())
    }
}

fn not_found(locator: &Locator) -> SessionError {
    SessionError::NotFound {
        selector: locator.describe(),
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn new_page(&self) -> Result<PageInfo, SessionError> {
        let mut pages = self.pages.lock().unwrap();
        let page = pages.open("about:blank");
        pages.active = Some(page.id.clone());
        Ok(page)
    }

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        if !self.site.navigate_delay.is_zero() {
            tokio::time::sleep(self.site.navigate_delay).await;
        }
        self.site.record(format!("navigate {}", url));
        self.pages.lock().unwrap().active_mut()?.url = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.active_url()
    }

    async fn wait_stable(&self, _timeout: Duration) -> Result<(), SessionError> {
        Ok(())
    }

    async fn wait_visible(&self, selector: &str, _timeout: Duration) -> Result<(), SessionError> {
        let doc = self.active_doc()?;
        if doc.texts.contains_key(selector) || doc.row_selector == selector {
            Ok(())
        } else {
            Err(SessionError::Timeout {
                what: format!("{} to become visible", selector),
            })
        }
    }

    async fn count(&self, selector: &str) -> Result<usize, SessionError> {
        let doc = self.active_doc()?;
        if !doc.row_selector.is_empty() && doc.row_selector == selector {
            return Ok(doc.rows.len());
        }
        if let Some((sel, _)) = &doc.next {
            if sel == selector {
                return Ok(1);
            }
        }
        if let Some((sel, links)) = &doc.links {
            if sel == selector {
                return Ok(links.len());
            }
        }
        Ok(usize::from(doc.texts.contains_key(selector)))
    }

    async fn text(&self, locator: &Locator) -> Result<Option<String>, SessionError> {
        let doc = self.active_doc()?;
        Ok(match locator {
            Locator::First(sel) => doc.texts.get(sel).cloned(),
            Locator::Nth { selector, index } => doc
                .links
                .as_ref()
                .filter(|(sel, _)| sel == selector)
                .and_then(|(_, links)| links.get(*index))
                .map(|(_, text)| text.clone()),
            Locator::Within {
                index, selector, ..
            } => doc.rows.get(*index).and_then(|row| {
                if selector.is_empty() {
                    Some(row.whole_text())
                } else {
                    row.texts.get(selector).cloned()
                }
            }),
        })
    }

    async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        if name != "href" {
            return Ok(None);
        }
        let doc = self.active_doc()?;
        Ok(match locator {
            Locator::First(_) => None,
            Locator::Nth { selector, index } => doc
                .links
                .as_ref()
                .filter(|(sel, _)| sel == selector)
                .and_then(|(_, links)| links.get(*index))
                .map(|(href, _)| href.clone()),
            Locator::Within {
                index, selector, ..
            } => doc
                .rows
                .get(*index)
                .and_then(|row| row.hrefs.get(selector).cloned()),
        })
    }

    async fn click(&self, locator: &Locator) -> Result<(), SessionError> {
        let doc = self.active_doc()?;
        self.site.record(format!("click {}", locator.describe()));
        let effect = match locator {
            Locator::First(sel) => match &doc.next {
                Some((next_sel, url)) if next_sel == sel => ClickEffect::SameTab(url.clone()),
                _ => doc
                    .buttons
                    .get(sel)
                    .cloned()
                    .ok_or_else(|| not_found(locator))?,
            },
            Locator::Within {
                index, selector, ..
            } => {
                let row = doc.rows.get(*index).ok_or_else(|| not_found(locator))?;
                match row.clicks.get(selector) {
                    Some(effect) => effect.clone(),
                    None if row.texts.contains_key(selector) => ClickEffect::Nothing,
                    None => return Err(not_found(locator)),
                }
            }
            Locator::Nth { .. } => return Err(not_found(locator)),
        };
        self.apply(&effect)
    }

    async fn clear_and_type(&self, locator: &Locator, text: &str) -> Result<(), SessionError> {
        let doc = self.active_doc()?;
        let selector = match locator {
            Locator::First(sel) => sel.as_str(),
            _ => return Err(not_found(locator)),
        };
        if !doc.inputs.iter().any(|i| i == selector) {
            return Err(not_found(locator));
        }
        self.site.record(format!("type {} = {}", selector, text));
        Ok(())
    }

    async fn screenshot(&self, locator: &Locator) -> Result<Vec<u8>, SessionError> {
        let doc = self.active_doc()?;
        match locator {
            Locator::First(sel) if doc.texts.contains_key(sel) => Ok(b"\x89PNG fake".to_vec()),
            _ => Err(not_found(locator)),
        }
    }

    async fn pages(&self) -> Result<Vec<PageInfo>, SessionError> {
        Ok(self.pages.lock().unwrap().pages.clone())
    }

    async fn active_page(&self) -> Result<PageInfo, SessionError> {
        Ok(self.pages.lock().unwrap().active_mut()?.clone())
    }

    async fn activate_page(&self, id: &str) -> Result<(), SessionError> {
        let mut pages = self.pages.lock().unwrap();
        if !pages.pages.iter().any(|p| p.id == id) {
            return Err(SessionError::Browser(format!("no page {}", id)));
        }
        pages.active = Some(id.to_string());
        Ok(())
    }

    async fn close_page(&self, id: &str) -> Result<(), SessionError> {
        let mut pages = self.pages.lock().unwrap();
        pages.pages.retain(|p| p.id != id);
        if pages.active.as_deref() == Some(id) {
            pages.active = pages.pages.last().map(|p| p.id.clone());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        self.site.state.lock().unwrap().shutdowns += 1;
        Ok(())
    }
}

pub struct FakeLauncher {
    site: FakeSite,
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        self.site.state.lock().unwrap().launches += 1;
        Ok(Box::new(self.site.session()))
    }
}

/// No pauses and a short URL poll so tests run in milliseconds.
pub fn fast_limits() -> ReplayLimits {
    ReplayLimits {
        step_pause: Duration::ZERO,
        settle: Duration::ZERO,
        url_poll_attempts: 2,
        url_poll_interval: Duration::from_millis(1),
        ..ReplayLimits::default()
    }
}

pub const LIST_URL: &str = "https://ggzy.example.gov.cn/search";
pub const DETAIL_1: &str = "https://ggzy.example.gov.cn/detail/1.html";
pub const DETAIL_2: &str = "https://ggzy.example.gov.cn/detail/2.html";
pub const DETAIL_3: &str = "https://ggzy.example.gov.cn/detail/3.html";

/// Canonical list trace: search for the keyword, then read `tbody tr` rows.
pub fn list_trace_json() -> String {
    serde_json::json!({
        "name": "provincial search",
        "type": "list",
        "url": LIST_URL,
        "steps": [
            {"action": "navigate", "url": LIST_URL},
            {"action": "input", "selector": "#kw", "value": "{{.Keyword}}"},
            {"action": "click", "selector": "button.search"},
            {"action": "extract", "type": "list", "selector": "tbody tr", "fields": {
                "title": "td:nth-child(1) a",
                "date": "td:nth-child(3)",
                "url": "td:nth-child(1) a"
            }}
        ]
    })
    .to_string()
}

/// Canonical detail trace bound to `{{.URL}}`.
pub fn detail_trace_json() -> String {
    serde_json::json!({
        "name": "notice detail",
        "type": "detail",
        "url": "{{.URL}}",
        "steps": [
            {"action": "navigate", "url": "{{.URL}}"},
            {"action": "extract", "type": "detail", "fields": {
                "amount": "span:contains('预算金额')",
                "contact": "span:contains('联系人')",
                "content": "div.notice-content"
            }, "multi_fields": {
                "attachments": "a[href$='.pdf']"
            }}
        ]
    })
    .to_string()
}

pub fn row(title: &str, date: &str, href: &str) -> FakeRow {
    FakeRow::new()
        .text("td:nth-child(1) a", title)
        .text("td:nth-child(3)", date)
        .href("td:nth-child(1) a", href)
}

pub fn detail_doc(amount: &str, contact: &str) -> FakeDoc {
    FakeDoc::default()
        .text("span:contains('预算金额')", &format!("预算金额：{}", amount))
        .text("span:contains('联系人')", &format!("联系人：{}", contact))
        .text("div.notice-content", "公开招标公告正文")
        .links("a[href$='.pdf']", &[("/files/notice.pdf", "招标文件.pdf")])
}

/// A search page with three rows, two of them software projects.
pub fn tender_site() -> FakeSite {
    FakeSite::new()
        .page(
            LIST_URL,
            FakeDoc::list(
                "tbody tr",
                vec![
                    row("软件开发服务采购项目", "2026-03-02", "/detail/1.html"),
                    row("办公家具采购", "2026-03-01", "/detail/2.html"),
                    row("信息化软件运维项目", "2026-02-27", "/detail/3.html"),
                ],
            )
            .input("#kw")
            .button("button.search", ClickEffect::Nothing),
        )
        .page(DETAIL_1, detail_doc("120万元", "张工"))
        .page(DETAIL_2, detail_doc("35万元", "李工"))
        .page(DETAIL_3, detail_doc("80万元", "王工"))
}
