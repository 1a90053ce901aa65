//! Chromium-backed [`BrowserSession`] using `chromiumoxide`.
//!
//! * Finding a usable browser executable (Chrome → Chromium → Brave, cross-platform).
//! * Launching a browser with a persistent profile, headless or visible.
//! * Resolving the recorder's selector dialects inside the page.
//! * `wait_until_stable` for SPA pages that keep loading after `load`.
//!
//! Element lookup runs as page JavaScript: the addressed element is tagged with
//! a marker attribute and then fetched as a native element for clicks, typing
//! and screenshots, so pointer events land on real coordinates.

use crate::scraping::session::{BrowserLauncher, BrowserSession, Locator, PageInfo, SessionError};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── User-Agent pool ──────────────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen Chromium desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH scan
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
            "brave",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/brave-browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Config builder ───────────────────────────────────────────────────────────

/// Build a `BrowserConfig` with a persistent profile directory.
///
/// Government procurement portals frequently reject obvious automation, so the
/// `navigator.webdriver` flag is suppressed and the UA is drawn from the pool.
pub fn build_browser_config(exe: &str, headless: bool, user_data_dir: &Path) -> Result<BrowserConfig> {
    let ua = random_user_agent();
    let (width, height) = (1920, 1080);

    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .user_data_dir(user_data_dir)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua));

    if headless {
        builder = builder.arg("--disable-gpu");
    } else {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

// ── Smart wait ───────────────────────────────────────────────────────────────

/// Tracks how long a page has shown no new resources while fully loaded.
#[derive(Debug)]
struct QuietWindow {
    quiet: Duration,
    last_count: u64,
    stable_since: Instant,
}

impl QuietWindow {
    fn new(quiet: Duration, now: Instant) -> Self {
        Self {
            quiet,
            last_count: 0,
            stable_since: now,
        }
    }

    /// Feed one sample. `true` once the page stayed quiet for the window.
    fn observe(&mut self, ready_complete: bool, count: u64, now: Instant) -> bool {
        if !ready_complete || count != self.last_count {
            self.last_count = count;
            self.stable_since = now;
            return false;
        }
        now.duration_since(self.stable_since) >= self.quiet
    }
}

/// Wait until `document.readyState == "complete"` and no new resource entries
/// appear for `quiet_ms`, or until `timeout` elapses. Returns `true` when the
/// page went quiet.
pub async fn wait_until_stable(page: &Page, quiet_ms: u64, timeout: Duration) -> bool {
    let poll = Duration::from_millis(250);
    let start = Instant::now();
    let mut window = QuietWindow::new(Duration::from_millis(quiet_ms), start);

    loop {
        if start.elapsed() >= timeout {
            debug!("wait_until_stable: timeout after {:?}", timeout);
            return false;
        }

        let count: u64 = page
            .evaluate("performance.getEntriesByType('resource').length")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_u64())
            .unwrap_or(0);

        let ready_complete: bool = page
            .evaluate("document.readyState")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_str().map(|s| s == "complete"))
            .unwrap_or(false);

        if window.observe(ready_complete, count, Instant::now()) {
            debug!(
                "wait_until_stable: idle after {}ms ({} resources)",
                start.elapsed().as_millis(),
                count
            );
            return true;
        }

        tokio::time::sleep(poll).await;
    }
}

// ── In-page selector resolution ──────────────────────────────────────────────

const TARGET_ATTR: &str = "data-tender-scout-target";

/// Shared helpers injected ahead of every lookup script. Every script returns
/// `JSON.stringify(..)` so `null` survives the CDP round trip.
const FINDER_JS: &str = r#"
const TARGET = 'data-tender-scout-target';
const ANCHOR = 'data-tender-scout-anchor';
const CONTAINS = /^(.*?):contains\((['"])(.*?)\2\)\s*(.*)$/;
function findAll(root, sel) {
  if (sel.startsWith('xpath/')) {
    const snap = document.evaluate(sel.slice(6), root, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
    const out = [];
    for (let i = 0; i < snap.snapshotLength; i++) {
      const n = snap.snapshotItem(i);
      if (n.nodeType === 1) out.push(n);
    }
    return out;
  }
  if (sel.startsWith('pierce/')) sel = sel.slice(7);
  const m = sel.match(CONTAINS);
  if (!m) return Array.from(root.querySelectorAll(sel));
  const needle = m[3];
  const rest = m[4].trim();
  const hits = Array.from(root.querySelectorAll(m[1].trim() || '*'))
    .filter(e => (e.textContent || '').includes(needle));
  const innermost = hits.filter(e => !hits.some(o => o !== e && e.contains(o)));
  if (!rest) return innermost;
  const out = [];
  innermost.forEach((e, i) => {
    e.setAttribute(ANCHOR, String(i));
    document.querySelectorAll('[' + ANCHOR + '="' + i + '"] ' + rest)
      .forEach(t => { if (!out.includes(t)) out.push(t); });
    e.removeAttribute(ANCHOR);
  });
  return out;
}
function locate(loc) {
  if (loc.scope) {
    const s = findAll(document, loc.scope)[loc.scopeIndex];
    if (!s) return null;
    if (!loc.selector) return s;
    return findAll(s, loc.selector)[0] || null;
  }
  return findAll(document, loc.selector)[loc.index] || null;
}
"#;

fn locator_json(locator: &Locator) -> serde_json::Value {
    match locator {
        Locator::First(selector) => serde_json::json!({ "selector": selector, "index": 0 }),
        Locator::Nth { selector, index } => {
            serde_json::json!({ "selector": selector, "index": index })
        }
        Locator::Within {
            scope,
            index,
            selector,
        } => serde_json::json!({ "scope": scope, "scopeIndex": index, "selector": selector }),
    }
}

fn script(body: &str) -> String {
    format!("(() => {{ {} {} }})()", FINDER_JS, body)
}

fn js_str(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn browser_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::Browser(e.to_string())
}

fn browser_closed() -> SessionError {
    SessionError::Browser("browser already closed".to_string())
}

// ── Session ──────────────────────────────────────────────────────────────────

pub struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    active: Mutex<Option<Page>>,
    handler: JoinHandle<()>,
    nav_timeout: Duration,
}

impl ChromeSession {
    async fn page(&self) -> Result<Page, SessionError> {
        self.active
            .lock()
            .await
            .clone()
            .ok_or_else(|| SessionError::Browser("no active page".to_string()))
    }

    async fn eval_json<T: DeserializeOwned>(&self, body: &str) -> Result<T, SessionError> {
        let page = self.page().await?;
        let raw = page
            .evaluate(script(body))
            .await
            .map_err(browser_err)?
            .into_value::<String>()
            .map_err(browser_err)?;
        serde_json::from_str(&raw).map_err(browser_err)
    }

    /// Tag the addressed element and fetch it as a native element.
    async fn element(&self, locator: &Locator) -> Result<Element, SessionError> {
        let body = format!(
            "document.querySelectorAll('[' + TARGET + ']').forEach(e => e.removeAttribute(TARGET));
             const el = locate({});
             if (!el) return JSON.stringify(false);
             el.scrollIntoView({{ block: 'center' }});
             el.setAttribute(TARGET, '1');
             return JSON.stringify(true);",
            locator_json(locator)
        );
        let found: bool = self.eval_json(&body).await?;
        if !found {
            return Err(SessionError::NotFound {
                selector: locator.describe(),
            });
        }
        let page = self.page().await?;
        page.find_element(format!("[{}]", TARGET_ATTR))
            .await
            .map_err(|_| SessionError::NotFound {
                selector: locator.describe(),
            })
    }

    async fn all_pages(&self) -> Result<Vec<Page>, SessionError> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().ok_or_else(browser_closed)?;
        browser.pages().await.map_err(browser_err)
    }

    async fn find_page(&self, id: &str) -> Result<Page, SessionError> {
        self.all_pages()
            .await?
            .into_iter()
            .find(|p| p.target_id().inner() == id)
            .ok_or_else(|| SessionError::Browser(format!("page {} not found", id)))
    }
}

async fn page_info(page: &Page) -> PageInfo {
    PageInfo {
        id: page.target_id().inner().clone(),
        url: page.url().await.ok().flatten().unwrap_or_default(),
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn new_page(&self) -> Result<PageInfo, SessionError> {
        let page = {
            let guard = self.browser.lock().await;
            let browser = guard.as_ref().ok_or_else(browser_closed)?;
            browser.new_page("about:blank").await.map_err(browser_err)?
        };
        let info = page_info(&page).await;
        *self.active.lock().await = Some(page);
        Ok(info)
    }

    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let page = self.page().await?;
        info!("🌐 navigate: {}", url);
        match tokio::time::timeout(self.nav_timeout, page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Navigation {
                url: url.to_string(),
                details: e.to_string(),
            }),
            Err(_) => Err(SessionError::Timeout {
                what: format!("navigation to {}", url),
            }),
        }
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        let page = self.page().await?;
        Ok(page.url().await.map_err(browser_err)?.unwrap_or_default())
    }

    async fn wait_stable(&self, timeout: Duration) -> Result<(), SessionError> {
        let page = self.page().await?;
        if !wait_until_stable(&page, 500, timeout).await {
            warn!("page still changing after {:?}, continuing", timeout);
        }
        Ok(())
    }

    async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        let body = format!(
            "const el = findAll(document, {})[0];
             if (!el) return JSON.stringify(false);
             const r = el.getBoundingClientRect();
             return JSON.stringify(r.width > 0 && r.height > 0 && getComputedStyle(el).visibility !== 'hidden');",
            js_str(selector)
        );
        let start = Instant::now();
        loop {
            if self.eval_json::<bool>(&body).await.unwrap_or(false) {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(SessionError::Timeout {
                    what: format!("{} to become visible", selector),
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn count(&self, selector: &str) -> Result<usize, SessionError> {
        self.eval_json(&format!(
            "return JSON.stringify(findAll(document, {}).length);",
            js_str(selector)
        ))
        .await
    }

    async fn text(&self, locator: &Locator) -> Result<Option<String>, SessionError> {
        self.eval_json(&format!(
            "const el = locate({});
             return JSON.stringify(el ? (el.innerText || el.textContent || '').trim() : null);",
            locator_json(locator)
        ))
        .await
    }

    async fn attribute(
        &self,
        locator: &Locator,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        self.eval_json(&format!(
            "const el = locate({});
             return JSON.stringify(el ? el.getAttribute({}) : null);",
            locator_json(locator),
            js_str(name)
        ))
        .await
    }

    async fn click(&self, locator: &Locator) -> Result<(), SessionError> {
        let el = self.element(locator).await?;
        el.click().await.map_err(browser_err)?;
        Ok(())
    }

    async fn clear_and_type(&self, locator: &Locator, text: &str) -> Result<(), SessionError> {
        let el = self.element(locator).await?;
        el.click().await.map_err(browser_err)?;
        let cleared: bool = self
            .eval_json(
                "const el = document.querySelector('[' + TARGET + ']');
                 if (!el) return JSON.stringify(false);
                 el.focus();
                 if ('value' in el) {
                   el.value = '';
                   el.dispatchEvent(new Event('input', { bubbles: true }));
                 } else {
                   el.textContent = '';
                 }
                 return JSON.stringify(true);",
            )
            .await?;
        if !cleared {
            return Err(SessionError::NotFound {
                selector: locator.describe(),
            });
        }
        let page = self.page().await?;
        page.execute(InsertTextParams::new(text))
            .await
            .map_err(browser_err)?;
        Ok(())
    }

    async fn screenshot(&self, locator: &Locator) -> Result<Vec<u8>, SessionError> {
        let el = self.element(locator).await?;
        el.screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(browser_err)
    }

    async fn pages(&self) -> Result<Vec<PageInfo>, SessionError> {
        let pages = self.all_pages().await?;
        let mut out = Vec::with_capacity(pages.len());
        for p in &pages {
            out.push(page_info(p).await);
        }
        Ok(out)
    }

    async fn active_page(&self) -> Result<PageInfo, SessionError> {
        let page = self.page().await?;
        Ok(page_info(&page).await)
    }

    async fn activate_page(&self, id: &str) -> Result<(), SessionError> {
        let page = self.find_page(id).await?;
        page.bring_to_front().await.map_err(browser_err)?;
        *self.active.lock().await = Some(page);
        Ok(())
    }

    async fn close_page(&self, id: &str) -> Result<(), SessionError> {
        let page = self.find_page(id).await?;
        {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|p| p.target_id().inner() == id) {
                *active = None;
            }
        }
        page.close().await.map_err(browser_err)
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        self.active.lock().await.take();
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = browser.close().await {
            warn!("Browser close error (non-fatal): {}", e);
        }
        let _ = browser.wait().await;
        self.handler.abort();
        info!("🛑 browser session closed");
        Ok(())
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // Drop cannot await: hand the close to the runtime when there is one.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.handler.abort();
            return;
        };

        if let Ok(mut guard) = self.browser.try_lock() {
            if let Some(mut browser) = guard.take() {
                handle.spawn(async move {
                    let _ = browser.close().await;
                    let _ = browser.wait().await;
                });
            }
        }
        self.handler.abort();
    }
}

// ── Launcher ─────────────────────────────────────────────────────────────────

/// Launches one Chromium per collection task with a shared profile directory,
/// so cookies set by a portal survive between runs.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    exe: Option<String>,
    headless: bool,
    user_data_dir: PathBuf,
    nav_timeout: Duration,
}

impl ChromeLauncher {
    pub fn new(headless: bool, user_data_dir: impl Into<PathBuf>, nav_timeout: Duration) -> Self {
        Self {
            exe: None,
            headless,
            user_data_dir: user_data_dir.into(),
            nav_timeout,
        }
    }

    pub fn with_executable(mut self, exe: impl Into<String>) -> Self {
        self.exe = Some(exe.into());
        self
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, SessionError> {
        let exe = self
            .exe
            .clone()
            .or_else(find_chrome_executable)
            .ok_or_else(|| {
                SessionError::Browser(
                    "No browser found. Install Chrome or Chromium, or set CHROME_EXECUTABLE."
                        .to_string(),
                )
            })?;

        tokio::fs::create_dir_all(&self.user_data_dir)
            .await
            .map_err(browser_err)?;

        info!(
            "🚀 launching browser ({}, headless={}, profile={})",
            exe,
            self.headless,
            self.user_data_dir.display()
        );
        let config =
            build_browser_config(&exe, self.headless, &self.user_data_dir).map_err(browser_err)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SessionError::Browser(format!("failed to launch ({}): {}", exe, e)))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });

        Ok(Box::new(ChromeSession {
            browser: Mutex::new(Some(browser)),
            active: Mutex::new(None),
            handler,
            nav_timeout: self.nav_timeout,
        }))
    }
}
