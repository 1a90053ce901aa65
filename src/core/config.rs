use crate::collect::model::Source;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ScoutConfig: file-based config loader (tender-scout.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "TENDER_SCOUT_CONFIG";
pub const ENV_CAPTCHA_SERVICE: &str = "CAPTCHA_SERVICE";
pub const ENV_DATA_DIR: &str = "DATA_DIR";
pub const ENV_TRACES_DIR: &str = "TRACES_DIR";
pub const ENV_BROWSER_HEADLESS: &str = "BROWSER_HEADLESS";
pub const ENV_PAGE_TIMEOUT_SECS: &str = "PAGE_TIMEOUT_SECS";
pub const ENV_MAX_ITEMS_PER_PAGE: &str = "MAX_ITEMS_PER_PAGE";
pub const ENV_PORT: &str = "TENDER_SCOUT_PORT";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

/// Top-level config loaded from `tender-scout.json`. Every field is optional;
/// use the `resolve_*` accessors.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ScoutConfig {
    /// OCR service base URL, e.g. `http://localhost:5000`.
    pub captcha_service: Option<String>,
    /// Root for the JSON tables, the CAPTCHA archive and the browser profile.
    pub data_dir: Option<String>,
    /// Directory scanned at startup for `<source code>_<list|detail>.json`.
    pub traces_dir: Option<String>,
    pub browser_headless: Option<bool>,
    pub page_timeout_secs: Option<u64>,
    pub max_items_per_page: Option<usize>,
    pub port: Option<u16>,
    /// Seeded into the source store when it is empty.
    #[serde(default)]
    pub sources: Vec<Source>,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl ScoutConfig {
    /// OCR base URL: JSON field → `CAPTCHA_SERVICE` env var → `http://localhost:5000`.
    pub fn resolve_captcha_service(&self) -> String {
        if let Some(u) = &self.captcha_service {
            if !u.trim().is_empty() {
                return u.trim().trim_end_matches('/').to_string();
            }
        }
        env_nonempty(ENV_CAPTCHA_SERVICE)
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://localhost:5000".to_string())
    }

    /// Data directory: JSON field → `DATA_DIR` env var → `./data`.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(d) = &self.data_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d.trim());
            }
        }
        env_nonempty(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Trace import directory: JSON field → `TRACES_DIR` env var → `./traces`.
    pub fn resolve_traces_dir(&self) -> PathBuf {
        if let Some(d) = &self.traces_dir {
            if !d.trim().is_empty() {
                return PathBuf::from(d.trim());
            }
        }
        env_nonempty(ENV_TRACES_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./traces"))
    }

    pub fn resolve_captcha_dir(&self) -> PathBuf {
        self.resolve_data_dir().join("captcha")
    }

    pub fn resolve_browser_profile_dir(&self) -> PathBuf {
        self.resolve_data_dir().join("browser-data")
    }

    /// Headless browser: JSON field → `BROWSER_HEADLESS` (`true`/`1`) → `false`.
    pub fn resolve_browser_headless(&self) -> bool {
        if let Some(b) = self.browser_headless {
            return b;
        }
        env_nonempty(ENV_BROWSER_HEADLESS)
            .map(|v| parse_flag(&v))
            .unwrap_or(false)
    }

    /// Page-load bound: JSON field → `PAGE_TIMEOUT_SECS` → 30 s.
    pub fn resolve_page_timeout(&self) -> Duration {
        let secs = self
            .page_timeout_secs
            .or_else(|| env_nonempty(ENV_PAGE_TIMEOUT_SECS).and_then(|v| v.parse().ok()))
            .filter(|s| *s > 0)
            .unwrap_or(30);
        Duration::from_secs(secs)
    }

    /// Per-page row cap: JSON field → `MAX_ITEMS_PER_PAGE` → 10.
    pub fn resolve_max_items_per_page(&self) -> usize {
        self.max_items_per_page
            .or_else(|| env_nonempty(ENV_MAX_ITEMS_PER_PAGE).and_then(|v| v.parse().ok()))
            .filter(|n| *n > 0)
            .unwrap_or(10)
    }

    /// Listen port: `--port` (passed in) → JSON field → `TENDER_SCOUT_PORT` → `PORT` → 8080.
    pub fn resolve_port(&self, cli: Option<u16>) -> u16 {
        cli.or(self.port)
            .or_else(|| env_nonempty(ENV_PORT).and_then(|v| v.parse().ok()))
            .or_else(|| env_nonempty("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(8080)
    }
}

/// Load `tender-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `TENDER_SCOUT_CONFIG` env var path
/// 2. `./tender-scout.json`
/// 3. `../tender-scout.json`
///
/// Missing file → `ScoutConfig::default()`.
/// Parse error → log a warning, return `ScoutConfig::default()`.
pub fn load_scout_config() -> ScoutConfig {
    let mut candidates = vec![
        PathBuf::from("tender-scout.json"),
        PathBuf::from("../tender-scout.json"),
    ];
    if let Some(env_path) = env_nonempty(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        if let Some(cfg) = load_config_file(path) {
            return cfg;
        }
    }
    ScoutConfig::default()
}

/// `None` when the file is absent; defaults (with a warning) when it is unreadable JSON.
fn load_config_file(path: &Path) -> Option<ScoutConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ScoutConfig>(&contents) {
        Ok(cfg) => {
            tracing::info!("tender-scout.json loaded from {}", path.display());
            Some(cfg)
        }
        Err(e) => {
            tracing::warn!(
                "tender-scout.json parse error at {}: {}; using defaults",
                path.display(),
                e
            );
            Some(ScoutConfig::default())
        }
    }
}

/// Optional override for the Chromium-family browser executable.
///
/// Only returns a value when `CHROME_EXECUTABLE` is set to an existing path;
/// otherwise `scraping::browser_manager::find_chrome_executable()` discovers one.
pub fn chrome_executable_override() -> Option<String> {
    let p = env_nonempty(ENV_CHROME_EXECUTABLE)?;
    Path::new(&p).exists().then_some(p)
}
