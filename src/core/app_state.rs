use crate::collect::orchestrator::{import_trace_files, Orchestrator};
use crate::collect::store::{FileStore, Stores};
use crate::core::config::{chrome_executable_override, ScoutConfig};
use crate::features::captcha::{CaptchaPrompt, CaptchaResolver};
use crate::replay::ReplayLimits;
use crate::scraping::browser_manager::ChromeLauncher;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    /// File-based config loaded from `tender-scout.json` (env-var fallback for all fields).
    pub config: Arc<ScoutConfig>,
    pub stores: Stores,
    pub orchestrator: Arc<Orchestrator>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("data_dir", &self.config.resolve_data_dir())
            .field("active_tasks", &self.orchestrator.registry().active_count())
            .finish()
    }
}

impl AppState {
    pub fn new(config: ScoutConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config: Arc::new(config),
            stores: orchestrator.stores().clone(),
            orchestrator,
        }
    }

    /// Open the store under the data dir and wire up the Chrome launcher and
    /// OCR resolver. Server mode passes no prompt.
    pub async fn from_config(
        config: ScoutConfig,
        prompt: Option<Arc<dyn CaptchaPrompt>>,
    ) -> anyhow::Result<Self> {
        let orchestrator = build_orchestrator(&config, prompt).await?;
        Ok(Self::new(config, Arc::new(orchestrator)))
    }
}

pub async fn build_orchestrator(
    config: &ScoutConfig,
    prompt: Option<Arc<dyn CaptchaPrompt>>,
) -> anyhow::Result<Orchestrator> {
    let data_dir = config.resolve_data_dir();
    let store = Arc::new(FileStore::open(data_dir.clone()).await?);
    store.seed_sources(&config.sources).await?;
    let stores = Stores::from_file_store(store);

    let imported = import_trace_files(&stores, &config.resolve_traces_dir()).await?;
    if imported > 0 {
        info!("imported {} trace files", imported);
    }

    let page_timeout = config.resolve_page_timeout();
    let mut launcher = ChromeLauncher::new(
        config.resolve_browser_headless(),
        config.resolve_browser_profile_dir(),
        page_timeout,
    );
    if let Some(exe) = chrome_executable_override() {
        launcher = launcher.with_executable(exe);
    }

    let mut resolver = CaptchaResolver::new(
        reqwest::Client::new(),
        &config.resolve_captcha_service(),
        config.resolve_captcha_dir(),
    );
    if let Some(prompt) = prompt {
        resolver = resolver.with_prompt(prompt);
    }

    let limits = ReplayLimits {
        page_timeout,
        max_items_per_page: config.resolve_max_items_per_page(),
        ..ReplayLimits::default()
    };

    Ok(Orchestrator::new(stores, Arc::new(launcher))
        .with_captcha(Arc::new(resolver))
        .with_limits(limits))
}
