pub mod app_state;
pub mod config;
pub mod types;

pub use app_state::{build_orchestrator, AppState};
pub use config::{load_scout_config, ScoutConfig};
