pub mod api;
pub mod collect;
pub mod core;
pub mod features;
pub mod replay;
pub mod scraping;
pub mod trace;

// --- Primary core exports ---
pub use core::types;
pub use core::AppState;

// --- Short module paths ---
pub use features::{captcha, keywords};
pub use scraping::{browser_manager, session};
