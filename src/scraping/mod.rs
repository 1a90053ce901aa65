pub mod browser_manager;
pub mod session;

pub use browser_manager::{ChromeLauncher, ChromeSession};
pub use session::{BrowserLauncher, BrowserSession, Locator, PageInfo, SessionError};
