pub mod captcha;
pub mod keywords;

pub use captcha::{CaptchaError, CaptchaResolver, CaptchaSolver, TerminalPrompt};
pub use keywords::{split_keywords, KeywordMatcher, MatchMode};
