//! Token-table predicates used by the compiler.
//!
//! These are best-effort: a recording that defeats them compiles into a
//! trace an operator can still edit by hand.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::Regex;
use std::sync::OnceLock;

use super::model::CLICK_FIELD_PREFIX;
use super::selector::XPATH_PREFIX;

// ── Token tables ─────────────────────────────────────────────────────────────

const PAGINATION_TOKENS: &[&str] = &[
    "pagination",
    "pager",
    "page",
    "next",
    "prev",
    "previous",
    "下一页",
    "上一页",
    "下页",
    "上页",
    "第",
    "页",
    "a:nth-of-type",
    "li:nth-of-type",
];

const LIST_ROW_TOKENS: &[&str] = &[
    "tr:nth-of-type",
    "tbody tr",
    "td:nth-of-type",
    "td.el-table",
    "li:nth-of-type",
    "div:nth-of-type",
    ".list-item",
    ".item",
    "/tbody/tr",
    "/tr[",
    "/li[",
];

const INPUT_CONTAINER_TOKENS: &[&str] = &["input", "textarea", "[role=\"textbox\"]", "contenteditable"];

const BUTTON_TOKENS: &[&str] = &["button", "btn"];
const SEARCH_ACTION_TOKENS: &[&str] = &["primary", "search", "查询", "搜索", "检索"];

const KEYWORD_INPUT_TOKENS: &[&str] = &["标题", "关键词", "关键字", "keyword", "title", "搜索", "search"];

const CAPTCHA_TOKENS: &[&str] = &["验证码", "captcha", "checkcode", "verifycode", "yzm"];

const IMAGE_TOKENS: &[&str] = &["img", "canvas", "image"];

fn matcher(cell: &'static OnceLock<AhoCorasick>, tokens: &'static [&'static str]) -> &'static AhoCorasick {
    cell.get_or_init(|| {
        AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(tokens)
            .expect("valid token table")
    })
}

macro_rules! token_predicate {
    ($(#[$doc:meta])* $name:ident, $table:ident) => {
        $(#[$doc])*
        pub fn $name(selector: &str) -> bool {
            static CELL: OnceLock<AhoCorasick> = OnceLock::new();
            !selector.is_empty() && matcher(&CELL, $table).is_match(selector)
        }
    };
}

token_predicate!(
    /// Recorded click looks like a row of a result list.
    is_list_row, LIST_ROW_TOKENS
);
token_predicate!(
    /// Click on a text field; the following `change` already captures intent.
    is_input_container, INPUT_CONTAINER_TOKENS
);
token_predicate!(
    /// Field whose value is the search keyword.
    is_keyword_input, KEYWORD_INPUT_TOKENS
);
token_predicate!(is_captcha_selector, CAPTCHA_TOKENS);
token_predicate!(has_button_token, BUTTON_TOKENS);
token_predicate!(has_search_action_token, SEARCH_ACTION_TOKENS);
token_predicate!(has_image_token, IMAGE_TOKENS);

fn trailing_index() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+|last)\)$").expect("valid trailing-index regex"))
}

/// Next/prev/page-number controls: a pagination token or a selector ending
/// in a positional index such as `li:nth-of-type(3)`.
pub fn is_pagination_control(selector: &str) -> bool {
    static CELL: OnceLock<AhoCorasick> = OnceLock::new();
    if selector.is_empty() {
        return false;
    }
    matcher(&CELL, PAGINATION_TOKENS).is_match(selector) || trailing_index().is_match(selector.trim())
}

pub fn is_search_button(selector: &str) -> bool {
    has_button_token(selector) && has_search_action_token(selector)
}

/// Four characters without whitespace is what image CAPTCHAs look like.
pub fn looks_like_captcha_value(value: &str) -> bool {
    value.chars().count() == 4 && !value.chars().any(char::is_whitespace)
}

/// Whether a click on `selector` plausibly targets a CAPTCHA image (clicking
/// it refreshes the challenge).
pub fn is_captcha_image(selector: &str) -> bool {
    has_image_token(selector) || is_captcha_selector(selector)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRole {
    Captcha,
    Keyword,
    Literal,
}

/// Classify a coalesced text input. A CAPTCHA token in the selector wins,
/// then a keyword-bearing selector, then the four-character value rule.
pub fn classify_input(selector: &str, value: &str) -> InputRole {
    if is_captcha_selector(selector) {
        InputRole::Captcha
    } else if is_keyword_input(selector) {
        InputRole::Keyword
    } else if looks_like_captcha_value(value) {
        InputRole::Captcha
    } else {
        InputRole::Literal
    }
}

// ── List structure inference ─────────────────────────────────────────────────

pub const DEFAULT_LIST_CONTAINER: &str = "tbody tr";
pub const DEFAULT_CAPTCHA_IMAGE: &str = "img[src*='captcha']";

/// Row container implied by a clicked row selector.
pub fn list_container(selector: &str) -> Option<&'static str> {
    let s = selector;
    if s.contains("tr:nth-of-type") || s.contains("tbody tr") || s.contains("/tr[") || s.contains("/tbody/tr") {
        Some(DEFAULT_LIST_CONTAINER)
    } else if s.contains("li:nth-of-type") || s.contains("/li[") {
        Some("li")
    } else if s.contains("div:nth-of-type") {
        Some("div")
    } else {
        None
    }
}

/// Field selectors inferred from the row that was clicked while recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFieldInfo {
    pub title_selector: String,
    pub date_selector: String,
    pub url_selector: String,
    pub has_direct_link: bool,
}

impl Default for ListFieldInfo {
    fn default() -> Self {
        Self::for_column(1, false)
    }
}

impl ListFieldInfo {
    fn for_column(column: u32, has_direct_link: bool) -> Self {
        let url_selector = if has_direct_link {
            format!("td:nth-child({}) a", column)
        } else {
            // SPA rows without an anchor: URL is only observable by clicking.
            format!("{}td:nth-child({}) span", CLICK_FIELD_PREFIX, column)
        };
        Self {
            title_selector: format!("td:nth-child({}) span", column),
            date_selector: "td:nth-child(3)".to_string(),
            url_selector,
            has_direct_link,
        }
    }
}

fn xpath_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/td\[(\d+)\]").expect("valid td regex"))
}

fn el_table_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Element UI: td.el-table_1_column_3
    RE.get_or_init(|| Regex::new(r"el-table_\d+_column_(\d+)").expect("valid el-table regex"))
}

fn css_nth_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"td:nth-(?:of-type|child)\((\d+)\)").expect("valid nth regex"))
}

/// Parse `/td[n]` (and an `/a` below it) out of an XPath candidate.
pub fn fields_from_xpath(xpath: &str) -> Option<ListFieldInfo> {
    let caps = xpath_column().captures(xpath)?;
    let column: u32 = caps[1].parse().ok()?;
    let tail = &xpath[caps.get(0).map(|m| m.end()).unwrap_or(0)..];
    let has_link = tail.split('/').any(|seg| seg == "a" || seg.starts_with("a["));
    Some(ListFieldInfo::for_column(column.max(1), has_link))
}

/// Parse the column from an Element UI class or an `nth` td selector.
pub fn fields_from_css(css: &str) -> Option<ListFieldInfo> {
    let column: u32 = el_table_column()
        .captures(css)
        .or_else(|| css_nth_column().captures(css))
        .and_then(|c| c[1].parse().ok())?;
    let has_link = css.contains(" a") || css.contains(">a") || css.ends_with(" a");
    Some(ListFieldInfo::for_column(column.max(1), has_link))
}

/// Infer list fields from every candidate of a row click. XPath wins because
/// it carries the `td[n]` position verbatim.
pub fn infer_list_fields(groups: &[Vec<String>]) -> Option<ListFieldInfo> {
    let all = || groups.iter().flatten().map(|s| s.trim());
    all()
        .filter_map(|s| s.strip_prefix(XPATH_PREFIX))
        .find_map(fields_from_xpath)
        .or_else(|| {
            all()
                .filter(|s| !s.starts_with(XPATH_PREFIX))
                .find_map(fields_from_css)
        })
}
