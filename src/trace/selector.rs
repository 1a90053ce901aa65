//! Selector classifier.
//!
//! A recorder captures several addressing strategies for one DOM node
//! (ARIA name, CSS path, XPath, text). Exactly one is kept, ranked:
//!
//! 1. a stable CSS `#id` (short-circuits)
//! 2. a stable XPath
//! 3. a stable plain CSS selector
//! 4. `input[placeholder*="…"]` synthesized from an ARIA prompt
//! 5. the first usable candidate, flagged [`Stability::Unstable`]
//!
//! `aria/` and `text/` candidates are never chosen directly.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

const ARIA_PREFIX: &str = "aria/";
const TEXT_PREFIX: &str = "text/";
const PIERCE_PREFIX: &str = "pierce/";
pub const XPATH_PREFIX: &str = "xpath/";

/// Identifier fragments produced per render by UI frameworks.
const DYNAMIC_ID_TOKENS: &[&str] = &[
    "el-id-",      // Element Plus
    "mui-",        // Material UI
    "rc-",         // Ant Design / rc-components
    "headlessui-", // Headless UI
    "radix-",      // Radix
    "react-aria",  // React Aria
];

/// ARIA names that are really input prompts ("please enter ...").
const PLACEHOLDER_PROMPTS: &[&str] = &["请输入"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Stable,
    Unstable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorChoice {
    pub selector: String,
    pub stability: Stability,
}

impl SelectorChoice {
    fn stable(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            stability: Stability::Stable,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.stability == Stability::Stable
    }
}

fn dynamic_matcher() -> &'static AhoCorasick {
    static M: OnceLock<AhoCorasick> = OnceLock::new();
    M.get_or_init(|| {
        AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(DYNAMIC_ID_TOKENS)
            .expect("valid dynamic-id patterns")
    })
}

fn react_use_id() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // React 18 useId(): ":r1:" (escaped as "\:r1\:" in CSS)
    RE.get_or_init(|| Regex::new(r"\\?:r[0-9a-z]+\\?:").expect("valid useId regex"))
}

/// Whether a selector embeds a framework-generated identifier.
pub fn is_dynamic(selector: &str) -> bool {
    dynamic_matcher().is_match(selector) || react_use_id().is_match(selector)
}

pub fn is_xpath(selector: &str) -> bool {
    selector.starts_with(XPATH_PREFIX)
}

/// A single compound CSS selector carrying an id, e.g. `#kw` or
/// `input#kw.el-input__inner`. Paths anchored at an id (`#app > div`) do not
/// qualify.
pub fn is_id_selector(selector: &str) -> bool {
    if is_xpath(selector) || !selector.contains('#') {
        return false;
    }
    let s = selector.trim();
    !s.contains(|c: char| c.is_whitespace() || matches!(c, '>' | '+' | '~' | ','))
}

/// Pick the most stable selector from recorder candidate groups.
///
/// Returns `None` when no group carries a usable candidate.
pub fn classify(groups: &[Vec<String>]) -> Option<SelectorChoice> {
    let mut first_usable: Option<String> = None;
    let mut xpath: Option<String> = None;
    let mut css: Option<String> = None;
    let mut prompt: Option<String> = None;

    for group in groups {
        let Some(raw) = group.first() else { continue };
        let raw = raw.trim();

        if let Some(name) = raw.strip_prefix(ARIA_PREFIX) {
            if prompt.is_none() {
                prompt = placeholder_from_aria(name);
            }
            continue;
        }
        if raw.starts_with(TEXT_PREFIX) || raw.is_empty() {
            continue;
        }

        let sel = raw.strip_prefix(PIERCE_PREFIX).unwrap_or(raw);
        if first_usable.is_none() {
            first_usable = Some(sel.to_string());
        }
        if is_dynamic(sel) {
            continue;
        }

        if is_xpath(sel) {
            xpath.get_or_insert_with(|| sel.to_string());
        } else if is_id_selector(sel) {
            return Some(SelectorChoice::stable(sel));
        } else {
            css.get_or_insert_with(|| sel.to_string());
        }
    }

    if let Some(sel) = xpath.or(css) {
        return Some(SelectorChoice::stable(sel));
    }
    if let Some(sel) = prompt {
        debug!("selector synthesized from aria prompt: {}", sel);
        return Some(SelectorChoice::stable(sel));
    }
    first_usable.map(|sel| {
        warn!("⚠️ no stable selector among candidates, falling back to {}", sel);
        SelectorChoice {
            selector: sel,
            stability: Stability::Unstable,
        }
    })
}

/// Convenience for callers that only need the string.
pub fn best_selector(groups: &[Vec<String>]) -> String {
    classify(groups).map(|c| c.selector).unwrap_or_default()
}

fn placeholder_from_aria(name: &str) -> Option<String> {
    // aria names may carry a role suffix: `请输入标题[role="textbox"]`
    let name = name.split('[').next().unwrap_or(name).trim();
    let rest = PLACEHOLDER_PROMPTS
        .iter()
        .find_map(|p| name.find(p).map(|i| &name[i + p.len()..]))?
        .trim();
    if rest.is_empty() {
        return None;
    }
    Some(format!(
        "input[placeholder*=\"{}\"]",
        rest.replace('\\', "\\\\").replace('"', "\\\"")
    ))
}
