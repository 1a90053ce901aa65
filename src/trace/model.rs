//! Canonical trace representation.
//!
//! A [`Trace`] is pure data: it never holds a browser handle and can be
//! replayed any number of times with different [`Params`] bindings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::compiler::CompileError;

/// Placeholder bound to the search keyword of a list run.
pub const KEYWORD_PARAM: &str = "Keyword";
/// Placeholder bound to the row URL of a detail run.
pub const URL_PARAM: &str = "URL";

/// Marker prefix for list fields whose value is obtained by clicking.
pub const CLICK_FIELD_PREFIX: &str = "@click:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    List,
    Detail,
}

impl TraceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceKind::List => "list",
            TraceKind::Detail => "detail",
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TraceKind {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "list" => Ok(TraceKind::List),
            "detail" => Ok(TraceKind::Detail),
            other => Err(CompileError::UnknownKind(other.to_string())),
        }
    }
}

/// Extraction mode of the terminal `extract` step.
pub type ExtractKind = TraceKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    /// Entry URL as recorded.
    #[serde(rename = "url", default)]
    pub entry_url: String,
    pub steps: Vec<Step>,
}

/// One typed unit of trace execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Input {
        selector: String,
        #[serde(default)]
        value: String,
    },
    Captcha {
        image_selector: String,
        input_selector: String,
    },
    Wait {
        /// Fixed delay in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_time: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_for_visible: Option<String>,
    },
    Extract {
        #[serde(rename = "type")]
        kind: ExtractKind,
        /// Row selector for list extraction.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default)]
        fields: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        multi_fields: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pagination: Option<Pagination>,
    },
}

impl Step {
    pub fn action(&self) -> &'static str {
        match self {
            Step::Navigate { .. } => "navigate",
            Step::Click { .. } => "click",
            Step::Input { .. } => "input",
            Step::Captcha { .. } => "captcha",
            Step::Wait { .. } => "wait",
            Step::Extract { .. } => "extract",
        }
    }

    pub fn wait_ms(ms: u64) -> Self {
        Step::Wait {
            wait_time: Some(ms),
            wait_for_visible: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub selector: String,
    pub next_button: String,
    pub max_pages: usize,
    pub max_items: usize,
}

impl Pagination {
    pub const DEFAULT_MAX_PAGES: usize = 10;
    pub const DEFAULT_MAX_ITEMS: usize = 100;

    pub fn for_control(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            next_button: selector.to_string(),
            max_pages: Self::DEFAULT_MAX_PAGES,
            max_items: Self::DEFAULT_MAX_ITEMS,
        }
    }
}

impl Trace {
    /// The terminal extract step, if the trace is well-formed.
    pub fn extract_step(&self) -> Option<&Step> {
        self.steps
            .last()
            .filter(|s| matches!(s, Step::Extract { .. }))
    }

    /// Check the structural invariant: exactly one `extract` step, last,
    /// whose type matches the trace type.
    pub fn validate(&self) -> Result<(), CompileError> {
        let extracts: Vec<(usize, &Step)> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Step::Extract { .. }))
            .collect();

        match extracts.as_slice() {
            [] => Err(CompileError::Invalid("trace has no extract step".into())),
            [(idx, Step::Extract { kind, selector, .. })] => {
                if *idx + 1 != self.steps.len() {
                    return Err(CompileError::Invalid(format!(
                        "extract step at {} is not the last step",
                        idx
                    )));
                }
                if *kind != self.kind {
                    return Err(CompileError::Invalid(format!(
                        "{} trace ends in a {} extract",
                        self.kind, kind
                    )));
                }
                if *kind == TraceKind::List
                    && selector.as_deref().map_or(true, |s| s.trim().is_empty())
                {
                    return Err(CompileError::Invalid(
                        "list extract step needs a row selector".into(),
                    ));
                }
                Ok(())
            }
            [(_, _), ..] => Err(CompileError::Invalid(format!(
                "trace has {} extract steps, expected exactly one",
                extracts.len()
            ))),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, CompileError> {
        serde_json::to_string_pretty(self).map_err(CompileError::from)
    }
}

/// Runtime parameter bindings, substituted into `{{.Name}}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyword(keyword: &str) -> Self {
        Self::new().with(KEYWORD_PARAM, keyword)
    }

    pub fn detail_url(url: &str) -> Self {
        Self::new().with(URL_PARAM, url)
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Replace every bound `{{.Name}}`. Unbound placeholders are left intact.
    pub fn substitute(&self, template: &str) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        let mut out = template.to_string();
        for (name, value) in &self.0 {
            out = out.replace(&placeholder(name), value);
        }
        out
    }
}

pub fn placeholder(name: &str) -> String {
    format!("{{{{.{}}}}}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn list_extract() -> Step {
        Step::Extract {
            kind: TraceKind::List,
            selector: Some("tbody tr".into()),
            fields: BTreeMap::from([("title".to_string(), "td:nth-child(1) span".to_string())]),
            multi_fields: BTreeMap::new(),
            pagination: None,
        }
    }

    #[test]
    fn test_placeholder_substitution() {
        let params = Params::keyword("软件").with("URL", "https://x.test/d/1");
        assert_eq!(params.substitute("{{.Keyword}}"), "软件");
        assert_eq!(params.substitute("q={{.Keyword}}&u={{.URL}}"), "q=软件&u=https://x.test/d/1");
        assert_eq!(params.substitute("{{.Missing}}"), "{{.Missing}}");
        assert_eq!(placeholder(KEYWORD_PARAM), "{{.Keyword}}");
    }

    #[test]
    fn test_step_tagged_by_action() {
        let step: Step = serde_json::from_value(json!({
            "action": "input",
            "selector": "#kw",
            "value": "{{.Keyword}}"
        }))
        .unwrap();
        assert_eq!(
            step,
            Step::Input {
                selector: "#kw".into(),
                value: "{{.Keyword}}".into()
            }
        );

        let wait = serde_json::to_value(Step::wait_ms(2000)).unwrap();
        assert_eq!(wait, json!({"action": "wait", "wait_time": 2000}));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let res: Result<Step, _> = serde_json::from_value(json!({"action": "hover", "selector": "a"}));
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_requires_single_terminal_extract() {
        let mut trace = Trace {
            name: "t".into(),
            kind: TraceKind::List,
            entry_url: "https://x.test".into(),
            steps: vec![Step::Navigate { url: "https://x.test".into() }, list_extract()],
        };
        assert!(trace.validate().is_ok());

        trace.steps.push(Step::wait_ms(10));
        assert!(trace.validate().is_err());

        trace.steps.pop();
        trace.steps.insert(0, list_extract());
        assert!(trace.validate().is_err());

        trace.steps.remove(0);
        trace.kind = TraceKind::Detail;
        assert!(trace.validate().is_err());
    }
}
