//! Keyword matching for candidate record titles.

use aho_corasick::{AhoCorasick, MatchKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Text contains at least one keyword.
    #[default]
    Any,
    /// Text contains every keyword.
    All,
    /// Text equals some keyword.
    Exact,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchMode::Any => "any",
            MatchMode::All => "all",
            MatchMode::Exact => "exact",
        })
    }
}

impl std::str::FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "any" => Ok(MatchMode::Any),
            "all" => Ok(MatchMode::All),
            "exact" => Ok(MatchMode::Exact),
            other => Err(format!("unknown match mode '{}'", other)),
        }
    }
}

/// Normalized keyword set, built once per collection run.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    /// Lowercased, de-duplicated, longest first.
    keywords: Vec<String>,
    mode: MatchMode,
    any: Option<AhoCorasick>,
}

impl KeywordMatcher {
    pub fn new<S: AsRef<str>>(keywords: &[S], mode: MatchMode) -> Self {
        let mut seen = HashSet::new();
        let mut normalized: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .collect();
        // Stable sort keeps input order among equal lengths.
        normalized.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));

        let any = if normalized.is_empty() {
            None
        } else {
            AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&normalized)
                .ok()
        };

        Self {
            keywords: normalized,
            mode,
            any,
        }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// An empty keyword set matches everything.
    pub fn is_match(&self, text: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let text = text.to_lowercase();
        match self.mode {
            MatchMode::Any => match &self.any {
                Some(ac) => ac.is_match(&text),
                None => self.keywords.iter().any(|k| text.contains(k.as_str())),
            },
            MatchMode::All => self.keywords.iter().all(|k| text.contains(k.as_str())),
            MatchMode::Exact => self.keywords.iter().any(|k| text.trim() == k.as_str()),
        }
    }

    /// Keywords contained in `text`, longest first.
    pub fn matched(&self, text: &str) -> Vec<&str> {
        let text = text.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| text.contains(k.as_str()))
            .map(String::as_str)
            .collect()
    }
}

/// Split an operator-typed keyword string on ASCII/CJK commas, semicolons and
/// whitespace.
pub fn split_keywords(input: &str) -> Vec<String> {
    input
        .split(|c: char| matches!(c, ',' | '，' | ';' | '；') || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
