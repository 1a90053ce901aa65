//! Raw Chrome DevTools Recorder export.
//!
//! Untrusted input: every field is optional and unknown fields are ignored.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRecording {
    pub title: String,
    pub url: String,
    pub steps: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    /// Candidate selector groups; each inner list addresses the same node
    /// (shadow-root hops), the outer list holds alternative strategies.
    #[serde(rename = "selectors")]
    pub candidate_selectors: Vec<Vec<String>>,
    pub value: String,
}

/// Event types the recorder emits that carry no replayable intent.
pub const NOISE_EVENTS: &[&str] = &["setViewport", "keyUp", "keyDown", "scroll"];

impl RawEvent {
    pub fn is_noise(&self) -> bool {
        NOISE_EVENTS.contains(&self.kind.as_str())
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn is_click(&self) -> bool {
        matches!(self.kind.as_str(), "click" | "doubleClick")
    }
}

impl RawRecording {
    /// Index of the next event after `idx` that is not recorder noise.
    pub fn next_meaningful(&self, idx: usize) -> Option<&RawEvent> {
        self.steps.iter().skip(idx + 1).find(|e| !e.is_noise())
    }

    pub fn followed_by_navigate(&self, idx: usize) -> bool {
        self.next_meaningful(idx)
            .map(|e| e.is("navigate"))
            .unwrap_or(false)
    }
}
