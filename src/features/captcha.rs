//! CAPTCHA resolution through an external OCR service.
//!
//! Contract: `GET {base}/health` → 200 when available; `POST {base}/ocr` with
//! raw PNG bytes → `{success, text, confidence, error?}` or a bare text body.
//!
//! Every image is archived before use and every attempt is appended to
//! `attempts.jsonl`, so an operator can always finish a run by hand.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const SOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const ATTEMPT_LOG: &str = "attempts.jsonl";

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha service unavailable (image saved to {})", saved.display())]
    Unavailable { saved: PathBuf },

    #[error("captcha recognition failed: {reason} (image saved to {})", saved.display())]
    RecognitionFailed { reason: String, saved: PathBuf },

    #[error("ocr service error: {0}")]
    Service(String),

    #[error("failed to archive captcha image: {0}")]
    Archive(#[from] std::io::Error),
}

impl CaptchaError {
    /// Path of the archived image, when the failure happened after archiving.
    pub fn saved_image(&self) -> Option<&Path> {
        match self {
            CaptchaError::Unavailable { saved } | CaptchaError::RecognitionFailed { saved, .. } => {
                Some(saved)
            }
            _ => None,
        }
    }
}

/// What the interpreter needs: image bytes in, CAPTCHA text out.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn resolve(&self, image: &[u8]) -> Result<String, CaptchaError>;
}

/// Manual entry fallback.
#[async_trait]
pub trait CaptchaPrompt: Send + Sync {
    /// Ask a human for the text of the image at `saved`. `None` if nobody answered.
    async fn ask(&self, saved: &Path) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    text: String,
    #[serde(default)]
    #[allow(dead_code)]
    confidence: f64,
    #[serde(default)]
    error: Option<String>,
}

pub struct CaptchaResolver {
    client: reqwest::Client,
    base_url: String,
    archive: CaptchaArchive,
    prompt: Option<Arc<dyn CaptchaPrompt>>,
}

impl std::fmt::Debug for CaptchaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptchaResolver")
            .field("base_url", &self.base_url)
            .field("archive", &self.archive.dir)
            .field("manual_fallback", &self.prompt.is_some())
            .finish()
    }
}

impl CaptchaResolver {
    pub fn new(client: reqwest::Client, base_url: &str, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            archive: CaptchaArchive::new(archive_dir),
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn CaptchaPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn archive(&self) -> &CaptchaArchive {
        &self.archive
    }

    /// Probe `/health`. Any failure means "unavailable", never an error.
    pub async fn check_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                warn!("captcha service probe failed: {}", e);
                false
            }
        }
    }

    /// Post the image to `/ocr`.
    pub async fn solve(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let resp = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(image.to_vec())
            .timeout(SOLVE_TIMEOUT)
            .send()
            .await
            .map_err(|e| CaptchaError::Service(format!("request failed: {}", e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| CaptchaError::Service(format!("failed to read response: {}", e)))?;

        // A JSON object is always the structured reply. Anything else, bare
        // digits included, is the recognized text itself.
        if let Ok(value @ serde_json::Value::Object(_)) =
            serde_json::from_str::<serde_json::Value>(&body)
        {
            let parsed: OcrResponse = serde_json::from_value(value)
                .map_err(|e| CaptchaError::Service(format!("malformed response: {}", e)))?;
            if !parsed.success {
                return Err(CaptchaError::Service(
                    parsed.error.unwrap_or_else(|| "recognition unsuccessful".to_string()),
                ));
            }
            let text = parsed.text.trim();
            if text.is_empty() {
                return Err(CaptchaError::Service("empty recognition result".to_string()));
            }
            return Ok(text.to_string());
        }

        if !status.is_success() {
            return Err(CaptchaError::Service(format!("HTTP {}", status)));
        }
        let text = body.trim();
        if text.is_empty() {
            return Err(CaptchaError::Service("empty response".to_string()));
        }
        info!("captcha service answered with plain text");
        Ok(text.to_string())
    }
}

#[async_trait]
impl CaptchaSolver for CaptchaResolver {
    async fn resolve(&self, image: &[u8]) -> Result<String, CaptchaError> {
        let saved = self.archive.save_image(image).await?;
        info!("🧩 captcha saved: {}", saved.display());

        let auto_failure = if self.check_available().await {
            match self.solve(image).await {
                Ok(text) => {
                    self.archive.record(&saved, AttemptSource::Ocr, Ok(&text)).await;
                    info!("✅ captcha recognized automatically");
                    return Ok(text);
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.archive.record(&saved, AttemptSource::Ocr, Err(&reason)).await;
                    warn!("⚠️ captcha recognition failed: {}", reason);
                    Some(reason)
                }
            }
        } else {
            self.archive
                .record(&saved, AttemptSource::Ocr, Err("service unavailable"))
                .await;
            None
        };

        if let Some(prompt) = &self.prompt {
            if let Some(text) = prompt.ask(&saved).await {
                let text = text.trim();
                if !text.is_empty() {
                    self.archive.record(&saved, AttemptSource::Manual, Ok(text)).await;
                    return Ok(text.to_string());
                }
            }
            self.archive
                .record(&saved, AttemptSource::Manual, Err("no answer"))
                .await;
        }

        Err(match auto_failure {
            Some(reason) => CaptchaError::RecognitionFailed { reason, saved },
            None => CaptchaError::Unavailable { saved },
        })
    }
}

// ── Archive ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptSource {
    Ocr,
    Manual,
}

#[derive(Debug, Serialize)]
struct AttemptRecord<'a> {
    image: String,
    source: AttemptSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    at: String,
}

#[derive(Debug, Clone)]
pub struct CaptchaArchive {
    dir: PathBuf,
}

impl CaptchaArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `captcha_<timestamp>_<id>.png`, readable by the owner only.
    pub async fn save_image(&self, image: &[u8]) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "captcha_{}_{}.png",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        );
        let path = self.dir.join(name);
        tokio::fs::write(&path, image).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(path)
    }

    pub async fn record(&self, image: &Path, source: AttemptSource, outcome: Result<&str, &str>) {
        let (text, error) = match outcome {
            Ok(t) => (Some(t), None),
            Err(e) => (None, Some(e)),
        };
        let entry = AttemptRecord {
            image: image.display().to_string(),
            source,
            text,
            error,
            at: Utc::now().to_rfc3339(),
        };
        let line = match serde_json::to_string(&entry) {
            Ok(l) => l,
            Err(e) => {
                warn!("captcha attempt not serializable: {}", e);
                return;
            }
        };

        let res = async {
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(ATTEMPT_LOG))
                .await?;
            f.write_all(format!("{}\n", line).as_bytes()).await?;
            f.flush().await
        }
        .await;
        if let Err(e) = res {
            warn!("failed to append captcha attempt log: {}", e);
        }
    }
}

// ── Manual entry ─────────────────────────────────────────────────────────────

/// Reads the CAPTCHA from stdin; only available with an attached TTY.
#[derive(Debug, Clone)]
pub struct TerminalPrompt {
    timeout: Duration,
}

impl TerminalPrompt {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn detect() -> Option<Self> {
        atty::is(atty::Stream::Stdin).then_some(Self {
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }
}

#[async_trait]
impl CaptchaPrompt for TerminalPrompt {
    async fn ask(&self, saved: &Path) -> Option<String> {
        use tokio::io::AsyncBufReadExt;

        println!("\n🧩 CAPTCHA needs a human. Image: {}", saved.display());
        println!("   Type the characters and press Enter (timeout {}s):", self.timeout.as_secs());

        let mut line = String::new();
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        match tokio::time::timeout(self.timeout, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(line.trim().to_string()),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                warn!("failed to read captcha from stdin: {}", e);
                None
            }
            Err(_) => {
                warn!("timed out waiting for manual captcha entry");
                None
            }
        }
    }
}
