use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tender_scout::features::captcha::{CaptchaError, CaptchaPrompt, CaptchaResolver, CaptchaSolver};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const IMAGE: &[u8] = b"\x89PNG\r\n\x1a\nfake";

async fn healthy_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

fn resolver(server_uri: &str, dir: &Path) -> CaptchaResolver {
    CaptchaResolver::new(reqwest::Client::new(), server_uri, dir.join("captcha"))
}

fn attempt_lines(dir: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(dir.join("captcha").join("attempts.jsonl"))
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

/// Answers with a fixed string and remembers which image it was shown.
struct ScriptedPrompt {
    answer: Option<&'static str>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    fn new(answer: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CaptchaPrompt for ScriptedPrompt {
    async fn ask(&self, saved: &Path) -> Option<String> {
        self.seen.lock().unwrap().push(saved.display().to_string());
        self.answer.map(str::to_string)
    }
}

#[tokio::test]
async fn test_ocr_json_success() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "text": " 7K3Q ",
            "confidence": 0.93
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let solver = resolver(&server.uri(), dir.path());
    assert_eq!(solver.resolve(IMAGE).await.unwrap(), "7K3Q");

    let attempts = attempt_lines(dir.path());
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0]["source"], "ocr");
    assert_eq!(attempts[0]["text"], "7K3Q");

    let images: Vec<_> = std::fs::read_dir(dir.path().join("captcha"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "png"))
        .collect();
    assert_eq!(images.len(), 1);
}

#[tokio::test]
async fn test_plain_text_body_is_accepted() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ab12\n"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let solver = resolver(&server.uri(), dir.path());
    assert_eq!(solver.solve(IMAGE).await.unwrap(), "ab12");
}

#[tokio::test]
async fn test_json_without_success_flag_is_a_failure() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": "ab12",
            "confidence": 0.9
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let solver = resolver(&server.uri(), dir.path());
    let err = solver.solve(IMAGE).await.unwrap_err();
    assert!(matches!(err, CaptchaError::Service(_)), "{:?}", err);
}

#[tokio::test]
async fn test_numeric_plain_body_is_the_answer() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_string("4821"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let solver = resolver(&server.uri(), dir.path());
    assert_eq!(solver.solve(IMAGE).await.unwrap(), "4821");
}

#[tokio::test]
async fn test_unsuccessful_recognition_names_saved_image() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "error": "low confidence"
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let solver = resolver(&server.uri(), dir.path());
    let err = solver.resolve(IMAGE).await.unwrap_err();

    assert!(matches!(err, CaptchaError::RecognitionFailed { .. }));
    let saved = err.saved_image().unwrap().to_path_buf();
    assert!(saved.exists());
    let message = err.to_string();
    assert!(message.contains("low confidence"), "{}", message);
    assert!(message.contains(&saved.display().to_string()), "{}", message);
}

#[tokio::test]
async fn test_unhealthy_service_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_string("never"))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let solver = resolver(&server.uri(), dir.path());
    assert!(!solver.check_available().await);

    let err = solver.resolve(IMAGE).await.unwrap_err();
    assert!(matches!(err, CaptchaError::Unavailable { .. }));
    assert!(err.saved_image().is_some());
    assert_eq!(attempt_lines(dir.path())[0]["error"], "service unavailable");
}

#[tokio::test]
async fn test_manual_prompt_fills_in_after_ocr_failure() {
    let server = healthy_server().await;
    Mock::given(method("POST"))
        .and(path("/ocr"))
        .respond_with(ResponseTemplate::new(500).set_body_string(""))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let prompt = ScriptedPrompt::new(Some("  HUMAN  "));
    let solver = resolver(&server.uri(), dir.path()).with_prompt(prompt.clone());

    assert_eq!(solver.resolve(IMAGE).await.unwrap(), "HUMAN");
    assert_eq!(prompt.seen.lock().unwrap().len(), 1);

    let attempts = attempt_lines(dir.path());
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["source"], "ocr");
    assert!(attempts[0]["error"].is_string());
    assert_eq!(attempts[1]["source"], "manual");
    assert_eq!(attempts[1]["text"], "HUMAN");
}

#[tokio::test]
async fn test_unanswered_prompt_keeps_original_failure() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let prompt = ScriptedPrompt::new(None);
    let solver = resolver(&server.uri(), dir.path()).with_prompt(prompt.clone());

    let err = solver.resolve(IMAGE).await.unwrap_err();
    assert!(matches!(err, CaptchaError::Unavailable { .. }));
    let seen = prompt.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![err.saved_image().unwrap().display().to_string()]);

    let attempts = attempt_lines(dir.path());
    assert_eq!(attempts.last().unwrap()["error"], "no answer");
}
