mod common;

use async_trait::async_trait;
use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tender_scout::features::captcha::{CaptchaError, CaptchaSolver};
use tender_scout::replay::{Attachment, Extraction, Interpreter, ReplayError};
use tender_scout::trace::{parse_trace, Params, Trace};
use tokio_util::sync::CancellationToken;

fn list_trace() -> Trace {
    parse_trace(&list_trace_json()).unwrap()
}

fn trace_with_url_field(url_field: &str) -> Trace {
    let mut trace = list_trace();
    if let Some(tender_scout::trace::Step::Extract { fields, .. }) = trace.steps.last_mut() {
        fields.insert("url".into(), url_field.into());
    }
    trace
}

#[tokio::test]
async fn test_list_replay_types_keyword_and_resolves_row_urls() {
    let site = tender_site();
    let session = site.session();
    let rows = Interpreter::new(&session)
        .with_limits(fast_limits())
        .run(&list_trace(), &Params::keyword("软件"))
        .await
        .unwrap()
        .into_rows();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["title"], "软件开发服务采购项目");
    assert_eq!(rows[0]["date"], "2026-03-02");
    assert_eq!(rows[0]["url"], DETAIL_1);
    assert_eq!(rows[2]["url"], DETAIL_3);

    let log = site.log();
    assert_eq!(log[0], format!("navigate {}", LIST_URL));
    assert_eq!(log[1], "type #kw = 软件");
    assert_eq!(log[2], "click button.search");
}

#[tokio::test]
async fn test_rows_without_text_or_url_are_discarded() {
    let site = FakeSite::new().page(
        LIST_URL,
        FakeDoc::list(
            "tbody tr",
            vec![
                row("有链接的项目", "2026-03-02", "/detail/1.html"),
                // Clicking reveals nothing: no url.
                FakeRow::new().text("td:nth-child(1) a", "无链接项目"),
                // No text at all.
                FakeRow::new().href("td:nth-child(1) a", "/detail/9.html"),
            ],
        )
        .input("#kw")
        .button("button.search", ClickEffect::Nothing),
    );
    let session = site.session();
    let rows = Interpreter::new(&session)
        .with_limits(fast_limits())
        .run(&list_trace(), &Params::keyword("项目"))
        .await
        .unwrap()
        .into_rows();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["url"], DETAIL_1);
}

#[tokio::test]
async fn test_per_page_item_cap() {
    let site = tender_site();
    let session = site.session();
    let mut limits = fast_limits();
    limits.max_items_per_page = 2;
    let rows = Interpreter::new(&session)
        .with_limits(limits)
        .run(&list_trace(), &Params::keyword("软件"))
        .await
        .unwrap()
        .into_rows();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_click_derived_urls_same_tab_and_new_tab() {
    let site = FakeSite::new().page(
        LIST_URL,
        FakeDoc::list(
            "tbody tr",
            vec![
                FakeRow::new()
                    .text("td:nth-child(1) span", "同页跳转项目")
                    .click("td:nth-child(1) span", ClickEffect::SameTab(DETAIL_1.into())),
                FakeRow::new()
                    .text("td:nth-child(1) span", "新窗口项目")
                    .click("td:nth-child(1) span", ClickEffect::NewTab(DETAIL_2.into())),
            ],
        )
        .input("#kw")
        .button("button.search", ClickEffect::Nothing),
    );
    let mut trace = trace_with_url_field("@click:td:nth-child(1) span");
    if let Some(tender_scout::trace::Step::Extract { fields, .. }) = trace.steps.last_mut() {
        fields.insert("title".into(), "td:nth-child(1) span".into());
        fields.remove("date");
    }

    let session = site.session();
    let rows = Interpreter::new(&session)
        .with_limits(fast_limits())
        .run(&trace, &Params::keyword("项目"))
        .await
        .unwrap()
        .into_rows();

    let urls: Vec<&str> = rows.iter().map(|r| r["url"].as_str()).collect();
    assert_eq!(urls, vec![DETAIL_1, DETAIL_2]);

    // The same-tab navigation forced exactly one return to the list.
    let returns = site
        .log()
        .iter()
        .filter(|l| **l == format!("navigate {}", LIST_URL))
        .count();
    assert_eq!(returns, 2);
}

#[tokio::test]
async fn test_pagination_reads_until_next_control_disappears() {
    let page2 = format!("{}?page=2", LIST_URL);
    let site = FakeSite::new()
        .page(
            LIST_URL,
            FakeDoc::list(
                "tbody tr",
                vec![
                    row("第一页项目A", "2026-03-02", "/detail/1.html"),
                    row("第一页项目B", "2026-03-01", "/detail/2.html"),
                ],
            )
            .input("#kw")
            .button("button.search", ClickEffect::Nothing)
            .next_page("a.next", &page2),
        )
        .page(
            &page2,
            FakeDoc::list(
                "tbody tr",
                vec![
                    row("第二页项目C", "2026-02-27", "/detail/3.html"),
                    // Duplicate of page one.
                    row("第一页项目A", "2026-03-02", "/detail/1.html"),
                ],
            ),
        );

    let mut trace = list_trace();
    if let Some(tender_scout::trace::Step::Extract { pagination, .. }) = trace.steps.last_mut() {
        *pagination = Some(tender_scout::trace::Pagination::for_control("a.next"));
    }

    let session = site.session();
    let rows = Interpreter::new(&session)
        .with_limits(fast_limits())
        .run(&trace, &Params::keyword("项目"))
        .await
        .unwrap()
        .into_rows();

    let titles: Vec<&str> = rows.iter().map(|r| r["title"].as_str()).collect();
    assert_eq!(titles, vec!["第一页项目A", "第一页项目B", "第二页项目C"]);
    assert!(site.log().contains(&"click a.next".to_string()));
}

#[tokio::test]
async fn test_detail_replay_reads_label_fields_and_attachments() {
    let site = tender_site();
    let session = site.session();
    let detail = parse_trace(&detail_trace_json()).unwrap();
    let row = Interpreter::new(&session)
        .with_limits(fast_limits())
        .run(&detail, &Params::detail_url(DETAIL_1))
        .await
        .unwrap()
        .into_detail();

    assert_eq!(row["amount"], "120万元");
    assert_eq!(row["contact"], "张工");
    assert_eq!(row["content"], "公开招标公告正文");
    let attachments: Vec<Attachment> = serde_json::from_str(&row["attachments"]).unwrap();
    assert_eq!(
        attachments,
        vec![Attachment {
            url: "https://ggzy.example.gov.cn/files/notice.pdf".into(),
            name: "招标文件.pdf".into(),
        }]
    );
    assert_eq!(site.log()[0], format!("navigate {}", DETAIL_1));
}

#[tokio::test]
async fn test_step_failure_names_index_and_action() {
    let site = FakeSite::new().page(LIST_URL, FakeDoc::default().input("#kw"));
    let session = site.session();
    let err = Interpreter::new(&session)
        .with_limits(fast_limits())
        .run(&list_trace(), &Params::keyword("软件"))
        .await
        .unwrap_err();

    assert_eq!(err.index, 2);
    assert_eq!(err.action, "click");
    assert!(matches!(err.source, ReplayError::ElementNotFound(_)));
    // Nothing after the failing step ran.
    assert!(!site.log().iter().any(|l| l.starts_with("click tbody")));
}

#[tokio::test]
async fn test_cancelled_token_stops_before_first_step() {
    let site = tender_site();
    let session = site.session();
    let token = CancellationToken::new();
    token.cancel();
    let err = Interpreter::new(&session)
        .with_limits(fast_limits())
        .with_cancel(token)
        .run(&list_trace(), &Params::keyword("软件"))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.index, 0);
    assert!(site.log().is_empty());
}

struct FixedSolver(&'static str);

#[async_trait]
impl CaptchaSolver for FixedSolver {
    async fn resolve(&self, _image: &[u8]) -> Result<String, CaptchaError> {
        Ok(self.0.to_string())
    }
}

fn captcha_trace() -> Trace {
    captcha_trace_with("img.captcha", "#code")
}

fn captcha_trace_with(image_selector: &str, input_selector: &str) -> Trace {
    parse_trace(
        &serde_json::json!({
            "name": "captcha search",
            "type": "list",
            "steps": [
                {"action": "navigate", "url": LIST_URL},
                {"action": "captcha", "image_selector": image_selector, "input_selector": input_selector},
                {"action": "extract", "type": "list", "selector": "tbody tr", "fields": {
                    "title": "td:nth-child(1) a",
                    "url": "td:nth-child(1) a"
                }}
            ]
        })
        .to_string(),
    )
    .unwrap()
}

fn captcha_site() -> FakeSite {
    FakeSite::new().page(
        LIST_URL,
        FakeDoc::list("tbody tr", vec![row("验证码后的项目", "2026-03-02", "/detail/1.html")])
            .text("img.captcha", "")
            .input("#code"),
    )
}

#[tokio::test]
async fn test_captcha_step_types_resolved_text() {
    let site = captcha_site();
    let session = site.session();
    let out = Interpreter::new(&session)
        .with_limits(fast_limits())
        .with_captcha(Arc::new(FixedSolver("7K3Q")))
        .run(&captcha_trace(), &Params::new())
        .await
        .unwrap();

    assert!(matches!(out, Extraction::List(ref rows) if rows.len() == 1));
    assert!(site.log().contains(&"type #code = 7K3Q".to_string()));
}

#[tokio::test]
async fn test_captcha_selectors_take_bound_params() {
    let site = captcha_site();
    let session = site.session();
    let trace = captcha_trace_with("img.{{.ImageClass}}", "{{.CodeInput}}");
    let params = Params::new()
        .with("ImageClass", "captcha")
        .with("CodeInput", "#code");
    Interpreter::new(&session)
        .with_limits(fast_limits())
        .with_captcha(Arc::new(FixedSolver("7K3Q")))
        .run(&trace, &params)
        .await
        .unwrap();

    assert!(site.log().contains(&"type #code = 7K3Q".to_string()));
}

#[tokio::test]
async fn test_captcha_step_without_resolver_fails() {
    let site = captcha_site();
    let session = site.session();
    let err = Interpreter::new(&session)
        .with_limits(fast_limits())
        .run(&captcha_trace(), &Params::new())
        .await
        .unwrap_err();

    assert_eq!(err.index, 1);
    assert_eq!(err.action, "captcha");
    assert!(matches!(err.source, ReplayError::CaptchaUnconfigured));
}
