mod common;

use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Notify;

use labsync::db::models::Provider;
use labsync::server::{router, AppState};
use labsync::sync::SyncOrchestrator;

use common::{add_lab, descriptor, harness, message, FakeMailbox};

async fn spawn_server(orchestrator: SyncOrchestrator, post_sync_redirect: Option<&str>) -> String {
    let state = AppState {
        orchestrator,
        post_sync_redirect: post_sync_redirect.map(str::to_string),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.expect("serve");
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("http client")
}

#[tokio::test]
async fn health_answers_ok() {
    let h = harness(FakeMailbox::new(Provider::Gmail));
    let base = spawn_server(h.orchestrator.clone(), None).await;

    let response = client().get(format!("{base}/health")).send().await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.expect("body"), "ok");
}

#[tokio::test]
async fn authorize_redirects_to_consent_page() {
    let h = harness(FakeMailbox::new(Provider::Gmail));
    let base = spawn_server(h.orchestrator.clone(), None).await;
    let http = client();

    let response = http
        .get(format!("{base}/oauth/google/authorize?user_id=42"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        "https://consent.test/authorize?state=42"
    );

    let missing_user = http
        .get(format!("{base}/oauth/gmail/authorize"))
        .send()
        .await
        .expect("request");
    assert_eq!(missing_user.status(), StatusCode::BAD_REQUEST);

    let unconfigured = http
        .get(format!("{base}/oauth/yahoo/authorize?user_id=42"))
        .send()
        .await
        .expect("request");
    assert_eq!(unconfigured.status(), StatusCode::NOT_FOUND);

    let unknown = http
        .get(format!("{base}/oauth/aol/authorize?user_id=42"))
        .send()
        .await
        .expect("request");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_queues_a_job_and_status_reports_it() {
    let mailbox = FakeMailbox::new(Provider::Gmail).with_message(
        message("m-1", "Blood Panel", "labs@acme.test", true),
        vec![descriptor("a-1", "report.pdf", "application/pdf", 64)],
    );
    let h = harness(mailbox);
    add_lab(&h.db, "42", "Acme Labs", Some("labs@acme.test"));
    let base = spawn_server(h.orchestrator.clone(), None).await;
    let http = client();

    let response = http
        .get(format!("{base}/oauth/gmail/callback?code=code-1&state=42"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let mut finished = false;
    for _ in 0..100 {
        let status: Value = http
            .get(format!("{base}/jobs/{job_id}/status"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json body");
        let rows = status["rows"].as_array().cloned().unwrap_or_default();
        if rows.iter().any(|row| row["step"] == "record linking") {
            assert_eq!(status["job_id"], job_id.as_str());
            assert!(!status["latest"].as_array().expect("latest").is_empty());
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(finished, "job did not finish");

    let unknown = http
        .get(format!("{base}/jobs/does-not-exist/status"))
        .send()
        .await
        .expect("request");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_rejects_errors_and_missing_parameters() {
    let h = harness(FakeMailbox::new(Provider::Gmail));
    let base = spawn_server(h.orchestrator.clone(), None).await;
    let http = client();

    for query in ["error=access_denied&state=42", "state=42", "code=code-1"] {
        let response = http
            .get(format!("{base}/oauth/gmail/callback?{query}"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "query {query}");
    }
}

#[tokio::test]
async fn callback_redirects_when_configured_and_conflicts_while_running() {
    let gate = Arc::new(Notify::new());
    let mut mailbox = FakeMailbox::new(Provider::Gmail);
    mailbox.search_gate = Some(gate.clone());
    let h = harness(mailbox);
    add_lab(&h.db, "42", "Acme Labs", None);
    let base = spawn_server(h.orchestrator.clone(), Some("https://app.test/synced")).await;
    let http = client();

    let first = http
        .get(format!("{base}/oauth/gmail/callback?code=code-1&state=42"))
        .send()
        .await
        .expect("request");
    assert_eq!(first.status(), StatusCode::SEE_OTHER);
    let location = first.headers()["location"].to_str().expect("location").to_string();
    assert!(location.starts_with("https://app.test/synced?job_id="));

    let second = http
        .get(format!("{base}/oauth/gmail/callback?code=code-2&state=42"))
        .send()
        .await
        .expect("request");
    assert_eq!(second.status(), StatusCode::CONFLICT);

    gate.notify_one();
}
