use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Response, StatusCode};
use tokio::time::sleep;
use tracing::debug;

const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;
const REDACTED_BODY_MAX_LEN: usize = 200;

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(REDACTED_BODY_MAX_LEN) {
        None => trimmed.to_string(),
        Some((cut, _)) => format!(
            "{}…[truncated {} bytes]",
            &trimmed[..cut],
            trimmed.len()
        ),
    }
}

/// GET with bearer auth, retrying 429s with `Retry-After` or exponential backoff.
async fn send_with_retry(client: &Client, token: &str, url: &str, accept: &str) -> Result<Response> {
    let mut backoff_seconds = 1u64;

    for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
        let response = client
            .get(url)
            .bearer_auth(token)
            .header("accept", accept)
            .send()
            .await
            .with_context(|| format!("mail api request: {url}"))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            if attempt == MAX_RATE_LIMIT_RETRIES {
                let body = response.text().await.context("read 429 response body")?;
                return Err(anyhow!(
                    "mail api request exhausted retries: {}",
                    redact_response_body(&body)
                ));
            }

            let retry_after_seconds = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(backoff_seconds);

            debug!(url, attempt, retry_after_seconds, "rate limited, backing off");
            sleep(StdDuration::from_secs(retry_after_seconds)).await;
            backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
            continue;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .context("read mail api error body")?;
            return Err(anyhow!(
                "mail api request failed: status={} body={}",
                status,
                redact_response_body(&body)
            ));
        }

        return Ok(response);
    }

    Err(anyhow!("mail api request failed without response"))
}

pub(crate) async fn fetch_text(client: &Client, token: &str, url: &str) -> Result<String> {
    let response = send_with_retry(client, token, url, "application/json").await?;
    response.text().await.context("read mail api response body")
}

pub(crate) async fn fetch_bytes(client: &Client, token: &str, url: &str) -> Result<Vec<u8>> {
    let response = send_with_retry(client, token, url, "*/*").await?;
    let bytes = response
        .bytes()
        .await
        .context("read mail api response bytes")?;
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{fetch_bytes, fetch_text, redact_response_body};

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(300);
        let redacted = redact_response_body(&body);
        assert!(redacted.starts_with(&"é".repeat(200)));
        assert!(redacted.contains("truncated 600 bytes"));
        assert_eq!(redact_response_body("  short  "), "short");
    }

    #[tokio::test]
    async fn rate_limited_request_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
            .mount(&server)
            .await;

        let body = fetch_text(
            &reqwest::Client::new(),
            "tok",
            &format!("{}/items", server.uri()),
        )
        .await
        .expect("retried request succeeds");
        assert_eq!(body, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn error_status_carries_redacted_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let err = fetch_bytes(
            &reqwest::Client::new(),
            "tok",
            &format!("{}/blob", server.uri()),
        )
        .await
        .expect_err("403 is an error");
        let message = format!("{err:#}");
        assert!(message.contains("403"));
        assert!(message.contains("forbidden"));
    }
}
