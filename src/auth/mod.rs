//! OAuth dialects for the supported mailbox providers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::connectors::http::redact_response_body;
use crate::db::models::{MailboxToken, Provider};
use crate::error::IngestError;

const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Token material returned by a provider token endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MailboxGrant {
    pub fn into_token(
        self,
        user_id: &str,
        provider: Provider,
        provider_id: Option<String>,
    ) -> MailboxToken {
        MailboxToken {
            user_id: user_id.to_string(),
            provider,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            provider_id,
            expires_at: self.expires_at,
        }
    }
}

#[async_trait]
pub trait CredentialBroker: Send + Sync {
    fn provider(&self) -> Provider;

    /// Consent URL carrying `user_id` as the OAuth `state`.
    fn authorization_url(&self, user_id: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<MailboxGrant, IngestError>;

    async fn refresh(&self, refresh_token: &str) -> Result<MailboxGrant, IngestError>;
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[allow(dead_code)]
    token_type: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

fn expiry_from_now(expires_in: i64) -> Option<DateTime<Utc>> {
    let lifetime = Duration::try_seconds(expires_in.saturating_sub(EXPIRY_SKEW_SECONDS))?;
    Utc::now().checked_add_signed(lifetime)
}

#[derive(Debug, Clone)]
pub struct OAuthBroker {
    config: ProviderConfig,
    client: Client,
}

impl OAuthBroker {
    pub fn new(config: ProviderConfig, client: Client) -> Self {
        if Url::parse(&config.auth_url).is_err() {
            warn!(
                provider = %config.provider,
                auth_url = %config.auth_url,
                "authorization URL does not parse; consent links will be concatenated"
            );
        }
        Self { config, client }
    }

    fn authorization_params(&self, user_id: &str) -> Vec<(&str, String)> {
        let mut params = vec![
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("response_type", "code".to_string()),
            ("scope", self.config.scopes.join(" ")),
            ("state", user_id.to_string()),
        ];
        params.extend(
            self.provider_extras()
                .iter()
                .map(|(key, value)| (*key, (*value).to_string())),
        );
        params
    }

    fn provider_extras(&self) -> &'static [(&'static str, &'static str)] {
        match self.config.provider {
            Provider::Gmail => &[
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("include_granted_scopes", "true"),
            ],
            Provider::Outlook => &[("response_mode", "query"), ("prompt", "select_account")],
            Provider::Yahoo => &[],
        }
    }

    async fn request_token(
        &self,
        form: &[(&str, &str)],
        grant: &str,
    ) -> Result<MailboxGrant, IngestError> {
        let provider = self.config.provider;
        let response = self
            .client
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                IngestError::TokenExchangeFailed(format!(
                    "{provider} {grant} request to {}: {e}",
                    self.config.token_url
                ))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            IngestError::TokenExchangeFailed(format!("{provider} {grant} response body: {e}"))
        })?;
        if !status.is_success() {
            return Err(IngestError::TokenExchangeFailed(format!(
                "{provider} {grant} rejected: status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body).map_err(|e| {
            IngestError::TokenExchangeFailed(format!(
                "{provider} {grant} returned malformed JSON: {e}"
            ))
        })?;
        if payload.access_token.trim().is_empty() {
            return Err(IngestError::TokenExchangeFailed(format!(
                "{provider} {grant} returned an empty access token"
            )));
        }

        debug!(%provider, grant, "token endpoint accepted request");
        let expires_at = match payload.expires_in {
            Some(seconds) => Some(expiry_from_now(seconds).ok_or_else(|| {
                IngestError::TokenExchangeFailed(format!(
                    "{provider} {grant} returned expires_in out of range: {seconds}"
                ))
            })?),
            None => None,
        };

        Ok(MailboxGrant {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expires_at,
        })
    }
}

#[async_trait]
impl CredentialBroker for OAuthBroker {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    fn authorization_url(&self, user_id: &str) -> String {
        let params = self.authorization_params(user_id);
        match Url::parse(&self.config.auth_url) {
            Ok(mut url) => {
                url.query_pairs_mut().extend_pairs(params.iter());
                url.to_string()
            }
            Err(_) => {
                let query = params
                    .iter()
                    .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
                    .collect::<Vec<_>>()
                    .join("&");
                let base = &self.config.auth_url;
                let separator = if base.contains('?') { '&' } else { '?' };
                format!("{base}{separator}{query}")
            }
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<MailboxGrant, IngestError> {
        self.request_token(
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ],
            "authorization_code",
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<MailboxGrant, IngestError> {
        let mut grant = self
            .request_token(
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", self.config.client_id.as_str()),
                    ("client_secret", self.config.client_secret.as_str()),
                    ("redirect_uri", self.config.redirect_uri.as_str()),
                ],
                "refresh_token",
            )
            .await?;
        if grant.refresh_token.is_none() {
            grant.refresh_token = Some(refresh_token.to_string());
        }
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Url;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{CredentialBroker, OAuthBroker};
    use crate::config::ProviderConfig;
    use crate::db::models::Provider;
    use crate::error::IngestError;

    fn broker(provider: Provider, token_url: Option<String>) -> OAuthBroker {
        let mut config = ProviderConfig::with_defaults(
            provider,
            "client-123",
            "secret-456",
            "http://localhost:8080/oauth/callback",
        );
        if let Some(token_url) = token_url {
            config.token_url = token_url;
        }
        OAuthBroker::new(config, reqwest::Client::new())
    }

    fn query_value(url: &str, key: &str) -> Option<String> {
        Url::parse(url)
            .expect("parse url")
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn authorization_url_embeds_user_as_state() {
        let url = broker(Provider::Gmail, None).authorization_url("42");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert_eq!(query_value(&url, "state").as_deref(), Some("42"));
        assert_eq!(query_value(&url, "client_id").as_deref(), Some("client-123"));
        assert_eq!(query_value(&url, "response_type").as_deref(), Some("code"));
        assert_eq!(query_value(&url, "access_type").as_deref(), Some("offline"));
    }

    #[test]
    fn outlook_and_yahoo_use_their_own_dialects() {
        let outlook = broker(Provider::Outlook, None).authorization_url("user-1");
        assert!(outlook.contains("login.microsoftonline.com"));
        assert_eq!(
            query_value(&outlook, "scope").as_deref(),
            Some("offline_access Mail.Read User.Read")
        );
        assert_eq!(query_value(&outlook, "response_mode").as_deref(), Some("query"));

        let yahoo = broker(Provider::Yahoo, None).authorization_url("user-1");
        assert!(yahoo.contains("api.login.yahoo.com"));
        assert!(query_value(&yahoo, "access_type").is_none());
    }

    #[test]
    fn unparseable_auth_url_falls_back_to_concatenation() {
        let mut config = ProviderConfig::with_defaults(Provider::Gmail, "id", "secret", "cb");
        config.auth_url = "consent/authorize".to_string();
        let url = OAuthBroker::new(config, reqwest::Client::new()).authorization_url("user 42");
        assert!(url.starts_with("consent/authorize?client_id=id&"));
        assert!(url.contains("&state=user%2042&"));
        assert!(url.ends_with("&include_granted_scopes=true"));
    }

    #[tokio::test]
    async fn oversized_expires_in_is_token_exchange_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "a",
                "expires_in": i64::MAX
            })))
            .mount(&server)
            .await;

        let result = broker(Provider::Gmail, Some(format!("{}/token", server.uri())))
            .exchange_code("c")
            .await;
        match result {
            Err(IngestError::TokenExchangeFailed(detail)) => {
                assert!(detail.contains("expires_in out of range"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exchange_code_returns_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.access",
                "refresh_token": "1//refresh",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let grant = broker(Provider::Gmail, Some(format!("{}/token", server.uri())))
            .exchange_code("auth-code")
            .await
            .expect("exchange succeeds");
        assert_eq!(grant.access_token, "ya29.access");
        assert_eq!(grant.refresh_token.as_deref(), Some("1//refresh"));
        assert!(grant.expires_at.is_some());
    }

    #[tokio::test]
    async fn exchange_code_rejection_is_token_exchange_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let err = broker(Provider::Outlook, Some(format!("{}/token", server.uri())))
            .exchange_code("stale")
            .await
            .expect_err("400 must fail");
        match err {
            IngestError::TokenExchangeFailed(detail) => assert!(detail.contains("invalid_grant")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_token_body_is_token_exchange_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let result = broker(Provider::Yahoo, Some(format!("{}/token", server.uri())))
            .exchange_code("code")
            .await;
        assert!(matches!(result, Err(IngestError::TokenExchangeFailed(_))));
    }

    #[tokio::test]
    async fn refresh_keeps_previous_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3599
            })))
            .mount(&server)
            .await;

        let grant = broker(Provider::Gmail, Some(format!("{}/token", server.uri())))
            .refresh("keep-me")
            .await
            .expect("refresh succeeds");
        assert_eq!(grant.access_token, "fresh");
        assert_eq!(grant.refresh_token.as_deref(), Some("keep-me"));
    }
}
