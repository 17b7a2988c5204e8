use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::models::Provider;
use crate::db::token_cipher::TokenCipher;
use crate::db::Database;
use crate::error::IngestError;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GMAIL_SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];

const MICROSOFT_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPES: &[&str] = &["offline_access", "Mail.Read", "User.Read"];

const YAHOO_AUTH_URL: &str = "https://api.login.yahoo.com/oauth2/request_auth";
const YAHOO_TOKEN_URL: &str = "https://api.login.yahoo.com/oauth2/get_token";
const YAHOO_USERINFO_BASE: &str = "https://api.login.yahoo.com/openid/v1";
const YAHOO_SCOPES: &[&str] = &["openid", "mail-r"];
const YAHOO_IMAP_HOST: &str = "imap.mail.yahoo.com";
const YAHOO_IMAP_PORT: u16 = 993;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
}

/// Everything one provider's broker and mail client need, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    /// REST base for the mail API (Yahoo: the OpenID userinfo base).
    pub api_base: String,
    pub scopes: Vec<String>,
    pub imap: Option<ImapEndpoint>,
}

impl ProviderConfig {
    /// Provider defaults with the given client credentials.
    pub fn with_defaults(
        provider: Provider,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        let (auth_url, token_url, api_base, scopes, imap) = match provider {
            Provider::Gmail => (GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL, GMAIL_API_BASE, GMAIL_SCOPES, None),
            Provider::Outlook => (
                MICROSOFT_AUTH_URL,
                MICROSOFT_TOKEN_URL,
                GRAPH_API_BASE,
                GRAPH_SCOPES,
                None,
            ),
            Provider::Yahoo => (
                YAHOO_AUTH_URL,
                YAHOO_TOKEN_URL,
                YAHOO_USERINFO_BASE,
                YAHOO_SCOPES,
                Some(ImapEndpoint {
                    host: YAHOO_IMAP_HOST.to_string(),
                    port: YAHOO_IMAP_PORT,
                }),
            ),
        };

        Self {
            provider,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
            api_base: api_base.to_string(),
            scopes: scopes.iter().map(|scope| scope.to_string()).collect(),
            imap,
        }
    }

    fn from_lookup<F>(provider: Provider, lookup: &F) -> Result<Option<Self>, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = provider.env_prefix();
        let var = |suffix: &str| lookup(&format!("LABSYNC_{prefix}_{suffix}"));

        let (Some(client_id), Some(client_secret), Some(redirect_uri)) =
            (var("CLIENT_ID"), var("CLIENT_SECRET"), var("REDIRECT_URI"))
        else {
            return Ok(None);
        };

        let mut config = Self::with_defaults(provider, client_id, client_secret, redirect_uri);
        if let Some(auth_url) = var("AUTH_URL") {
            config.auth_url = auth_url;
        }
        if let Some(token_url) = var("TOKEN_URL") {
            config.token_url = token_url;
        }
        if let Some(api_base) = var("API_BASE") {
            config.api_base = api_base.trim_end_matches('/').to_string();
        }

        if let Some(imap) = config.imap.as_mut() {
            if let Some(host) = var("IMAP_HOST") {
                imap.host = host;
            }
            if let Some(port) = var("IMAP_PORT") {
                imap.port = port.parse().map_err(|_| {
                    IngestError::Config(format!("LABSYNC_{prefix}_IMAP_PORT must be a port number"))
                })?;
            }
        }

        Ok(Some(config))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub providers: Vec<ProviderConfig>,
    pub db_path: PathBuf,
    pub listen_addr: SocketAddr,
    pub record_dir: Option<PathBuf>,
    pub token_cipher: Option<TokenCipher>,
    pub post_sync_redirect: Option<String>,
    pub http_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, IngestError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, IngestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut providers = Vec::new();
        for provider in Provider::ALL {
            if let Some(config) = ProviderConfig::from_lookup(provider, &lookup)? {
                providers.push(config);
            }
        }

        let db_path = match lookup("LABSYNC_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => Database::default_db_path().map_err(|e| IngestError::Config(e.to_string()))?,
        };

        let listen_addr = lookup("LABSYNC_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| IngestError::Config(format!("LABSYNC_LISTEN_ADDR: {e}")))?;

        let token_cipher = lookup("LABSYNC_TOKEN_KEY")
            .map(|raw| TokenCipher::from_hex(&raw))
            .transpose()
            .map_err(|_| {
                IngestError::Config(
                    "LABSYNC_TOKEN_KEY must be 64 hex characters (32 bytes)".to_string(),
                )
            })?;

        let http_timeout = match lookup("LABSYNC_HTTP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                IngestError::Config("LABSYNC_HTTP_TIMEOUT_SECS must be a whole number".to_string())
            })?),
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        Ok(Self {
            providers,
            db_path,
            listen_addr,
            record_dir: lookup("LABSYNC_RECORD_DIR").map(PathBuf::from),
            token_cipher,
            post_sync_redirect: lookup("LABSYNC_POST_SYNC_REDIRECT"),
            http_timeout,
        })
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.iter().find(|config| config.provider == provider)
    }
}
