use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::auth::{CredentialBroker, OAuthBroker};
use crate::config::AppConfig;
use crate::db::models::{Lab, MailboxToken, Provider};
use crate::error::IngestError;

pub mod filters;
pub mod gmail_api;
pub mod graph_api;
pub(crate) mod http;
pub mod yahoo_imap;

pub use gmail_api::GmailClient;
pub use graph_api::GraphClient;
pub use yahoo_imap::YahooImapClient;

/// An authenticated mailbox: the bearer token plus the account it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSession {
    pub access_token: String,
    pub account_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentDescriptor {
    pub attachment_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: Option<i64>,
    /// Bytes already in hand from the listing call, if the provider returned them.
    #[serde(skip)]
    pub inline_data: Option<Vec<u8>>,
    /// Content travels with the listing; there is no separate download to fall back on.
    #[serde(skip)]
    pub listed_inline: bool,
}

impl AttachmentDescriptor {
    fn inline_blob(&self, message_id: &str) -> Option<AttachmentBlob> {
        self.inline_data.as_ref().map(|content| AttachmentBlob {
            file_name: self.file_name.clone(),
            content: content.clone(),
            mime_type: self.mime_type.clone(),
            message_id: message_id.to_string(),
            attachment_id: self.attachment_id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderMessage {
    pub message_id: String,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub received_at: Option<String>,
    pub has_attachments: bool,
    pub snippet: Option<String>,
    pub attachments: Vec<AttachmentDescriptor>,
}

impl ProviderMessage {
    /// Subject, falling back to the snippet when the subject is blank.
    pub fn description(&self) -> Option<String> {
        [self.subject.as_deref(), self.snippet.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentBlob {
    pub file_name: String,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub message_id: String,
    pub attachment_id: String,
}

/// The capability set every mailbox provider offers the sync pipeline.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> Provider;

    /// Provider search expression narrowing the mailbox to the user's labs.
    fn build_filter(&self, labs: &[Lab]) -> Result<String, IngestError>;

    async fn resolve_account(&self, token: &MailboxToken) -> Result<MailSession, IngestError>;

    /// Drains every result page; a failed page fails the whole search.
    async fn search(
        &self,
        session: &MailSession,
        filter: &str,
    ) -> Result<Vec<ProviderMessage>, IngestError>;

    async fn list_attachments(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
    ) -> Result<Vec<AttachmentDescriptor>, IngestError>;

    async fn download_attachment(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
        descriptor: &AttachmentDescriptor,
    ) -> Result<AttachmentBlob, IngestError>;

    async fn fetch_attachments(
        &self,
        session: &MailSession,
        message: &ProviderMessage,
    ) -> Result<Vec<AttachmentBlob>, IngestError> {
        let descriptors = self.list_attachments(session, message).await?;
        let mut blobs = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            blobs.push(self.download_attachment(session, message, descriptor).await?);
        }
        Ok(blobs)
    }
}

pub struct ProviderEntry {
    pub client: Arc<dyn MailProvider>,
    pub broker: Arc<dyn CredentialBroker>,
}

pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Builds a client and broker for every provider with credentials in `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("build http client: {e}")))?;

        let mut registry = Self::new();
        for provider_config in &config.providers {
            let client: Arc<dyn MailProvider> = match provider_config.provider {
                Provider::Gmail => Arc::new(GmailClient::new(http.clone(), &provider_config.api_base)),
                Provider::Outlook => {
                    Arc::new(GraphClient::new(http.clone(), &provider_config.api_base))
                }
                Provider::Yahoo => Arc::new(YahooImapClient::from_config(
                    http.clone(),
                    provider_config,
                )?),
            };
            let broker = Arc::new(OAuthBroker::new(provider_config.clone(), http.clone()));
            registry.register(client, broker);
            info!(provider = %provider_config.provider, "mailbox provider enabled");
        }
        Ok(registry)
    }

    /// Replaces any entry already registered for the same provider.
    pub fn register(&mut self, client: Arc<dyn MailProvider>, broker: Arc<dyn CredentialBroker>) {
        let kind = client.kind();
        self.entries.retain(|entry| entry.client.kind() != kind);
        self.entries.push(ProviderEntry { client, broker });
    }

    pub fn get(&self, provider: Provider) -> Option<&ProviderEntry> {
        self.entries
            .iter()
            .find(|entry| entry.client.kind() == provider)
    }

    pub fn all(&self) -> &[ProviderEntry] {
        &self.entries
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{
        AttachmentBlob, AttachmentDescriptor, MailProvider, MailSession, ProviderMessage,
        ProviderRegistry,
    };
    use crate::auth::{CredentialBroker, MailboxGrant};
    use crate::db::models::{Lab, MailboxToken, Provider};
    use crate::error::IngestError;

    struct DummyProvider;

    #[async_trait]
    impl MailProvider for DummyProvider {
        fn kind(&self) -> Provider {
            Provider::Yahoo
        }

        fn build_filter(&self, _labs: &[Lab]) -> Result<String, IngestError> {
            Ok("ALL".to_string())
        }

        async fn resolve_account(&self, _token: &MailboxToken) -> Result<MailSession, IngestError> {
            Ok(MailSession {
                access_token: "t".to_string(),
                account_email: "me@yahoo.test".to_string(),
            })
        }

        async fn search(
            &self,
            _session: &MailSession,
            _filter: &str,
        ) -> Result<Vec<ProviderMessage>, IngestError> {
            Ok(Vec::new())
        }

        async fn list_attachments(
            &self,
            _session: &MailSession,
            message: &ProviderMessage,
        ) -> Result<Vec<AttachmentDescriptor>, IngestError> {
            Ok(message.attachments.clone())
        }

        async fn download_attachment(
            &self,
            _session: &MailSession,
            message: &ProviderMessage,
            descriptor: &AttachmentDescriptor,
        ) -> Result<AttachmentBlob, IngestError> {
            descriptor
                .inline_blob(&message.message_id)
                .ok_or_else(|| IngestError::AttachmentFetch {
                    message_id: message.message_id.clone(),
                    detail: "no inline data".to_string(),
                })
        }
    }

    struct DummyBroker;

    #[async_trait]
    impl CredentialBroker for DummyBroker {
        fn provider(&self) -> Provider {
            Provider::Yahoo
        }

        fn authorization_url(&self, user_id: &str) -> String {
            format!("https://auth.test/?state={user_id}")
        }

        async fn exchange_code(&self, _code: &str) -> Result<MailboxGrant, IngestError> {
            Err(IngestError::TokenExchangeFailed("dummy".to_string()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<MailboxGrant, IngestError> {
            Err(IngestError::TokenExchangeFailed("dummy".to_string()))
        }
    }

    fn message(subject: Option<&str>, snippet: Option<&str>) -> ProviderMessage {
        ProviderMessage {
            message_id: "7".to_string(),
            sender: None,
            subject: subject.map(str::to_string),
            received_at: None,
            has_attachments: true,
            snippet: snippet.map(str::to_string),
            attachments: vec![AttachmentDescriptor {
                attachment_id: "7.2".to_string(),
                file_name: "lipids.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                size: Some(3),
                inline_data: Some(vec![1, 2, 3]),
                listed_inline: true,
            }],
        }
    }

    #[test]
    fn description_falls_back_to_snippet() {
        assert_eq!(
            message(Some("Blood Panel"), Some("snippet")).description().as_deref(),
            Some("Blood Panel")
        );
        assert_eq!(
            message(Some("  "), Some("Your results")).description().as_deref(),
            Some("Your results")
        );
        assert!(message(None, None).description().is_none());
    }

    #[tokio::test]
    async fn fetch_attachments_downloads_every_descriptor() {
        let provider = DummyProvider;
        let session = MailSession {
            access_token: "t".to_string(),
            account_email: "me@yahoo.test".to_string(),
        };
        let blobs = provider
            .fetch_attachments(&session, &message(Some("s"), None))
            .await
            .expect("fetch attachments");
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].content, vec![1, 2, 3]);
        assert_eq!(blobs[0].message_id, "7");
    }

    #[test]
    fn registry_registers_and_finds_providers() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(DummyProvider), Arc::new(DummyBroker));
        registry.register(Arc::new(DummyProvider), Arc::new(DummyBroker));
        assert_eq!(registry.all().len(), 1);

        let entry = registry.get(Provider::Yahoo).expect("yahoo registered");
        assert_eq!(
            entry.broker.authorization_url("42"),
            "https://auth.test/?state=42"
        );
        assert!(registry.get(Provider::Gmail).is_none());
    }
}
