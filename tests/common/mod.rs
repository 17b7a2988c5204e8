#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Notify;

use labsync::auth::{CredentialBroker, MailboxGrant};
use labsync::connectors::filters::gmail_filter;
use labsync::connectors::{
    AttachmentBlob, AttachmentDescriptor, MailProvider, MailSession, ProviderMessage,
    ProviderRegistry,
};
use labsync::db::models::{Lab, MailboxToken, Provider};
use labsync::db::{shared, Database, DbError, SharedDatabase};
use labsync::error::IngestError;
use labsync::labs::SqliteLabDirectory;
use labsync::linking::SqliteRecordLinker;
use labsync::records::RecordPersister;
use labsync::status::StatusTracker;
use labsync::sync::SyncOrchestrator;
use labsync::tokens::{SqliteTokenStore, TokenStore};

pub const ACCOUNT_EMAIL: &str = "patient@mail.test";

/// Scripted mailbox: fixed search results and per-attachment download outcomes.
pub struct FakeMailbox {
    pub kind: Provider,
    pub messages: Vec<ProviderMessage>,
    pub attachments: HashMap<String, Vec<AttachmentDescriptor>>,
    pub broken_downloads: Vec<String>,
    /// Message ids whose attachment listing errors out.
    pub fail_list: Vec<String>,
    pub fail_resolve: bool,
    pub fail_search: bool,
    pub search_gate: Option<Arc<Notify>>,
    pub search_calls: AtomicUsize,
}

impl FakeMailbox {
    pub fn new(kind: Provider) -> Self {
        Self {
            kind,
            messages: Vec::new(),
            attachments: HashMap::new(),
            broken_downloads: Vec::new(),
            fail_list: Vec::new(),
            fail_resolve: false,
            fail_search: false,
            search_gate: None,
            search_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_message(mut self, message: ProviderMessage, attachments: Vec<AttachmentDescriptor>) -> Self {
        self.attachments
            .insert(message.message_id.clone(), attachments);
        self.messages.push(message);
        self
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailProvider for FakeMailbox {
    fn kind(&self) -> Provider {
        self.kind
    }

    fn build_filter(&self, labs: &[Lab]) -> Result<String, IngestError> {
        gmail_filter(labs)
    }

    async fn resolve_account(&self, token: &MailboxToken) -> Result<MailSession, IngestError> {
        if self.fail_resolve {
            return Err(IngestError::AccountResolution("profile returned status 401".to_string()));
        }
        Ok(MailSession {
            access_token: token.access_token.clone(),
            account_email: ACCOUNT_EMAIL.to_string(),
        })
    }

    async fn search(
        &self,
        _session: &MailSession,
        _filter: &str,
    ) -> Result<Vec<ProviderMessage>, IngestError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.search_gate {
            gate.notified().await;
        }
        if self.fail_search {
            return Err(IngestError::Search("page 2 returned status 500".to_string()));
        }
        Ok(self.messages.clone())
    }

    async fn list_attachments(
        &self,
        _session: &MailSession,
        message: &ProviderMessage,
    ) -> Result<Vec<AttachmentDescriptor>, IngestError> {
        if self.fail_list.contains(&message.message_id) {
            return Err(IngestError::AttachmentFetch {
                message_id: message.message_id.clone(),
                detail: "status=404".to_string(),
            });
        }
        Ok(self
            .attachments
            .get(&message.message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_attachment(
        &self,
        _session: &MailSession,
        message: &ProviderMessage,
        descriptor: &AttachmentDescriptor,
    ) -> Result<AttachmentBlob, IngestError> {
        if self.broken_downloads.contains(&descriptor.attachment_id) {
            return Err(IngestError::AttachmentFetch {
                message_id: message.message_id.clone(),
                detail: "status=500".to_string(),
            });
        }
        let size = descriptor.size.unwrap_or(4) as usize;
        Ok(AttachmentBlob {
            file_name: descriptor.file_name.clone(),
            content: vec![b'x'; size],
            mime_type: descriptor.mime_type.clone(),
            message_id: message.message_id.clone(),
            attachment_id: descriptor.attachment_id.clone(),
        })
    }
}

/// Accepts any code except `bad-code`; refresh hands back a fresh hour-long token.
pub struct FakeBroker {
    pub kind: Provider,
    pub refresh_calls: AtomicUsize,
}

impl FakeBroker {
    pub fn new(kind: Provider) -> Self {
        Self {
            kind,
            refresh_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CredentialBroker for FakeBroker {
    fn provider(&self) -> Provider {
        self.kind
    }

    fn authorization_url(&self, user_id: &str) -> String {
        format!("https://consent.test/authorize?state={user_id}")
    }

    async fn exchange_code(&self, code: &str) -> Result<MailboxGrant, IngestError> {
        if code == "bad-code" {
            return Err(IngestError::TokenExchangeFailed("invalid_grant".to_string()));
        }
        Ok(MailboxGrant {
            access_token: format!("access-{code}"),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<MailboxGrant, IngestError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MailboxGrant {
            access_token: "access-refreshed".to_string(),
            refresh_token: Some(refresh_token.to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
    }
}

/// A token store whose backing storage is gone.
pub struct BrokenTokenStore;

#[async_trait]
impl TokenStore for BrokenTokenStore {
    async fn save(&self, _token: &MailboxToken) -> Result<(), DbError> {
        Err(DbError::Config("token table is read-only".to_string()))
    }

    async fn load(
        &self,
        _user_id: &str,
        _provider: Provider,
    ) -> Result<Option<MailboxToken>, DbError> {
        Err(DbError::Config("token table is read-only".to_string()))
    }
}

pub struct Harness {
    pub db: SharedDatabase,
    pub mailbox: Arc<FakeMailbox>,
    pub broker: Arc<FakeBroker>,
    pub orchestrator: SyncOrchestrator,
}

pub fn harness(mailbox: FakeMailbox) -> Harness {
    let db = shared(Database::open_in_memory().expect("open in-memory db"));
    let tokens = Arc::new(SqliteTokenStore::new(db.clone(), None));
    harness_with_tokens(db, mailbox, tokens)
}

pub fn harness_with_tokens(
    db: SharedDatabase,
    mailbox: FakeMailbox,
    tokens: Arc<dyn TokenStore>,
) -> Harness {
    let mailbox = Arc::new(mailbox);
    let broker = Arc::new(FakeBroker::new(mailbox.kind));

    let mut registry = ProviderRegistry::new();
    registry.register(mailbox.clone(), broker.clone());

    let orchestrator = SyncOrchestrator::new(
        Arc::new(registry),
        tokens,
        Arc::new(SqliteLabDirectory::new(db.clone())),
        Arc::new(SqliteRecordLinker::new(db.clone())),
        Arc::new(RecordPersister::new(db.clone(), None)),
        StatusTracker::new(db.clone()),
    );

    Harness {
        db,
        mailbox,
        broker,
        orchestrator,
    }
}

pub fn add_lab(db: &SharedDatabase, user_id: &str, name: &str, email: Option<&str>) {
    SqliteLabDirectory::new(db.clone())
        .add_lab(user_id, name, email)
        .expect("add lab");
}

pub fn message(message_id: &str, subject: &str, sender: &str, has_attachments: bool) -> ProviderMessage {
    ProviderMessage {
        message_id: message_id.to_string(),
        sender: Some(sender.to_string()),
        subject: Some(subject.to_string()),
        received_at: Some("2024-03-01T10:00:00+00:00".to_string()),
        has_attachments,
        snippet: None,
        attachments: Vec::new(),
    }
}

pub fn descriptor(attachment_id: &str, file_name: &str, mime_type: &str, size: i64) -> AttachmentDescriptor {
    AttachmentDescriptor {
        attachment_id: attachment_id.to_string(),
        file_name: file_name.to_string(),
        mime_type: mime_type.to_string(),
        size: Some(size),
        inline_data: None,
        listed_inline: false,
    }
}
