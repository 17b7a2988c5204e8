use thiserror::Error;

use crate::db::models::Provider;
use crate::db::DbError;

/// Failures of the ingestion pipeline and its collaborators.
///
/// Fatal variants abort a job at the step that produced them; item-scoped variants
/// only skip the message or attachment they describe.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("no stored {provider} token for user {user_id}")]
    MissingToken { user_id: String, provider: Provider },

    #[error("could not resolve mailbox account: {0}")]
    AccountResolution(String),

    #[error("lab directory lookup failed: {0}")]
    LabDirectory(String),

    #[error("user has no labs on file; cannot build a search filter")]
    EmptyLabDirectory,

    #[error("mailbox search failed: {0}")]
    Search(String),

    #[error("attachment fetch failed for message {message_id}: {detail}")]
    AttachmentFetch { message_id: String, detail: String },

    #[error("attachment {file_name} could not be decoded")]
    Decode { file_name: String },

    #[error("record persistence failed: {0}")]
    Persistence(#[from] DbError),

    #[error("record linking failed: {0}")]
    Linking(String),

    #[error("a {provider} sync is already running for user {user_id}")]
    SyncInProgress { user_id: String, provider: Provider },

    #[error("provider {0} is not configured")]
    ProviderNotConfigured(Provider),

    #[error("configuration: {0}")]
    Config(String),
}

impl IngestError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::AttachmentFetch { .. }
                | Self::Decode { .. }
                | Self::Persistence(_)
                | Self::Linking(_)
        )
    }
}
