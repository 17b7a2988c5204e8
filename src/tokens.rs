//! Persistence of OAuth tokens per (user, provider).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{MailboxToken, Provider, StoredTokenRow};
use crate::db::token_cipher::TokenCipher;
use crate::db::{lock, DbError, NewTokenRow, SharedDatabase};

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn save(&self, token: &MailboxToken) -> Result<(), DbError>;

    /// Most recently saved token for the pair, if any.
    async fn load(&self, user_id: &str, provider: Provider)
        -> Result<Option<MailboxToken>, DbError>;
}

/// Token rows in SQLite, sealed with AES-256-GCM when a cipher is configured.
pub struct SqliteTokenStore {
    db: SharedDatabase,
    cipher: Option<TokenCipher>,
}

impl SqliteTokenStore {
    pub fn new(db: SharedDatabase, cipher: Option<TokenCipher>) -> Self {
        Self { db, cipher }
    }

    fn seal(&self, value: &str) -> Result<String, DbError> {
        match &self.cipher {
            Some(cipher) => cipher.seal(value),
            None => Ok(value.to_string()),
        }
    }

    fn open_row(&self, row: StoredTokenRow) -> Result<MailboxToken, DbError> {
        let (access_token, refresh_token) = if row.encrypted {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                DbError::Crypto(format!(
                    "token {} is encrypted but no token key is configured",
                    row.token_id
                ))
            })?;
            (
                cipher.open(&row.access_token)?,
                row.refresh_token
                    .as_deref()
                    .map(|value| cipher.open(value))
                    .transpose()?,
            )
        } else {
            (row.access_token, row.refresh_token)
        };

        let expires_at = row
            .expires_at
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(|e| DbError::Config(format!("token {} expiry: {e}", row.token_id)))?
            .map(|dt| dt.with_timezone(&Utc));

        Ok(MailboxToken {
            user_id: row.user_id,
            provider: row.provider,
            access_token,
            refresh_token,
            provider_id: row.provider_id,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn save(&self, token: &MailboxToken) -> Result<(), DbError> {
        let access_token = self.seal(&token.access_token)?;
        let refresh_token = token
            .refresh_token
            .as_deref()
            .map(|value| self.seal(value))
            .transpose()?;

        let db = lock(&self.db)?;
        db.insert_token(&NewTokenRow {
            user_id: &token.user_id,
            provider: token.provider,
            access_token: &access_token,
            refresh_token: refresh_token.as_deref(),
            provider_id: token.provider_id.as_deref(),
            expires_at: token.expires_at.map(|dt| dt.to_rfc3339()),
            encrypted: self.cipher.is_some(),
        })?;
        Ok(())
    }

    async fn load(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<MailboxToken>, DbError> {
        let row = lock(&self.db)?.latest_token(user_id, provider)?;
        row.map(|row| self.open_row(row)).transpose()
    }
}
