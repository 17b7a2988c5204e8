use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
    Yahoo,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Gmail, Provider::Outlook, Provider::Yahoo];

    /// Prefix used for this provider's `LABSYNC_<P>_*` environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Gmail => "GMAIL",
            Self::Outlook => "OUTLOOK",
            Self::Yahoo => "YAHOO",
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gmail => write!(f, "gmail"),
            Self::Outlook => write!(f, "outlook"),
            Self::Yahoo => write!(f, "yahoo"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(Self::Gmail),
            "outlook" | "microsoft" | "graph" | "hotmail" => Ok(Self::Outlook),
            "yahoo" => Ok(Self::Yahoo),
            other => Err(format!("invalid provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxToken {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Account email on the provider side, known once the session is resolved.
    pub provider_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MailboxToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= Utc::now())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MedicalRecord {
    pub record_id: i64,
    pub record_name: String,
    pub record_size: i64,
    pub record_ext: String,
    pub upload_source: String,
    pub description: Option<String>,
    pub source_metadata: Option<serde_json::Value>,
    #[serde(skip)]
    pub file_data: Option<Vec<u8>>,
    pub file_path: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordOwnership {
    pub user_id: String,
    pub record_id: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessStatus {
    pub process_status_id: i64,
    pub job_id: String,
    pub user_id: String,
    pub process_type: String,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub status: JobStatus,
    pub step: String,
    pub status_message: Option<String>,
    pub error_detail: Option<String>,
    pub attempted: Option<i64>,
    pub succeeded: Option<i64>,
    pub failed: Option<i64>,
    pub total: Option<i64>,
    pub started_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lab {
    pub lab_id: i64,
    pub user_id: String,
    pub lab_name: String,
    pub lab_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordLink {
    pub link_id: i64,
    pub user_id: String,
    pub record_id: i64,
    pub job_id: Option<String>,
    pub created_at: String,
}

fn parse_json_value(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
}

fn invalid_text(raw: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

impl MedicalRecord {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            record_id: row.get("record_id")?,
            record_name: row.get("record_name")?,
            record_size: row.get("record_size")?,
            record_ext: row.get("record_ext")?,
            upload_source: row.get("upload_source")?,
            description: row.get("description")?,
            source_metadata: parse_json_value(row.get("source_metadata")?),
            file_data: row.get("file_data")?,
            file_path: row.get("file_path")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl RecordOwnership {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            user_id: row.get("user_id")?,
            record_id: row.get("record_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl ProcessStatus {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let status_raw: String = row.get("status")?;
        let status = JobStatus::from_str(&status_raw).map_err(|e| invalid_text(&status_raw, e))?;

        Ok(Self {
            process_status_id: row.get("process_status_id")?,
            job_id: row.get("job_id")?,
            user_id: row.get("user_id")?,
            process_type: row.get("process_type")?,
            entity_id: row.get("entity_id")?,
            entity_type: row.get("entity_type")?,
            status,
            step: row.get("step")?,
            status_message: row.get("status_message")?,
            error_detail: row.get("error_detail")?,
            attempted: row.get("attempted")?,
            succeeded: row.get("succeeded")?,
            failed: row.get("failed")?,
            total: row.get("total")?,
            started_at: row.get("started_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

impl Lab {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            lab_id: row.get("lab_id")?,
            user_id: row.get("user_id")?,
            lab_name: row.get("lab_name")?,
            lab_email: row.get("lab_email")?,
        })
    }
}

impl RecordLink {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            link_id: row.get("link_id")?,
            user_id: row.get("user_id")?,
            record_id: row.get("record_id")?,
            job_id: row.get("job_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Raw `mailbox_tokens` row; token columns may hold an encrypted envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTokenRow {
    pub token_id: i64,
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub provider_id: Option<String>,
    pub expires_at: Option<String>,
    pub encrypted: bool,
}

impl StoredTokenRow {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let provider_raw: String = row.get("provider")?;
        let provider =
            Provider::from_str(&provider_raw).map_err(|e| invalid_text(&provider_raw, e))?;

        Ok(Self {
            token_id: row.get("token_id")?,
            user_id: row.get("user_id")?,
            provider,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            provider_id: row.get("provider_id")?,
            expires_at: row.get("expires_at")?,
            encrypted: row.get("encrypted")?,
        })
    }
}
