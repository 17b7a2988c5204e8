//! Turns downloaded attachments into owned medical records.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connectors::{AttachmentBlob, ProviderMessage};
use crate::db::models::{MedicalRecord, Provider};
use crate::db::{lock, DbError, NewMedicalRecord, SharedDatabase};
use crate::error::IngestError;

const FALLBACK_FILE_NAME: &str = "attachment.bin";

fn unsafe_file_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").expect("compile file name regex"))
}

/// Replaces every character outside `[A-Za-z0-9._-]` so the name is safe as a path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized = unsafe_file_chars().replace_all(name.trim(), "_");
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        sanitized.into_owned()
    }
}

pub struct RecordPersister {
    db: SharedDatabase,
    record_dir: Option<PathBuf>,
}

impl RecordPersister {
    /// With `record_dir` set, file bytes go to disk and the row stores the path.
    pub fn new(db: SharedDatabase, record_dir: Option<PathBuf>) -> Self {
        Self { db, record_dir }
    }

    pub fn persist(
        &self,
        blob: &AttachmentBlob,
        message: &ProviderMessage,
        user_id: &str,
        provider: Provider,
    ) -> Result<MedicalRecord, IngestError> {
        let written = match &self.record_dir {
            Some(dir) => Some(write_record_file(dir, user_id, blob)?),
            None => None,
        };

        let record = NewMedicalRecord {
            record_name: blob.file_name.clone(),
            record_size: blob.content.len() as i64,
            record_ext: blob.mime_type.clone(),
            upload_source: provider.to_string(),
            description: message.description(),
            source_metadata: Some(json!({
                "message_id": blob.message_id,
                "attachment_id": blob.attachment_id,
                "sender": message.sender,
                "received_at": message.received_at,
            })),
            file_data: written.is_none().then(|| blob.content.clone()),
            file_path: written
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        };

        let inserted = lock(&self.db).and_then(|mut db| db.insert_record_with_owner(&record, user_id));
        match inserted {
            Ok(stored) => {
                debug!(
                    record_id = stored.record_id,
                    user_id,
                    record_name = %stored.record_name,
                    "record persisted"
                );
                Ok(stored)
            }
            Err(error) => {
                if let Some(path) = written {
                    if let Err(remove_error) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), %remove_error, "could not remove orphaned record file");
                    }
                }
                Err(IngestError::Persistence(error))
            }
        }
    }
}

fn write_record_file(dir: &Path, user_id: &str, blob: &AttachmentBlob) -> Result<PathBuf, DbError> {
    let user_dir = dir.join(sanitize_file_name(user_id));
    std::fs::create_dir_all(&user_dir)?;

    let path = user_dir.join(format!(
        "{}-{}",
        Uuid::new_v4(),
        sanitize_file_name(&blob.file_name)
    ));
    std::fs::write(&path, &blob.content)?;
    Ok(path)
}
