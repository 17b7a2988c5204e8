use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::models::{
    JobStatus, Lab, MedicalRecord, ProcessStatus, Provider, RecordLink, RecordOwnership,
    StoredTokenRow,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("token encryption: {0}")]
    Crypto(String),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;
pub mod token_cipher;

/// Handle shared by the tracker, persister and collaborator stores.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

pub fn lock(db: &SharedDatabase) -> Result<MutexGuard<'_, Database>, DbError> {
    db.lock()
        .map_err(|_| DbError::Config("database lock poisoned".to_string()))
}

#[derive(Debug, Clone)]
pub struct NewTokenRow<'a> {
    pub user_id: &'a str,
    pub provider: Provider,
    pub access_token: &'a str,
    pub refresh_token: Option<&'a str>,
    pub provider_id: Option<&'a str>,
    pub expires_at: Option<String>,
    pub encrypted: bool,
}

#[derive(Debug, Clone)]
pub struct NewMedicalRecord {
    pub record_name: String,
    pub record_size: i64,
    pub record_ext: String,
    pub upload_source: String,
    pub description: Option<String>,
    pub source_metadata: Option<serde_json::Value>,
    pub file_data: Option<Vec<u8>>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewProcessStatus {
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
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRecordCount {
    pub upload_source: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    pub total_ownerships: i64,
    pub total_jobs: i64,
    pub total_labs: i64,
    pub records_by_source: Vec<SourceRecordCount>,
}

const RECORD_COLUMNS: &str = r#"
    medical_records.record_id, medical_records.record_name, medical_records.record_size,
    medical_records.record_ext, medical_records.upload_source, medical_records.description,
    medical_records.source_metadata, medical_records.file_data, medical_records.file_path,
    medical_records.status, medical_records.created_at
"#;

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self, DbError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let mut db = Self { conn, path };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        self.run_migrations()
    }

    fn run_migrations(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".labsync").join("labsync.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_token(&self, token: &NewTokenRow<'_>) -> Result<i64, DbError> {
        self.conn.execute(
            r#"
            INSERT INTO mailbox_tokens (
                user_id, provider, access_token, refresh_token, provider_id, expires_at, encrypted
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                token.user_id,
                token.provider.to_string(),
                token.access_token,
                token.refresh_token,
                token.provider_id,
                token.expires_at,
                token.encrypted,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recently saved token row for the pair.
    pub fn latest_token(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Option<StoredTokenRow>, DbError> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT token_id, user_id, provider, access_token, refresh_token, provider_id,
                       expires_at, encrypted
                FROM mailbox_tokens
                WHERE user_id = ? AND provider = ?
                ORDER BY token_id DESC
                LIMIT 1
                "#,
                params![user_id, provider.to_string()],
                StoredTokenRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Inserts the record and its ownership row in one transaction.
    pub fn insert_record_with_owner(
        &mut self,
        record: &NewMedicalRecord,
        user_id: &str,
    ) -> Result<MedicalRecord, DbError> {
        let metadata = record
            .source_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO medical_records (
                record_name, record_size, record_ext, upload_source, description,
                source_metadata, file_data, file_path
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.record_name,
                record.record_size,
                record.record_ext,
                record.upload_source,
                record.description,
                metadata,
                record.file_data,
                record.file_path,
            ],
        )?;
        let record_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO user_records (user_id, record_id) VALUES (?, ?)",
            params![user_id, record_id],
        )?;

        let stored = tx.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM medical_records WHERE record_id = ?"),
            [record_id],
            MedicalRecord::from_row,
        )?;
        tx.commit()?;

        Ok(stored)
    }

    pub fn get_record(&self, record_id: i64) -> Result<Option<MedicalRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM medical_records WHERE record_id = ?"),
                [record_id],
                MedicalRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn records_for_user(&self, user_id: &str) -> Result<Vec<MedicalRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM medical_records
            JOIN user_records ON user_records.record_id = medical_records.record_id
            WHERE user_records.user_id = ?
            ORDER BY medical_records.record_id ASC
            "#
        ))?;

        let records = stmt
            .query_map([user_id], MedicalRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn ownerships_for_user(&self, user_id: &str) -> Result<Vec<RecordOwnership>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT user_id, record_id, created_at
            FROM user_records
            WHERE user_id = ?
            ORDER BY record_id ASC
            "#,
        )?;

        let rows = stmt
            .query_map([user_id], RecordOwnership::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn append_process_status(&self, entry: &NewProcessStatus) -> Result<i64, DbError> {
        let completed_at = entry
            .status
            .is_terminal()
            .then(|| chrono::Utc::now().to_rfc3339());

        self.conn.execute(
            r#"
            INSERT INTO process_status (
                job_id, user_id, process_type, entity_id, entity_type, status, step,
                status_message, error_detail, attempted, succeeded, failed, total,
                started_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'), ?)
            "#,
            params![
                entry.job_id,
                entry.user_id,
                entry.process_type,
                entry.entity_id,
                entry.entity_type,
                entry.status.to_string(),
                entry.step,
                entry.status_message,
                entry.error_detail,
                entry.attempted,
                entry.succeeded,
                entry.failed,
                entry.total,
                entry.started_at,
                completed_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Rows for one job in insertion order.
    pub fn process_status_for_job(&self, job_id: &str) -> Result<Vec<ProcessStatus>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT process_status_id, job_id, user_id, process_type, entity_id, entity_type,
                   status, step, status_message, error_detail, attempted, succeeded, failed,
                   total, started_at, updated_at, completed_at
            FROM process_status
            WHERE job_id = ?
            ORDER BY process_status_id ASC
            "#,
        )?;

        let rows = stmt
            .query_map([job_id], ProcessStatus::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_lab(
        &self,
        user_id: &str,
        lab_name: &str,
        lab_email: Option<&str>,
    ) -> Result<Lab, DbError> {
        self.conn.execute(
            "INSERT INTO user_labs (user_id, lab_name, lab_email) VALUES (?, ?, ?)",
            params![user_id, lab_name, lab_email],
        )?;

        Ok(Lab {
            lab_id: self.conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            lab_name: lab_name.to_string(),
            lab_email: lab_email.map(str::to_string),
        })
    }

    pub fn labs_for_user(&self, user_id: &str) -> Result<Vec<Lab>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT lab_id, user_id, lab_name, lab_email
            FROM user_labs
            WHERE user_id = ?
            ORDER BY lab_name ASC
            "#,
        )?;

        let labs = stmt
            .query_map([user_id], Lab::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labs)
    }

    pub fn remove_lab(&self, lab_id: i64) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM user_labs WHERE lab_id = ?", [lab_id])?;
        Ok(deleted)
    }

    pub fn queue_record_links(
        &mut self,
        user_id: &str,
        job_id: Option<&str>,
        record_ids: &[i64],
    ) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO record_link_queue (user_id, record_id, job_id) VALUES (?, ?, ?)",
            )?;
            for record_id in record_ids {
                stmt.execute(params![user_id, record_id, job_id])?;
            }
        }
        tx.commit()?;
        Ok(record_ids.len())
    }

    pub fn record_links_for_user(&self, user_id: &str) -> Result<Vec<RecordLink>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT link_id, user_id, record_id, job_id, created_at
            FROM record_link_queue
            WHERE user_id = ?
            ORDER BY link_id ASC
            "#,
        )?;

        let links = stmt
            .query_map([user_id], RecordLink::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let count = |sql: &str| -> Result<i64, DbError> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };

        let total_records = count("SELECT COUNT(*) FROM medical_records")?;
        let total_ownerships = count("SELECT COUNT(*) FROM user_records")?;
        let total_jobs = count("SELECT COUNT(DISTINCT job_id) FROM process_status")?;
        let total_labs = count("SELECT COUNT(*) FROM user_labs")?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT upload_source, COUNT(*) AS count
            FROM medical_records
            GROUP BY upload_source
            ORDER BY count DESC
            "#,
        )?;
        let records_by_source = stmt
            .query_map([], |row| {
                Ok(SourceRecordCount {
                    upload_source: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(DatabaseStats {
            total_records,
            total_ownerships,
            total_jobs,
            total_labs,
            records_by_source,
        })
    }
}
