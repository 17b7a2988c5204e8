use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS mailbox_tokens (
            token_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL CHECK(provider IN ('gmail', 'outlook', 'yahoo')),
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            provider_id TEXT,
            expires_at TEXT,
            encrypted BOOLEAN NOT NULL DEFAULT false,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS medical_records (
            record_id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_name TEXT NOT NULL,
            record_size INTEGER NOT NULL,
            record_ext TEXT NOT NULL,
            upload_source TEXT NOT NULL,
            description TEXT,
            source_metadata TEXT,
            file_data BLOB,
            file_path TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            CHECK (file_data IS NOT NULL OR file_path IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS user_records (
            user_id TEXT NOT NULL,
            record_id INTEGER NOT NULL REFERENCES medical_records(record_id) ON DELETE CASCADE,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            PRIMARY KEY (user_id, record_id)
        );

        CREATE TABLE IF NOT EXISTS process_status (
            process_status_id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            process_type TEXT NOT NULL,
            entity_id TEXT,
            entity_type TEXT,
            status TEXT NOT NULL CHECK(status IN ('queued', 'running', 'retrying', 'success', 'failed')),
            step TEXT NOT NULL,
            status_message TEXT,
            error_detail TEXT,
            attempted INTEGER,
            succeeded INTEGER,
            failed INTEGER,
            total INTEGER,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS user_labs (
            lab_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            lab_name TEXT NOT NULL,
            lab_email TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS record_link_queue (
            link_id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            record_id INTEGER NOT NULL REFERENCES medical_records(record_id) ON DELETE CASCADE,
            job_id TEXT,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_mailbox_tokens_user_provider ON mailbox_tokens(user_id, provider);
        CREATE INDEX IF NOT EXISTS idx_user_records_user_id ON user_records(user_id);
        CREATE INDEX IF NOT EXISTS idx_process_status_job_id ON process_status(job_id);
        CREATE INDEX IF NOT EXISTS idx_user_labs_user_id ON user_labs(user_id);
        "#,
    )?;

    Ok(())
}
