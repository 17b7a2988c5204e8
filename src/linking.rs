use async_trait::async_trait;
use tracing::debug;

use crate::db::models::MedicalRecord;
use crate::db::{lock, DbError, SharedDatabase};

/// Downstream hand-off for records created by a sync job.
#[async_trait]
pub trait RecordLinker: Send + Sync {
    async fn link(
        &self,
        user_id: &str,
        job_id: &str,
        records: &[MedicalRecord],
    ) -> Result<(), DbError>;
}

/// Queues records in `record_link_queue` for an external consumer.
pub struct SqliteRecordLinker {
    db: SharedDatabase,
}

impl SqliteRecordLinker {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordLinker for SqliteRecordLinker {
    async fn link(
        &self,
        user_id: &str,
        job_id: &str,
        records: &[MedicalRecord],
    ) -> Result<(), DbError> {
        let record_ids: Vec<i64> = records.iter().map(|record| record.record_id).collect();
        let queued = lock(&self.db)?.queue_record_links(user_id, Some(job_id), &record_ids)?;
        debug!(user_id, job_id, queued, "records queued for linking");
        Ok(())
    }
}
