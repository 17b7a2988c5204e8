//! Step-level progress ledger for sync jobs.
//!
//! Every write here is best-effort: a row that cannot be stored is logged and
//! dropped so that bookkeeping never aborts the ingestion it describes.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::models::{JobStatus, ProcessStatus};
use crate::db::{lock, DbError, NewProcessStatus, SharedDatabase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    TokenExchange,
    TokenRefresh,
    AccountLookup,
    TokenSave,
    LabLookup,
    Search,
    FindAttachments,
    DownloadAttachment,
    RecordLinking,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::TokenExchange => "token exchange",
            Self::TokenRefresh => "token refresh",
            Self::AccountLookup => "account lookup",
            Self::TokenSave => "token save",
            Self::LabLookup => "lab lookup",
            Self::Search => "search",
            Self::FindAttachments => "find attachments",
            Self::DownloadAttachment => "download attachment",
            Self::RecordLinking => "record linking",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub attempted: Option<i64>,
    pub succeeded: Option<i64>,
    pub failed: Option<i64>,
    pub total: Option<i64>,
}

impl Counters {
    pub fn none() -> Self {
        Self::default()
    }

    /// Running tallies; `attempted` is derived from the outcomes so far.
    pub fn progress(total: i64, succeeded: i64, failed: i64) -> Self {
        Self {
            attempted: Some(succeeded + failed),
            succeeded: Some(succeeded),
            failed: Some(failed),
            total: Some(total),
        }
    }
}

/// Identity shared by every row of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJob {
    pub job_id: String,
    pub user_id: String,
    pub process_type: String,
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub started_at: String,
}

#[derive(Clone)]
pub struct StatusTracker {
    db: SharedDatabase,
}

impl StatusTracker {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Allocates a fresh job id and appends the `queued` row for `first_step`.
    pub fn start_job(
        &self,
        user_id: &str,
        process_type: &str,
        entity_id: Option<&str>,
        entity_type: Option<&str>,
        first_step: Step,
    ) -> TrackedJob {
        let job = TrackedJob {
            job_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            process_type: process_type.to_string(),
            entity_id: entity_id.map(str::to_string),
            entity_type: entity_type.map(str::to_string),
            started_at: Utc::now().to_rfc3339(),
        };
        self.append(
            &job,
            first_step,
            JobStatus::Queued,
            Some("job queued".to_string()),
            None,
            Counters::none(),
        );
        job
    }

    pub fn log_step(
        &self,
        job: &TrackedJob,
        step: Step,
        status: JobStatus,
        message: impl Into<String>,
        counters: Counters,
    ) {
        self.append(job, step, status, Some(message.into()), None, counters);
    }

    /// Appends a `failed` row carrying a user-facing reason and the technical detail.
    pub fn log_step_and_fail(
        &self,
        job: &TrackedJob,
        step: Step,
        reason: impl Into<String>,
        detail: impl Into<String>,
        counters: Counters,
    ) {
        self.append(
            job,
            step,
            JobStatus::Failed,
            Some(reason.into()),
            Some(detail.into()),
            counters,
        );
    }

    pub fn job_rows(&self, job_id: &str) -> Result<Vec<ProcessStatus>, DbError> {
        lock(&self.db)?.process_status_for_job(job_id)
    }

    /// Newest row of each step, ordered by when the step first appeared.
    pub fn latest_per_step(&self, job_id: &str) -> Result<Vec<ProcessStatus>, DbError> {
        let rows = self.job_rows(job_id)?;
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, ProcessStatus> = HashMap::new();

        for row in rows {
            if !latest.contains_key(&row.step) {
                order.push(row.step.clone());
            }
            latest.insert(row.step.clone(), row);
        }

        Ok(order
            .into_iter()
            .filter_map(|step| latest.remove(&step))
            .collect())
    }

    fn append(
        &self,
        job: &TrackedJob,
        step: Step,
        status: JobStatus,
        status_message: Option<String>,
        error_detail: Option<String>,
        counters: Counters,
    ) {
        let entry = NewProcessStatus {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            process_type: job.process_type.clone(),
            entity_id: job.entity_id.clone(),
            entity_type: job.entity_type.clone(),
            status,
            step: step.to_string(),
            status_message,
            error_detail,
            attempted: counters.attempted,
            succeeded: counters.succeeded,
            failed: counters.failed,
            total: counters.total,
            started_at: job.started_at.clone(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            lock(&self.db).and_then(|db| db.append_process_status(&entry))
        }));
        match outcome {
            Ok(Ok(_)) => debug!(job_id = %job.job_id, %step, %status, "status row appended"),
            Ok(Err(error)) => {
                warn!(job_id = %job.job_id, %step, %status, %error, "failed to record job status")
            }
            Err(_) => warn!(job_id = %job.job_id, %step, %status, "panic while recording job status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Counters, StatusTracker, Step};
    use crate::db::models::JobStatus;
    use crate::db::{lock, shared, Database};

    fn tracker() -> StatusTracker {
        StatusTracker::new(shared(Database::open_in_memory().expect("db")))
    }

    #[test]
    fn rows_come_back_in_insertion_order() {
        let tracker = tracker();
        let job = tracker.start_job(
            "42",
            "mailbox_sync",
            Some("gmail"),
            Some("mailbox"),
            Step::TokenExchange,
        );
        tracker.log_step(&job, Step::Search, JobStatus::Success, "2 messages", Counters::none());
        tracker.log_step_and_fail(
            &job,
            Step::DownloadAttachment,
            "Could not download report.pdf",
            "status=500",
            Counters::progress(2, 1, 1),
        );

        let rows = tracker.job_rows(&job.job_id).expect("rows");
        let steps: Vec<&str> = rows.iter().map(|row| row.step.as_str()).collect();
        assert_eq!(steps, ["token exchange", "search", "download attachment"]);
        assert_eq!(rows[0].status, JobStatus::Queued);
        assert!(rows[0].completed_at.is_none());

        let failed = &rows[2];
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.status_message.as_deref(),
            Some("Could not download report.pdf")
        );
        assert_eq!(failed.error_detail.as_deref(), Some("status=500"));
        assert_eq!(
            (failed.total, failed.succeeded, failed.failed, failed.attempted),
            (Some(2), Some(1), Some(1), Some(2))
        );
        assert!(failed.completed_at.is_some());
        assert!(rows.iter().all(|row| row.started_at == job.started_at));
    }

    #[test]
    fn latest_per_step_keeps_newest_row() {
        let tracker = tracker();
        let job = tracker.start_job("42", "mailbox_sync", None, None, Step::TokenExchange);
        let download = Step::DownloadAttachment;
        tracker.log_step(&job, download, JobStatus::Running, "1 of 2", Counters::progress(1, 1, 0));
        tracker.log_step(&job, Step::TokenExchange, JobStatus::Success, "token acquired", Counters::none());
        tracker.log_step(&job, download, JobStatus::Success, "done", Counters::progress(2, 2, 0));

        let latest = tracker.latest_per_step(&job.job_id).expect("latest");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].step, "token exchange");
        assert_eq!(latest[0].status, JobStatus::Success);
        assert_eq!(latest[1].status_message.as_deref(), Some("done"));
    }

    #[test]
    fn storage_failures_are_swallowed() {
        let tracker = tracker();
        lock(&tracker.db)
            .expect("lock")
            .conn()
            .execute("DROP TABLE process_status", [])
            .expect("drop table");

        let job = tracker.start_job("42", "mailbox_sync", None, None, Step::TokenExchange);
        tracker.log_step_and_fail(&job, Step::Search, "search failed", "boom", Counters::none());
        assert!(!job.job_id.is_empty());
        assert!(tracker.job_rows(&job.job_id).is_err());
    }
}
