pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::db::models::{Lab, MedicalRecord, ProcessStatus};
use crate::db::DatabaseStats;
use crate::sync::JobOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// Printable summary of a finished sync job.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub job_id: String,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub record_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobOutcome> for SyncReport {
    fn from(outcome: &JobOutcome) -> Self {
        Self {
            job_id: outcome.job_id.clone(),
            total: outcome.total,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            record_ids: outcome.records.iter().map(|record| record.record_id).collect(),
            error: outcome.fatal.as_ref().map(ToString::to_string),
        }
    }
}

pub fn format_sync_report(format: OutputFormat, report: &SyncReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sync_report(report)),
        OutputFormat::Json => json::format_sync_report(report),
    }
}

pub fn format_status_rows(format: OutputFormat, rows: &[ProcessStatus]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status_rows(rows)),
        OutputFormat::Json => json::format_status_rows(rows),
    }
}

pub fn format_records(format: OutputFormat, records: &[MedicalRecord]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_records(records)),
        OutputFormat::Json => json::format_records(records),
    }
}

pub fn format_labs(format: OutputFormat, labs: &[Lab]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_labs(labs)),
        OutputFormat::Json => json::format_labs(labs),
    }
}

pub fn format_stats(format: OutputFormat, stats: &DatabaseStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::format_stats(stats),
    }
}
