use anyhow::Result;

use crate::db::models::{Lab, MedicalRecord, ProcessStatus};
use crate::db::DatabaseStats;
use crate::output::SyncReport;

pub fn format_sync_report(report: &SyncReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn format_status_rows(rows: &[ProcessStatus]) -> Result<String> {
    Ok(serde_json::to_string_pretty(rows)?)
}

pub fn format_records(records: &[MedicalRecord]) -> Result<String> {
    Ok(serde_json::to_string_pretty(records)?)
}

pub fn format_labs(labs: &[Lab]) -> Result<String> {
    Ok(serde_json::to_string_pretty(labs)?)
}

pub fn format_stats(stats: &DatabaseStats) -> Result<String> {
    Ok(serde_json::to_string_pretty(stats)?)
}
