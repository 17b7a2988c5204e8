use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{JobStatus, Lab, MedicalRecord, ProcessStatus};
use crate::db::DatabaseStats;
use crate::output::SyncReport;

const STEP_WIDTH: usize = 19;
const STATUS_WIDTH: usize = 8;
const PROGRESS_WIDTH: usize = 14;
const MESSAGE_WIDTH: usize = 56;

const ID_WIDTH: usize = 6;
const NAME_WIDTH: usize = 32;
const SIZE_WIDTH: usize = 9;
const TYPE_WIDTH: usize = 22;
const SOURCE_WIDTH: usize = 8;
const DATE_WIDTH: usize = 12;

pub fn format_sync_report(report: &SyncReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Job: {}\n", report.job_id));
    out.push_str(&format!("Attachments: {}\n", report.total));
    out.push_str(&format!("Saved:       {}\n", report.succeeded));
    out.push_str(&format!("Failed:      {}\n", report.failed));
    if let Some(error) = &report.error {
        out.push_str(&format!("Aborted: {}\n", colorize_status(error, JobStatus::Failed)));
    }
    out
}

pub fn format_status_rows(rows: &[ProcessStatus]) -> String {
    if rows.is_empty() {
        return "No status rows for this job.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<step$}  {:<status$}  {:<progress$}  {}\n",
        "Step",
        "Status",
        "Progress",
        "Message",
        step = STEP_WIDTH,
        status = STATUS_WIDTH,
        progress = PROGRESS_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(STEP_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(PROGRESS_WIDTH),
        "-".repeat(MESSAGE_WIDTH)
    ));

    for row in rows {
        let status = format!("{:<width$}", row.status.to_string(), width = STATUS_WIDTH);
        let mut message = row.status_message.clone().unwrap_or_default();
        if let Some(detail) = &row.error_detail {
            message = format!("{message} ({detail})");
        }

        out.push_str(&format!(
            "{:<step$}  {}  {:<progress$}  {}\n",
            truncate_for_width(&row.step, STEP_WIDTH),
            colorize_status(&status, row.status),
            progress(row),
            truncate_for_width(&message, MESSAGE_WIDTH),
            step = STEP_WIDTH,
            progress = PROGRESS_WIDTH
        ));
    }

    out
}

pub fn format_records(records: &[MedicalRecord]) -> String {
    if records.is_empty() {
        return "No records found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:>id$}  {:<name$}  {:>size$}  {:<kind$}  {:<source$}  {:<date$}\n",
        "ID",
        "Name",
        "Size",
        "Type",
        "Source",
        "Created",
        id = ID_WIDTH,
        name = NAME_WIDTH,
        size = SIZE_WIDTH,
        kind = TYPE_WIDTH,
        source = SOURCE_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(NAME_WIDTH),
        "-".repeat(SIZE_WIDTH),
        "-".repeat(TYPE_WIDTH),
        "-".repeat(SOURCE_WIDTH),
        "-".repeat(DATE_WIDTH)
    ));

    for record in records {
        out.push_str(&format!(
            "{:>id$}  {:<name$}  {:>size$}  {:<kind$}  {:<source$}  {:<date$}\n",
            record.record_id,
            truncate_for_width(&record.record_name, NAME_WIDTH),
            human_size(record.record_size),
            truncate_for_width(&record.record_ext, TYPE_WIDTH),
            truncate_for_width(&record.upload_source, SOURCE_WIDTH),
            truncate_for_width(&relative_date(&record.created_at), DATE_WIDTH),
            id = ID_WIDTH,
            name = NAME_WIDTH,
            size = SIZE_WIDTH,
            kind = TYPE_WIDTH,
            source = SOURCE_WIDTH,
            date = DATE_WIDTH
        ));
    }

    out
}

pub fn format_labs(labs: &[Lab]) -> String {
    if labs.is_empty() {
        return "No labs on file.".to_string();
    }

    let mut out = String::new();
    out.push_str("    ID  Lab                         Email\n");
    out.push_str("------  --------------------------  ------------------------------\n");
    for lab in labs {
        out.push_str(&format!(
            "{:>6}  {:<26}  {}\n",
            lab.lab_id,
            truncate_for_width(&lab.lab_name, 26),
            lab.lab_email.as_deref().unwrap_or("-")
        ));
    }

    out
}

pub fn format_stats(stats: &DatabaseStats) -> String {
    let mut out = String::new();
    out.push_str("labsync Stats\n");
    out.push_str("=============\n");
    out.push_str(&format!("Records:    {}\n", stats.total_records));
    out.push_str(&format!("Ownerships: {}\n", stats.total_ownerships));
    out.push_str(&format!("Sync jobs:  {}\n", stats.total_jobs));
    out.push_str(&format!("Labs:       {}\n", stats.total_labs));

    if !stats.records_by_source.is_empty() {
        out.push('\n');
        out.push_str("Records by source\n");
        out.push_str("-----------------\n");
        for row in &stats.records_by_source {
            out.push_str(&format!("{:<24} {:>8}\n", row.upload_source, row.count));
        }
    }

    out
}

fn progress(row: &ProcessStatus) -> String {
    match (row.succeeded, row.total) {
        (Some(succeeded), Some(total)) => match row.failed {
            Some(failed) if failed > 0 => format!("{succeeded}/{total} ({failed} bad)"),
            _ => format!("{succeeded}/{total}"),
        },
        (None, Some(total)) => total.to_string(),
        _ => "-".to_string(),
    }
}

fn colorize_status(text: &str, status: JobStatus) -> String {
    match status {
        JobStatus::Failed => format!("\u{1b}[31m{text}\u{1b}[0m"),
        JobStatus::Success => format!("\u{1b}[32m{text}\u{1b}[0m"),
        _ => format!("\u{1b}[33m{text}\u{1b}[0m"),
    }
}

fn human_size(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{bytes} B")
    } else if value < KB * KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{:.1} MB", value / (KB * KB))
    }
}

fn relative_date(input: &str) -> String {
    let parsed = match DateTime::parse_from_rfc3339(input) {
        Ok(value) => value.with_timezone(&Utc),
        Err(_) => return input.to_string(),
    };

    let delta = Utc::now().signed_duration_since(parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
