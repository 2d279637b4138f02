//! Per-run report files and the markdown digest over recent runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deltasync_core::SyncSummary;
use tokio::fs;

pub const SUMMARY_FILE: &str = "summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

/// Write `<reports_root>/<run_id>/{summary.json, run_brief.md}`.
pub async fn write_reports(reports_root: &Path, summary: &SyncSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    fs::write(run_dir.join(BRIEF_FILE), run_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;
    Ok(run_dir)
}

pub fn run_brief(summary: &SyncSummary) -> String {
    let errors = &summary.errors;
    let mut lines = vec![
        "# Sync Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Status: {}", summary.status.as_str()),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.completed_at),
        format!("- Elapsed: {} ms", summary.elapsed_ms),
        format!("- Dry run: {}", summary.options.dry_run),
        String::new(),
        "## Counts".to_string(),
        format!("- available: {}", summary.total_available),
        format!("- fetched: {}", summary.total_fetched),
        format!(
            "- to process: {} (new {}, modified {}, unchanged {})",
            summary.to_process, summary.new_records, summary.modified_records, summary.unchanged_records
        ),
        format!("- written: {}", summary.total_written),
        format!("- fingerprints: {}", summary.fingerprints_persisted),
        format!("- final wave width: {}", summary.final_wave_width),
        String::new(),
        "## Errors".to_string(),
        format!("- list pages failed: {}", errors.list_pages_failed),
        format!("- list pages skipped at deadline: {}", errors.list_pages_skipped),
        format!("- invalid records: {}", errors.invalid_records),
        format!("- attribute requests failed: {}", errors.attribute_requests_failed),
        format!("- attribute pages truncated: {}", errors.attribute_pages_truncated),
        format!("- attribute rows rejected: {}", errors.attributes_rejected),
        format!("- projection dropped: {}", errors.projection_dropped),
        format!("- batches failed: {}", errors.batches_failed),
        format!("- transient write errors: {}", errors.transient_write_errors),
        format!("- fingerprint batches failed: {}", errors.fingerprint_batches_failed),
        format!("- ledger writes failed: {}", errors.ledger_writes_failed),
    ];
    if summary.tracker_failed_open {
        lines.push("- change tracker failed open".to_string());
    }
    if summary.deadline_exceeded {
        lines.push("- run deadline exceeded".to_string());
    }
    if let Some(message) = &summary.error_message {
        lines.push(format!("- error: {message}"));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the `runs` most recent report directories, newest first.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();

    let mut summaries = Vec::new();
    for dir in dirs {
        let path = dir.path().join(SUMMARY_FILE);
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: SyncSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push((summary, dir.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Sync Report".to_string(), String::new()];
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- status: {}", summary.status.as_str()));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- fetched {} / to process {} / written {}",
            summary.total_fetched, summary.to_process, summary.total_written
        ));
        lines.push(format!("- failed batches: {}", summary.errors.batches_failed));
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use deltasync_core::{RunStatus, SyncOptions};
    use uuid::Uuid;

    fn summary(hour: u32, written: usize) -> SyncSummary {
        let started = Utc.with_ymd_and_hms(2026, 3, 5, hour, 0, 0).single().unwrap();
        let mut summary = SyncSummary::new(Uuid::new_v4(), SyncOptions::default(), started);
        summary.status = RunStatus::Completed;
        summary.completed_at = started + Duration::seconds(4);
        summary.total_written = written;
        summary
    }

    #[tokio::test]
    async fn writes_summary_and_brief() {
        let dir = tempfile::tempdir().unwrap();
        let s = summary(1, 12);
        let run_dir = write_reports(dir.path(), &s).await.unwrap();

        let stored: SyncSummary =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(stored, s);
        let brief = std::fs::read_to_string(run_dir.join(BRIEF_FILE)).unwrap();
        assert!(brief.contains("- written: 12"));
        assert!(brief.contains("- Status: completed"));
        assert!(brief.contains("- list pages skipped at deadline: 0"));
        assert!(brief.contains("- ledger writes failed: 0"));
    }

    #[tokio::test]
    async fn digest_lists_newest_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = summary(1, 5);
        let newer = summary(9, 7);
        write_reports(dir.path(), &older).await.unwrap();
        write_reports(dir.path(), &newer).await.unwrap();

        let markdown = report_markdown(1, dir.path()).unwrap();
        assert!(markdown.contains(&newer.run_id.to_string()));
        assert!(!markdown.contains(&older.run_id.to_string()));
    }
}
