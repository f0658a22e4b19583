//! Run-history line format and the metrics deriver that reads it back.
//!
//! The phrases below are the compatibility contract with dashboards and older
//! log readers. Changing them breaks metrics derivation for existing logs.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use petetl_core::{MetricsSnapshot, MetricsStatus, RunStatus, RunSummary};
use regex::Regex;

pub const PHRASE_SUCCESS: &str = "ETL process completed successfully";
pub const PHRASE_PARTIAL: &str = "ETL process completed with partial failures";
pub const PHRASE_FAILED: &str = "ETL process failed";
pub const PHRASE_LOADED: &str = "Successfully inserted/updated";

pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

static LOADED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Successfully inserted/updated (\d+) records?\b").expect("valid loaded-count regex")
});

const TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S,%3f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render the single history line for a finished run.
pub fn summary_line(summary: &RunSummary) -> String {
    let ts = summary.finished_at.format(LOG_TIMESTAMP_FORMAT);
    let counts = &summary.counts;
    let detail = format!(
        "(run_id={} source={} extracted={} transformed={} rejected={} inserted={} updated={} failed={})",
        summary.run_id,
        one_line(&summary.source),
        counts.extracted,
        counts.transformed,
        counts.rejected,
        counts.inserted,
        counts.updated,
        counts.failed,
    );

    match summary.status {
        RunStatus::Success => format!(
            "{ts} - INFO - {PHRASE_SUCCESS}; {PHRASE_LOADED} {} records {detail}",
            counts.loaded()
        ),
        RunStatus::PartialFailure => format!(
            "{ts} - WARNING - {PHRASE_PARTIAL}; {PHRASE_LOADED} {} records {detail}",
            counts.loaded()
        ),
        RunStatus::Failed => {
            let reason = summary
                .failure_reason
                .as_deref()
                .map(one_line)
                .unwrap_or_else(|| "unknown error".to_string());
            format!("{ts} - ERROR - {PHRASE_FAILED}: {reason} {detail}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LineFacts<'a> {
    timestamp: Option<&'a str>,
    status: Option<MetricsStatus>,
    loaded: Option<u64>,
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Recognize one history line. Anything without a known phrase is `None`.
fn parse_line(line: &str) -> Option<LineFacts<'_>> {
    let (timestamp, message) = match line.split_once(" - ") {
        Some((head, rest)) if parse_timestamp(head.trim()).is_some() => (Some(head.trim()), rest),
        _ => (None, line),
    };

    // Partial phrase is checked first: it shares the "ETL process completed" prefix.
    let status = if message.contains(PHRASE_PARTIAL) {
        Some(MetricsStatus::PartialFailure)
    } else if message.contains(PHRASE_SUCCESS) {
        Some(MetricsStatus::Success)
    } else if message.contains(PHRASE_FAILED) {
        Some(MetricsStatus::Failed)
    } else {
        None
    };
    let loaded = LOADED_RE
        .captures(message)
        .and_then(|caps| caps[1].parse::<u64>().ok());

    if status.is_none() && loaded.is_none() {
        return None;
    }
    Some(LineFacts {
        timestamp,
        status,
        loaded,
    })
}

/// Backward scan over the log tail (oldest first). The newest status line is
/// the last run; its record count comes from the nearest count phrase that
/// is not separated from it by another run's status line.
pub fn derive_metrics<S: AsRef<str>>(lines: &[S]) -> MetricsSnapshot {
    let mut snapshot = MetricsSnapshot::default();
    let mut loaded: Option<u64> = None;
    let mut found_run = false;

    for facts in lines.iter().rev().filter_map(|l| parse_line(l.as_ref())) {
        if found_run && facts.status.is_some() {
            break;
        }
        if loaded.is_none() {
            loaded = facts.loaded;
        }
        if let Some(status) = facts.status {
            snapshot.status = status;
            snapshot.last_run_at = facts.timestamp.map(ToString::to_string);
            found_run = true;
            if loaded.is_some() {
                break;
            }
        }
    }
    snapshot.total_records = loaded.unwrap_or(0);

    snapshot.last_successful_run = lines
        .iter()
        .rev()
        .filter_map(|l| parse_line(l.as_ref()))
        .find(|f| {
            matches!(
                f.status,
                Some(MetricsStatus::Success | MetricsStatus::PartialFailure)
            )
        })
        .and_then(|f| f.timestamp.map(ToString::to_string));

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use petetl_core::RunCounts;
    use uuid::Uuid;

    fn summary(status: RunStatus, counts: RunCounts, reason: Option<&str>) -> RunSummary {
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 9, 30, 0).single().unwrap();
        RunSummary {
            run_id: Uuid::new_v4(),
            source: "pets.csv".into(),
            started_at: at,
            finished_at: at,
            status,
            counts,
            failure_reason: reason.map(ToString::to_string),
        }
    }

    #[test]
    fn status_line_followed_by_count_line_reports_success() {
        let lines = [
            "2026-04-01 09:30:00,120 - INFO - ETL process completed successfully",
            "2026-04-01 09:30:00,121 - INFO - Successfully inserted/updated 42 records",
        ];
        let m = derive_metrics(&lines);
        assert_eq!(m.status, MetricsStatus::Success);
        assert_eq!(m.total_records, 42);
        assert_eq!(m.last_run_at.as_deref(), Some("2026-04-01 09:30:00,120"));
        assert_eq!(m.last_successful_run.as_deref(), Some("2026-04-01 09:30:00,120"));
    }

    #[test]
    fn unrecognized_log_reports_unknown_and_zero() {
        let lines = [
            "2026-04-01 09:00:00,000 - INFO - Background ETL runner started",
            "garbage without structure",
            "",
        ];
        let m = derive_metrics(&lines);
        assert_eq!(m, MetricsSnapshot::default());
        assert_eq!(m.status, MetricsStatus::Unknown);
        assert_eq!(m.total_records, 0);

        let empty: [&str; 0] = [];
        assert_eq!(derive_metrics(&empty), MetricsSnapshot::default());
    }

    #[test]
    fn newest_status_line_wins_over_older_history() {
        let ok = summary(
            RunStatus::Success,
            RunCounts {
                extracted: 5,
                transformed: 5,
                inserted: 5,
                ..Default::default()
            },
            None,
        );
        let failed = summary(
            RunStatus::Failed,
            RunCounts::default(),
            Some("source not found: pets.csv"),
        );
        let lines = vec![summary_line(&ok), summary_line(&failed)];

        let m = derive_metrics(&lines);
        assert_eq!(m.status, MetricsStatus::Failed);
        // The failed run loaded nothing; the older run's count must not leak in.
        assert_eq!(m.total_records, 0);
        assert_eq!(m.last_successful_run.as_deref(), Some("2026-04-01 09:30:00,000"));
    }

    #[test]
    fn summary_lines_round_trip_through_the_deriver() {
        let partial = summary(
            RunStatus::PartialFailure,
            RunCounts {
                extracted: 4,
                transformed: 4,
                inserted: 2,
                updated: 1,
                failed: 1,
                ..Default::default()
            },
            None,
        );
        let line = summary_line(&partial);
        assert!(line.starts_with("2026-04-01 09:30:00,000 - WARNING - "));
        assert!(line.contains("Successfully inserted/updated 3 records"));

        let m = derive_metrics(&[line]);
        assert_eq!(m.status, MetricsStatus::from(partial.status));
        assert_eq!(m.total_records, 3);
    }

    #[test]
    fn failure_reasons_stay_on_one_line() {
        let failed = summary(
            RunStatus::Failed,
            RunCounts::default(),
            Some("csv parse error at line 3:\nfound record with 3 fields"),
        );
        let line = summary_line(&failed);
        assert!(!line.contains('\n'));
        assert!(line.contains("ETL process failed: csv parse error at line 3: found record"));
    }

    #[test]
    fn partially_written_lines_are_ignored() {
        let lines = [
            "2026-04-01 09:30:00,000 - INFO - ETL process completed successfully; Successfully inserted/updated 7 records (run_id=x)",
            "2026-04-01 10:30:00,000 - INFO - ETL process compl",
            "2026-04-01 10:30:00,000 - INFO - Successfully inserted/updated 1",
        ];
        let m = derive_metrics(&lines);
        assert_eq!(m.status, MetricsStatus::Success);
        assert_eq!(m.total_records, 7);
        assert_eq!(m.last_run_at.as_deref(), Some("2026-04-01 09:30:00,000"));
    }

    #[test]
    fn phrase_without_timestamp_still_counts() {
        let m = derive_metrics(&["ETL process failed with return code: 1"]);
        assert_eq!(m.status, MetricsStatus::Failed);
        assert_eq!(m.last_run_at, None);
    }
}
