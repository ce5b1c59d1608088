//! Integrity sweep over the store: every indexed blob is bounds-checked,
//! checksummed and decoded, and each month is checked for missing days.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use tracing::{info, warn};

use crate::codec::decode_day;
use crate::columns::DayColumns;
use crate::config::StudyConfig;
use crate::error::{PipelineResult, StoreError};
use crate::index::{IndexStore, Period};
use crate::pipeline::{cancel_token, resolve_symbols, scheduler_options};
use crate::scheduler::{self, DayOutcome, RunSummary, SchedulerOptions};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodTask {
    pub symbol: String,
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// A calendar day with no index row.
    Gap { day: u32 },
    /// Index row whose day does not exist in the month.
    BadDay { day: u8 },
    Unreadable { day: u8, detail: String },
    OutOfBounds { day: u8 },
    ChecksumMismatch { day: u8 },
    Corrupt { day: u8, detail: String },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::Gap { day } => write!(f, "day {day:02}: missing"),
            Issue::BadDay { day } => write!(f, "day {day:02}: not in calendar"),
            Issue::Unreadable { day, detail } => write!(f, "day {day:02}: unreadable ({detail})"),
            Issue::OutOfBounds { day } => write!(f, "day {day:02}: entry past end of data file"),
            Issue::ChecksumMismatch { day } => write!(f, "day {day:02}: checksum mismatch"),
            Issue::Corrupt { day, detail } => write!(f, "day {day:02}: corrupt ({detail})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodReport {
    pub symbol: String,
    pub period: Period,
    pub days: u32,
    pub trades: u64,
    pub bytes: u64,
    pub issues: Vec<Issue>,
}

impl PeriodReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub periods: Vec<PeriodReport>,
    /// Counts periods, not days.
    pub summary: RunSummary,
}

impl ValidationReport {
    pub fn issue_count(&self) -> usize {
        self.periods.iter().map(|p| p.issues.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0 && self.summary.corrupt == 0
    }
}

/// Days of `period` that should be present as of `today`. The current month
/// is only expected up to yesterday; future months expect nothing.
pub fn expected_days(period: Period, today: NaiveDate) -> std::ops::RangeInclusive<u32> {
    let current = Period::of(today);
    if period > current {
        1..=0
    } else if period == current {
        1..=today.day() - 1
    } else {
        1..=period.days()
    }
}

fn classify(day: u8, err: StoreError) -> Issue {
    match err {
        StoreError::Io { source, .. } => Issue::Unreadable {
            day,
            detail: source.to_string(),
        },
        StoreError::EntryOutOfBounds { .. } => Issue::OutOfBounds { day },
        StoreError::ChecksumMismatch { .. } => Issue::ChecksumMismatch { day },
        other => Issue::Corrupt {
            day,
            detail: other.to_string(),
        },
    }
}

/// Checks one month. `Err` only when the month has no readable index.
pub fn check_period(
    store: &IndexStore,
    task: &PeriodTask,
    today: NaiveDate,
    blob: &mut Vec<u8>,
    cols: &mut DayColumns,
) -> Result<PeriodReport, DayOutcome> {
    let dir = store.period_dir(&task.symbol, task.period);
    let mut entries = match store.read_index(&dir) {
        Ok(entries) => entries,
        Err(e) if e.is_absent() => return Err(DayOutcome::Missing),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "index rejected");
            return Err(DayOutcome::Corrupt);
        }
    };
    entries.sort_by_key(|e| e.day);

    let mut report = PeriodReport {
        symbol: task.symbol.clone(),
        period: task.period,
        days: 0,
        trades: 0,
        bytes: 0,
        issues: Vec::new(),
    };

    for entry in &entries {
        let Some(date) = task.period.date(entry.day) else {
            report.issues.push(Issue::BadDay { day: entry.day });
            continue;
        };
        match store.read_day(&task.symbol, date, blob) {
            Ok(Some(_)) => {}
            Ok(None) => continue,
            Err(e) => {
                report.issues.push(classify(entry.day, e));
                continue;
            }
        }
        match decode_day(blob, cols) {
            Ok(rows) => {
                report.days += 1;
                report.trades += rows as u64;
                report.bytes += entry.length;
            }
            Err(e) => report.issues.push(Issue::Corrupt {
                day: entry.day,
                detail: e.to_string(),
            }),
        }
    }

    for day in expected_days(task.period, today) {
        if !entries.iter().any(|e| e.day as u32 == day) {
            report.issues.push(Issue::Gap { day });
        }
    }
    report.issues.sort_by_key(|issue| match issue {
        Issue::Gap { day } => *day,
        Issue::BadDay { day }
        | Issue::Unreadable { day, .. }
        | Issue::OutOfBounds { day }
        | Issue::ChecksumMismatch { day }
        | Issue::Corrupt { day, .. } => *day as u32,
    });
    Ok(report)
}

fn sweep_options(config: &StudyConfig) -> SchedulerOptions {
    SchedulerOptions {
        unit: "periods",
        ..scheduler_options(config)
    }
}

/// Validates every period of `symbol` (or all symbols) as of `today`.
pub fn validate(config: &StudyConfig, symbol: Option<&str>, today: NaiveDate) -> PipelineResult<ValidationReport> {
    // Checksums are always verified here, whatever the study setting.
    let store = IndexStore::new(&config.data_root).with_limits(config.max_blob_bytes, true);
    let symbols = resolve_symbols(&store, symbol)?;
    let tasks: Vec<PeriodTask> = symbols
        .iter()
        .flat_map(|s| {
            store.periods(s).into_iter().map(|period| PeriodTask {
                symbol: s.clone(),
                period,
            })
        })
        .collect();
    info!(symbols = symbols.len(), periods = tasks.len(), %today, "validate");

    let (mut periods, summary) = scheduler::run(
        tasks,
        &sweep_options(config),
        &cancel_token(config),
        Vec::new(),
        || (Vec::new(), DayColumns::default()),
        |state: &mut (Vec<u8>, DayColumns), task| {
            let (blob, cols) = state;
            check_period(&store, task, today, blob, cols)
        },
        |periods: &mut Vec<PeriodReport>, _, report| {
            if !report.is_clean() {
                warn!(
                    symbol = %report.symbol,
                    year = report.period.year,
                    month = report.period.month,
                    issues = report.issues.len(),
                    "period has issues"
                );
            }
            periods.push(report);
        },
    );
    periods.sort_by(|a, b| (&a.symbol, a.period).cmp(&(&b.symbol, b.period)));
    info!(
        periods_ok = summary.ok,
        periods_missing = summary.missing,
        periods_corrupt = summary.corrupt,
        issues = periods.iter().map(|p| p.issues.len()).sum::<usize>(),
        "validate finished"
    );
    Ok(ValidationReport { periods, summary })
}
