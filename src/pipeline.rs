//! Day-parallel study runs: signal evaluation against forward returns, and
//! feature-file generation, both driven by [`scheduler::run`].

use std::path::PathBuf;
use std::time::Duration;

use bincode::{Decode, Encode};
use chrono::{Datelike, NaiveDate};
use tracing::{debug, info, warn};

use crate::buckets::{BucketSet, compute_buckets};
use crate::codec::{DEFAULT_CHUNK_ROWS, decode_day};
use crate::columns::{ColumnPool, DayColumns};
use crate::config::StudyConfig;
use crate::diagnostics::{DiagnosticsAgg, evaluate_day};
use crate::error::{PipelineError, PipelineResult, StoreError};
use crate::features::{FEATURE_DIR, FeatureFile, feature_path, read_feature_file, write_feature_file};
use crate::index::{DayTask, IndexStore};
use crate::metrics::{MetricStats, daily_ic, finalize};
use crate::moments::Moments;
use crate::returns::forward_returns;
use crate::scheduler::{self, CancelToken, DayOutcome, RunSummary, SchedulerOptions};
use crate::signals::{Signal, run_signals};

/// Label used for runs spanning every symbol in the store.
pub const ALL_SYMBOLS: &str = "ALL";

/// One day's IC, kept with its date so lists can be ordered after an
/// out-of-order merge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyIc {
    pub date: NaiveDate,
    pub ic: f64,
}

impl bincode::Encode for DailyIc {
    fn encode<E: bincode::enc::Encoder>(&self, encoder: &mut E) -> Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.date.num_days_from_ce(), encoder)?;
        bincode::Encode::encode(&self.ic, encoder)
    }
}

impl<Context> bincode::Decode<Context> for DailyIc {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> core::result::Result<Self, bincode::error::DecodeError> {
        let days: i32 = bincode::Decode::decode(decoder)?;
        let date = NaiveDate::from_num_days_from_ce_opt(days)
            .ok_or(bincode::error::DecodeError::Other("day number out of range"))?;
        Ok(Self {
            date,
            ic: bincode::Decode::decode(decoder)?,
        })
    }
}

bincode::impl_borrow_decode!(DailyIc);

/// Everything accumulated for one (signal, horizon, sample).
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct HorizonAgg {
    pub moments: Moments,
    pub daily_ics: Vec<DailyIc>,
    pub buckets: BucketSet,
    pub diagnostics: DiagnosticsAgg,
}

impl HorizonAgg {
    fn absorb(&mut self, date: NaiveDate, day: &HorizonDay) {
        self.moments.merge(&day.moments);
        self.daily_ics.push(DailyIc { date, ic: day.ic });
        if let Some(buckets) = &day.buckets {
            self.buckets.merge(buckets);
        }
        self.diagnostics.merge(&day.diagnostics);
    }

    fn sort_daily(&mut self) {
        self.daily_ics.sort_by_key(|d| d.date);
    }

    pub fn stats(&self) -> MetricStats {
        let ics: Vec<f64> = self.daily_ics.iter().map(|d| d.ic).collect();
        finalize(&self.moments, &ics)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct HorizonSplit {
    pub horizon_ms: i64,
    pub in_sample: HorizonAgg,
    pub out_of_sample: HorizonAgg,
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct SignalAgg {
    pub name: String,
    pub horizons: Vec<HorizonSplit>,
}

/// The merged result of one study run; what snapshots persist.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct StudyResult {
    pub label: String,
    pub source: String,
    pub oos_cutoff: String,
    pub signals: Vec<SignalAgg>,
    pub summary: RunSummary,
}

impl StudyResult {
    fn empty(label: &str, source: &str, config: &StudyConfig) -> Self {
        let signals = config
            .signals
            .iter()
            .map(|spec| SignalAgg {
                name: spec.name().to_string(),
                horizons: config
                    .horizons_ms
                    .iter()
                    .map(|&horizon_ms| HorizonSplit {
                        horizon_ms,
                        ..HorizonSplit::default()
                    })
                    .collect(),
            })
            .collect();
        Self {
            label: label.to_string(),
            source: source.to_string(),
            oos_cutoff: config.oos_cutoff.to_string(),
            signals,
            summary: RunSummary::default(),
        }
    }

    fn absorb(&mut self, day: DayResult, oos: bool) {
        for (agg, per_horizon) in self.signals.iter_mut().zip(&day.signals) {
            for (split, h) in agg.horizons.iter_mut().zip(per_horizon) {
                let target = if oos {
                    &mut split.out_of_sample
                } else {
                    &mut split.in_sample
                };
                target.absorb(day.date, h);
            }
        }
    }

    fn sort_daily(&mut self) {
        for split in self.signals.iter_mut().flat_map(|s| s.horizons.iter_mut()) {
            split.in_sample.sort_daily();
            split.out_of_sample.sort_daily();
        }
    }
}

/// Where signal values come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalSource {
    /// Evaluate the configured formulas over decoded trades.
    Live,
    /// Read a previously written feature-file variant.
    Features(String),
}

impl SignalSource {
    fn label(&self) -> String {
        match self {
            SignalSource::Live => "live".to_string(),
            SignalSource::Features(v) => format!("features:{v}"),
        }
    }
}

struct HorizonDay {
    moments: Moments,
    ic: f64,
    buckets: Option<BucketSet>,
    diagnostics: DiagnosticsAgg,
}

struct DayResult {
    date: NaiveDate,
    /// `[signal][horizon]`.
    signals: Vec<Vec<HorizonDay>>,
}

/// Per-worker buffers, reused across days.
struct Scratch {
    blob: Vec<u8>,
    signals: Vec<Box<dyn Signal>>,
    series: Vec<Vec<f64>>,
    returns: Vec<f64>,
    pairs: Vec<(f64, f64)>,
}

impl Scratch {
    fn new(config: &StudyConfig) -> Self {
        Self {
            blob: Vec::new(),
            signals: config.signals.iter().map(|s| s.build()).collect(),
            series: vec![Vec::new(); config.signals.len()],
            returns: Vec::new(),
            pairs: Vec::new(),
        }
    }
}

/// Opens the store described by `config`.
pub fn open_store(config: &StudyConfig) -> IndexStore {
    IndexStore::new(&config.data_root).with_limits(config.max_blob_bytes, config.verify_checksums)
}

pub fn scheduler_options(config: &StudyConfig) -> SchedulerOptions {
    SchedulerOptions {
        workers: config.workers.unwrap_or_else(scheduler::default_workers),
        queue_capacity: config.queue_capacity,
        result_capacity: config.result_capacity,
        progress_interval: Duration::from_millis(config.progress_interval_ms.max(1)),
        unit: "days",
    }
}

pub fn cancel_token(config: &StudyConfig) -> CancelToken {
    match config.deadline_secs {
        Some(secs) => CancelToken::with_deadline(Duration::from_secs(secs)),
        None => CancelToken::new(),
    }
}

/// `symbol` if given, else every symbol directory under the data root.
pub fn resolve_symbols(store: &IndexStore, symbol: Option<&str>) -> PipelineResult<Vec<String>> {
    if let Some(s) = symbol {
        return Ok(vec![s.to_string()]);
    }
    store.symbols().map_err(|e| match e {
        StoreError::Io { path, source } => PipelineError::DataRoot { path, source },
        other => PipelineError::DataRoot {
            path: store.root().to_path_buf(),
            source: std::io::Error::other(other.to_string()),
        },
    })
}

/// Reads and decodes one day into `cols`, classifying any failure.
fn load_day(
    store: &IndexStore,
    task: &DayTask,
    blob: &mut Vec<u8>,
    cols: &mut DayColumns,
) -> Result<(), DayOutcome> {
    match store.read_day(&task.symbol, task.date, blob) {
        Ok(Some(_)) => {}
        Ok(None) => return Err(DayOutcome::Missing),
        Err(e) if e.is_absent() => {
            warn!(symbol = %task.symbol, date = %task.date, error = %e, "day missing");
            return Err(DayOutcome::Missing);
        }
        Err(e) => {
            warn!(symbol = %task.symbol, date = %task.date, error = %e, "day rejected");
            return Err(DayOutcome::Corrupt);
        }
    }
    decode_day(blob, cols).map_err(|e| {
        warn!(symbol = %task.symbol, date = %task.date, error = %e, "blob failed to decode");
        DayOutcome::Corrupt
    })?;
    if cols.len() < 2 {
        return Err(DayOutcome::Empty);
    }
    Ok(())
}

/// Fills `scratch.series` from the feature file for `task`, in declared
/// signal order. A declared name absent from the file leaves its series empty.
fn load_features(
    config: &StudyConfig,
    variant: &str,
    task: &DayTask,
    rows: usize,
    scratch: &mut Scratch,
) -> Result<(), DayOutcome> {
    let path = feature_path(&config.data_root, &task.symbol, variant, task.date);
    let file = read_feature_file(&path).map_err(|e| match e {
        crate::error::FeatureFileError::Io { .. } => {
            debug!(path = %path.display(), "feature file missing");
            DayOutcome::Missing
        }
        other => {
            warn!(path = %path.display(), error = %other, "feature file rejected");
            DayOutcome::Corrupt
        }
    })?;
    if file.rows() != rows {
        warn!(
            path = %path.display(),
            feature_rows = file.rows(),
            trade_rows = rows,
            "feature rows do not match trades"
        );
        return Err(DayOutcome::Corrupt);
    }
    for (spec, series) in config.signals.iter().zip(scratch.series.iter_mut()) {
        if !file.column_by_name(spec.name(), series) {
            debug!(signal = spec.name(), path = %path.display(), "feature not in file");
        }
    }
    Ok(())
}

fn measure_day(config: &StudyConfig, cols: &DayColumns, scratch: &mut Scratch, date: NaiveDate) -> DayResult {
    let mut signals: Vec<Vec<HorizonDay>> = (0..scratch.series.len())
        .map(|_| Vec::with_capacity(config.horizons_ms.len()))
        .collect();

    for &horizon in &config.horizons_ms {
        let valid = forward_returns(cols.prices(), cols.times(), horizon, &mut scratch.returns);
        for (series, out) in scratch.series.iter().zip(signals.iter_mut()) {
            let n = valid.min(series.len());
            let sig = &series[..n];
            let ret = &scratch.returns[..n];
            let moments = Moments::from_series(sig, ret);
            let buckets = compute_buckets(sig, ret, config.num_buckets, config.quantile_stride, &mut scratch.pairs);
            let diagnostics = if config.diagnostics.enabled {
                evaluate_day(sig, ret, &config.diagnostics)
            } else {
                DiagnosticsAgg::default()
            };
            out.push(HorizonDay {
                ic: daily_ic(&moments),
                moments,
                buckets,
                diagnostics,
            });
        }
    }
    DayResult { date, signals }
}

/// Runs the study over every indexed day of `symbol` (or all symbols).
pub fn analyze(config: &StudyConfig, symbol: Option<&str>, source: &SignalSource) -> PipelineResult<StudyResult> {
    let store = open_store(config);
    let symbols = resolve_symbols(&store, symbol)?;
    let tasks = store.all_tasks(&symbols);
    let label = symbol.unwrap_or(ALL_SYMBOLS);
    info!(
        label,
        source = %source.label(),
        days = tasks.len(),
        signals = config.signals.len(),
        horizons = config.horizons_ms.len(),
        "analyze"
    );

    let options = scheduler_options(config);
    let pool = ColumnPool::new(DEFAULT_CHUNK_ROWS, options.workers * 2);
    let limits = config.stream_limits();

    let (mut result, summary) = scheduler::run(
        tasks,
        &options,
        &cancel_token(config),
        StudyResult::empty(label, &source.label(), config),
        || Scratch::new(config),
        |scratch, task| {
            let mut cols = pool.checkout();
            load_day(&store, task, &mut scratch.blob, &mut cols)?;
            match source {
                SignalSource::Live => run_signals(&cols, &mut scratch.signals, limits, &mut scratch.series),
                SignalSource::Features(variant) => load_features(config, variant, task, cols.len(), scratch)?,
            }
            debug!(symbol = %task.symbol, date = %task.date, rows = cols.len(), "day measured");
            Ok(measure_day(config, &cols, scratch, task.date))
        },
        |result, _, day| {
            let oos = config.is_oos(day.date);
            result.absorb(day, oos);
        },
    );
    result.sort_daily();
    result.summary = summary;
    Ok(result)
}

/// Totals from a `compute_signals` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureRun {
    pub files: u64,
    pub rows: u64,
    pub summary: RunSummary,
}

/// Evaluates the configured signals over every indexed day and writes one
/// feature file per day under `features/<symbol>/<variant>/`.
pub fn compute_signals(config: &StudyConfig, symbol: Option<&str>) -> PipelineResult<FeatureRun> {
    let store = open_store(config);
    let symbols = resolve_symbols(&store, symbol)?;
    let variant = config.feature_variant.as_str();

    for sym in &symbols {
        let dir: PathBuf = config.data_root.join(FEATURE_DIR).join(sym).join(variant);
        std::fs::create_dir_all(&dir).map_err(|source| PipelineError::OutputDir { path: dir, source })?;
    }

    let tasks = store.all_tasks(&symbols);
    let names: Vec<String> = config.signals.iter().map(|s| s.name().to_string()).collect();
    info!(variant, days = tasks.len(), features = names.len(), "compute-signals");

    let options = scheduler_options(config);
    let pool = ColumnPool::new(DEFAULT_CHUNK_ROWS, options.workers * 2);
    let limits = config.stream_limits();

    let ((files, rows), summary) = scheduler::run(
        tasks,
        &options,
        &cancel_token(config),
        (0u64, 0u64),
        || Scratch::new(config),
        |scratch, task| {
            let mut cols = pool.checkout();
            load_day(&store, task, &mut scratch.blob, &mut cols)?;
            run_signals(&cols, &mut scratch.signals, limits, &mut scratch.series);

            let path = feature_path(&config.data_root, &task.symbol, variant, task.date);
            FeatureFile::from_series(names.clone(), &scratch.series)
                .and_then(|file| write_feature_file(&path, &file))
                .map_err(|e| {
                    warn!(path = %path.display(), error = %e, "feature file not written");
                    DayOutcome::Failed
                })?;
            Ok(cols.len() as u64)
        },
        |totals: &mut (u64, u64), _, n| {
            totals.0 += 1;
            totals.1 += n;
        },
    );
    Ok(FeatureRun { files, rows, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::TradeRow;
    use crate::signals::SignalSpec;

    fn trending_day(start: i64, n: usize) -> DayColumns {
        // Buys push the price up, sells push it down.
        let mut price = 100.0;
        let rows: Vec<TradeRow> = (0..n)
            .map(|i| {
                let side: i8 = if (i / 3) % 2 == 0 { 1 } else { -1 };
                price += side as f64 * 0.01;
                TradeRow {
                    time_ms: start + i as i64 * 100,
                    price,
                    qty: 1.0,
                    side,
                    matches: 1,
                }
            })
            .collect();
        DayColumns::from_rows(&rows)
    }

    fn config(root: &std::path::Path) -> StudyConfig {
        StudyConfig {
            data_root: root.to_path_buf(),
            horizons_ms: vec![100],
            workers: Some(2),
            signals: vec![SignalSpec::RawSign],
            ..StudyConfig::default()
        }
    }

    #[test]
    fn test_measure_day_shapes() {
        let cfg = StudyConfig {
            horizons_ms: vec![100, 1_000],
            ..config(std::path::Path::new("."))
        };
        let cols = trending_day(0, 300);
        let mut scratch = Scratch::new(&cfg);
        run_signals(&cols, &mut scratch.signals, cfg.stream_limits(), &mut scratch.series);
        let date = NaiveDate::from_ymd_opt(2023, 5, 1).unwrap();
        let day = measure_day(&cfg, &cols, &mut scratch, date);

        assert_eq!(day.signals.len(), 1);
        assert_eq!(day.signals[0].len(), 2);
        // 100ms horizon: every trade but the last has a forward price.
        assert_eq!(day.signals[0][0].moments.count, 299);
        assert_eq!(day.signals[0][1].moments.count, 290);
        assert!(day.signals[0][0].ic > 0.0);
    }

    #[test]
    fn test_analyze_splits_by_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let store = open_store(&cfg);
        let options = Default::default();
        for date in [
            NaiveDate::from_ymd_opt(2023, 12, 30).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        ] {
            store.append_columns("BTCUSDT", date, &trending_day(0, 200), &options).unwrap();
        }

        let result = analyze(&cfg, Some("BTCUSDT"), &SignalSource::Live).unwrap();
        assert_eq!(result.summary.ok, 3);
        let split = &result.signals[0].horizons[0];
        assert_eq!(split.in_sample.daily_ics.len(), 1);
        assert_eq!(split.out_of_sample.daily_ics.len(), 2);
        assert!(split.out_of_sample.daily_ics[0].date < split.out_of_sample.daily_ics[1].date);
        assert!(split.out_of_sample.stats().ic > 0.0);
    }

    #[test]
    fn test_feature_absent_from_later_day_leaves_series_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StudyConfig {
            signals: vec![SignalSpec::RawFlow, SignalSpec::RawSign],
            ..config(dir.path())
        };
        let first = DayTask {
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            symbol: "BTCUSDT".to_string(),
        };
        let second = DayTask {
            date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            symbol: "BTCUSDT".to_string(),
        };
        let both = FeatureFile::from_series(
            vec!["OFI_Raw".to_string(), "TCI_Raw".to_string()],
            &[vec![1.0, 2.0, 3.0], vec![9.0, 9.0, 9.0]],
        )
        .unwrap();
        let flow_only = FeatureFile::from_series(vec!["OFI_Raw".to_string()], &[vec![4.0, 5.0, 6.0]]).unwrap();
        let variant = cfg.feature_variant.clone();
        write_feature_file(&feature_path(dir.path(), "BTCUSDT", &variant, first.date), &both).unwrap();
        write_feature_file(&feature_path(dir.path(), "BTCUSDT", &variant, second.date), &flow_only).unwrap();

        let mut scratch = Scratch::new(&cfg);
        load_features(&cfg, &variant, &first, 3, &mut scratch).unwrap();
        assert_eq!(scratch.series[1], vec![9.0, 9.0, 9.0]);

        load_features(&cfg, &variant, &second, 3, &mut scratch).unwrap();
        assert_eq!(scratch.series[0], vec![4.0, 5.0, 6.0]);
        assert!(scratch.series[1].is_empty());

        // An empty series measures nothing for that signal.
        let cols = trending_day(0, 3);
        let day = measure_day(&cfg, &cols, &mut scratch, second.date);
        assert_eq!(day.signals[1][0].moments.count, 0);
        assert_eq!(day.signals[1][0].ic, 0.0);
    }

    #[test]
    fn test_daily_ic_roundtrips_through_bincode() {
        let ic = DailyIc {
            date: NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            ic: 0.125,
        };
        let bytes = bincode::encode_to_vec(ic, bincode::config::standard()).unwrap();
        let (back, _): (DailyIc, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, ic);
    }
}
