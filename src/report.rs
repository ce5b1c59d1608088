//! Plain-text tables over a finished study.

use std::fmt;

use crate::pipeline::{HorizonAgg, StudyResult};
use crate::validate::ValidationReport;

const METRIC_HEADER: [&str; 18] = [
    "SET", "COUNT", "IC", "IC_T", "Sharpe", "HitRate", "B/E_Bps", "AutoCorr", "AutoCorrAbs", "AvgSeg",
    "MaxSeg", "MeanSig", "StdSig", "MeanRet", "StdRet", "MeanPnL", "StdPnL", "IC_Days",
];

/// Display adapter: `StudyReport(&study).to_string()`.
pub struct StudyReport<'a>(pub &'a StudyResult);

impl StudyReport<'_> {
    fn name_width(&self) -> usize {
        self.0
            .signals
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(0)
            .max("FEATURE".len())
    }

    fn samples(&self, h: usize) -> impl Iterator<Item = (&str, &str, &HorizonAgg)> {
        self.0.signals.iter().flat_map(move |s| {
            s.horizons.get(h).into_iter().flat_map(move |split| {
                [("IS", &split.in_sample), ("OOS", &split.out_of_sample)]
                    .into_iter()
                    .map(move |(set, agg)| (s.name.as_str(), set, agg))
            })
        })
    }

    fn horizons(&self) -> Vec<i64> {
        self.0
            .signals
            .first()
            .map(|s| s.horizons.iter().map(|h| h.horizon_ms).collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for StudyReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let study = self.0;
        let s = &study.summary;
        writeln!(
            f,
            "== {} ({}) | OOS from {} | ok {} missing {} corrupt {} empty {} failed {} skipped {}",
            study.label, study.source, study.oos_cutoff, s.ok, s.missing, s.corrupt, s.empty, s.failed, s.skipped
        )?;

        let w = self.name_width();
        let show_diagnostics = study
            .signals
            .iter()
            .flat_map(|s| &s.horizons)
            .any(|h| h.in_sample.diagnostics.mi_days > 0 || h.out_of_sample.diagnostics.mi_days > 0);

        for (h, horizon_ms) in self.horizons().into_iter().enumerate() {
            writeln!(f, "\n-- horizon {horizon_ms}ms --")?;
            write!(f, "{:<w$}", "FEATURE")?;
            for col in METRIC_HEADER {
                write!(f, " {col:>11}")?;
            }
            writeln!(f)?;
            for (name, set, agg) in self.samples(h) {
                let m = agg.stats();
                write!(f, "{name:<w$} {set:>11} {:>11}", m.count)?;
                for v in [
                    m.ic,
                    m.ic_t_stat,
                    m.sharpe,
                    m.hit_rate,
                    m.breakeven_bps,
                    m.autocorr,
                    m.autocorr_abs,
                    m.avg_run,
                ] {
                    write!(f, " {v:>11.4}")?;
                }
                write!(f, " {:>11}", m.max_run)?;
                for v in [m.mean_sig, m.std_sig, m.mean_ret, m.std_ret, m.mean_pnl, m.std_pnl] {
                    write!(f, " {v:>11.3e}")?;
                }
                writeln!(f, " {:>11}", m.ic_days)?;
            }

            let k = self
                .samples(h)
                .map(|(_, _, agg)| agg.buckets.buckets.len())
                .max()
                .unwrap_or(0);
            if k > 0 {
                writeln!(f, "\n-- monotonicity {horizon_ms}ms (bucket mean return, bps) --")?;
                write!(f, "{:<w$} {:>5} {:>8}", "FEATURE", "SET", "MONO")?;
                for b in 1..=k {
                    write!(f, " {:>9}", format!("B{b}"))?;
                }
                writeln!(f)?;
                for (name, set, agg) in self.samples(h) {
                    write!(f, "{name:<w$} {set:>5} {:>8.3}", agg.buckets.monotonicity())?;
                    for bps in agg.buckets.mean_returns_bps() {
                        write!(f, " {bps:>9.3}")?;
                    }
                    writeln!(f)?;
                }
            }

            if show_diagnostics {
                writeln!(f, "\n-- diagnostics {horizon_ms}ms --")?;
                writeln!(
                    f,
                    "{:<w$} {:>5} {:>9} {:>9} {:>9} {:>9} {:>9}",
                    "FEATURE", "SET", "MI_Bits", "NMI", "LogLoss", "Baseline", "dLogLoss"
                )?;
                for (name, set, agg) in self.samples(h) {
                    let d = agg.diagnostics.finalize();
                    writeln!(
                        f,
                        "{name:<w$} {set:>5} {:>9.5} {:>9.5} {:>9.5} {:>9.5} {:>9.5}",
                        d.mean_mi_bits, d.mean_nmi, d.model_log_loss, d.baseline_log_loss, d.delta_log_loss
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Display adapter for validation results; clean periods get one line.
pub struct ValidationSummary<'a>(pub &'a ValidationReport);

impl fmt::Display for ValidationSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        for p in &report.periods {
            let status = if p.is_clean() { "OK" } else { "ISSUES" };
            writeln!(
                f,
                "{} {:04}-{:02} {:<6} days {:>2} trades {:>10} bytes {:>12}",
                p.symbol, p.period.year, p.period.month, status, p.days, p.trades, p.bytes
            )?;
            for issue in &p.issues {
                writeln!(f, "    {issue}")?;
            }
        }
        let s = &report.summary;
        writeln!(
            f,
            "{} periods checked, {} issues, {} unreadable indexes",
            report.periods.len(),
            report.issue_count(),
            s.corrupt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::{BucketAgg, BucketSet};
    use crate::moments::Moments;
    use crate::pipeline::{HorizonSplit, SignalAgg};

    fn study() -> StudyResult {
        let sig = [1.0, 2.0, 3.0, 4.0];
        let ret = [0.01, 0.02, 0.03, 0.04];
        let mut split = HorizonSplit {
            horizon_ms: 500,
            ..HorizonSplit::default()
        };
        split.in_sample.moments = Moments::from_series(&sig, &ret);
        split.in_sample.buckets = BucketSet {
            buckets: vec![
                BucketAgg {
                    count: 2,
                    sum_sig: 3.0,
                    sum_ret: 0.03,
                },
                BucketAgg {
                    count: 2,
                    sum_sig: 7.0,
                    sum_ret: 0.07,
                },
            ],
        };
        StudyResult {
            label: "BTCUSDT".to_string(),
            source: "live".to_string(),
            oos_cutoff: "2024-01-01".to_string(),
            signals: vec![SignalAgg {
                name: "OFI_EMA_15s".to_string(),
                horizons: vec![split],
            }],
            ..StudyResult::default()
        }
    }

    #[test]
    fn test_report_has_tables_per_horizon() {
        let text = StudyReport(&study()).to_string();
        assert!(text.starts_with("== BTCUSDT (live)"));
        assert!(text.contains("-- horizon 500ms --"));
        assert!(text.contains("B/E_Bps"));
        assert!(text.contains("-- monotonicity 500ms"));
        assert!(!text.contains("-- diagnostics"));

        let is_row = text
            .lines()
            .find(|l| l.starts_with("OFI_EMA_15s") && l.contains(" IS "))
            .unwrap();
        assert!(is_row.contains("1.0000"));
        // IS and OOS rows in both tables.
        assert_eq!(text.lines().filter(|l| l.starts_with("OFI_EMA_15s")).count(), 4);
    }

    #[test]
    fn test_empty_study_renders_header_only() {
        let text = StudyReport(&StudyResult::default()).to_string();
        assert_eq!(text.lines().count(), 1);
    }
}
