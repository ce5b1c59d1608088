//! Study configuration loaded from TOML. Every field has a default, so an
//! empty file (or no file) describes a runnable study.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{DEFAULT_CHUNK_ROWS, MAX_CHUNK_ROWS};
use crate::diagnostics::DiagnosticsConfig;
use crate::error::ConfigError;
use crate::index::DEFAULT_MAX_BLOB_BYTES;
use crate::signals::{SignalSpec, StreamLimits, default_signals};

pub const CONFIG_ENV: &str = "TICKVAULT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// Root of the index store; also holds `features/` and `reports/`.
    pub data_root: PathBuf,
    pub horizons_ms: Vec<i64>,
    /// Days on or after this date are out-of-sample.
    pub oos_cutoff: NaiveDate,
    pub num_buckets: usize,
    pub quantile_stride: usize,
    /// Worker threads; `None` picks from the hardware.
    pub workers: Option<usize>,
    pub queue_capacity: usize,
    pub result_capacity: usize,
    pub progress_interval_ms: u64,
    pub signal_clamp: f64,
    pub min_dt_secs: f64,
    pub verify_checksums: bool,
    pub max_blob_bytes: u64,
    pub chunk_rows: usize,
    pub feature_variant: String,
    /// Stop dispatching new days after this many seconds.
    pub deadline_secs: Option<u64>,
    pub diagnostics: DiagnosticsConfig,
    pub signals: Vec<SignalSpec>,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            horizons_ms: vec![500, 1_000, 2_000, 5_000, 10_000],
            oos_cutoff: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            num_buckets: 5,
            quantile_stride: 10,
            workers: None,
            queue_capacity: 1024,
            result_capacity: 64,
            progress_interval_ms: 500,
            signal_clamp: 50.0,
            min_dt_secs: 1e-4,
            verify_checksums: true,
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            feature_variant: "atoms_v1".to_string(),
            deadline_secs: None,
            diagnostics: DiagnosticsConfig::default(),
            signals: default_signals(),
        }
    }
}

impl StudyConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Loads `path`, else the file named by `TICKVAULT_CONFIG`, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => Self::load(PathBuf::from(p)),
                None => {
                    debug!("no config given, using defaults");
                    let config = Self::default();
                    config.validate()?;
                    Ok(config)
                }
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.horizons_ms.is_empty() {
            return invalid("horizons_ms is empty".into());
        }
        if let Some(h) = self.horizons_ms.iter().find(|h| **h <= 0) {
            return invalid(format!("horizon {h}ms must be positive"));
        }
        if self.num_buckets < 2 {
            return invalid(format!("num_buckets {} must be at least 2", self.num_buckets));
        }
        if self.quantile_stride == 0 {
            return invalid("quantile_stride must be positive".into());
        }
        if self.workers == Some(0) {
            return invalid("workers must be positive".into());
        }
        if self.queue_capacity == 0 || self.result_capacity == 0 {
            return invalid("queue capacities must be positive".into());
        }
        if !(self.signal_clamp > 0.0) || !(self.min_dt_secs > 0.0) {
            return invalid("signal_clamp and min_dt_secs must be positive".into());
        }
        if !(1..=MAX_CHUNK_ROWS).contains(&self.chunk_rows) {
            return invalid(format!("chunk_rows {} outside 1..={MAX_CHUNK_ROWS}", self.chunk_rows));
        }
        if self.feature_variant.is_empty() || self.feature_variant.contains(['/', '\\']) {
            return invalid(format!("feature_variant {:?} is not a directory name", self.feature_variant));
        }
        let d = &self.diagnostics;
        if d.enabled && (d.mi_bins < 2 || !(d.train_fraction > 0.0 && d.train_fraction < 1.0)) {
            return invalid("diagnostics need mi_bins >= 2 and train_fraction in (0, 1)".into());
        }
        if self.signals.is_empty() {
            return invalid("no signals declared".into());
        }
        let mut names: Vec<&str> = self.signals.iter().map(SignalSpec::name).collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            return invalid(format!("signal {:?} declared twice", w[0]));
        }
        if let Some(s) = self.signals.iter().find(|s| s.tau_secs().is_some_and(|t| !(t > 0.0))) {
            return invalid(format!("signal {:?} needs a positive tau_secs", s.name()));
        }
        if let Some(s) = self.signals.iter().find(|s| {
            matches!(s, SignalSpec::Composite { weight_tema, weight_cubic, .. }
                if !weight_tema.is_finite() || !weight_cubic.is_finite())
        }) {
            return invalid(format!("signal {:?} has a non-finite weight", s.name()));
        }
        Ok(())
    }

    pub fn stream_limits(&self) -> StreamLimits {
        StreamLimits {
            clamp: self.signal_clamp,
            min_dt_secs: self.min_dt_secs,
        }
    }

    pub fn is_oos(&self, date: NaiveDate) -> bool {
        date >= self.oos_cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = StudyConfig::from_toml("").unwrap();
        assert_eq!(config.horizons_ms, vec![500, 1_000, 2_000, 5_000, 10_000]);
        assert_eq!(config.num_buckets, 5);
        assert_eq!(config.signals.len(), default_signals().len());
        assert!(config.is_oos(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert!(!config.is_oos(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()));
    }

    #[test]
    fn test_overrides_and_signal_list() {
        let config = StudyConfig::from_toml(
            r#"
            data_root = "/srv/ticks"
            horizons_ms = [1000]
            oos_cutoff = "2023-06-01"
            workers = 3

            [diagnostics]
            enabled = true

            [[signals]]
            kind = "raw_flow"

            [[signals]]
            kind = "ema"
            name = "flow_ema_5s"
            tau_secs = 5.0
            "#,
        )
        .unwrap();
        assert_eq!(config.data_root, PathBuf::from("/srv/ticks"));
        assert_eq!(config.oos_cutoff, NaiveDate::from_ymd_opt(2023, 6, 1).unwrap());
        assert_eq!(config.workers, Some(3));
        assert!(config.diagnostics.enabled);
        assert_eq!(config.diagnostics.mi_bins, 10);
        assert_eq!(config.signals.len(), 2);
        assert_eq!(config.signals[1].name(), "flow_ema_5s");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for text in [
            "horizons_ms = []",
            "horizons_ms = [0]",
            "num_buckets = 1",
            "workers = 0",
            "chunk_rows = 70000",
            "feature_variant = \"a/b\"",
            "[[signals]]\nkind = \"ema\"\nname = \"x\"\ntau_secs = 0.0",
            "[[signals]]\nkind = \"raw_flow\"\n[[signals]]\nkind = \"raw_flow\"",
            "[[signals]]\nkind = \"composite\"\nname = \"m\"\ntau_secs = 1.0\nweight_tema = nan",
        ] {
            assert!(
                matches!(StudyConfig::from_toml(text), Err(ConfigError::Invalid(_))),
                "{text}"
            );
        }
        assert!(matches!(StudyConfig::from_toml("num_buckets = \"five\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.toml");
        std::fs::write(&path, "quantile_stride = 4\n").unwrap();
        assert_eq!(StudyConfig::resolve(Some(path.as_path())).unwrap().quantile_stride, 4);
        assert!(matches!(
            StudyConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
