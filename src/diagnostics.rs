//! Secondary per-day diagnostics: binned mutual information and a
//! single-feature logistic model scored out of sample.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::metrics::safe_div;

const PROB_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub mi_bins: usize,
    pub train_fraction: f64,
    pub newton_iters: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mi_bins: 10,
            train_fraction: 0.7,
            newton_iters: 8,
        }
    }
}

/// Mergeable per-day diagnostic sums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Encode, Decode)]
pub struct DiagnosticsAgg {
    pub mi_days: u64,
    pub sum_mi_bits: f64,
    pub sum_nmi: f64,
    pub test_count: u64,
    pub sum_model_loss: f64,
    pub sum_baseline_loss: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiagnosticsStats {
    pub mean_mi_bits: f64,
    pub mean_nmi: f64,
    pub model_log_loss: f64,
    pub baseline_log_loss: f64,
    /// Baseline minus model; positive means the signal helps.
    pub delta_log_loss: f64,
}

impl DiagnosticsAgg {
    pub fn merge(&mut self, other: &DiagnosticsAgg) {
        self.mi_days += other.mi_days;
        self.sum_mi_bits += other.sum_mi_bits;
        self.sum_nmi += other.sum_nmi;
        self.test_count += other.test_count;
        self.sum_model_loss += other.sum_model_loss;
        self.sum_baseline_loss += other.sum_baseline_loss;
    }

    pub fn finalize(&self) -> DiagnosticsStats {
        let days = self.mi_days as f64;
        let tests = self.test_count as f64;
        let model = safe_div(self.sum_model_loss, tests);
        let baseline = safe_div(self.sum_baseline_loss, tests);
        DiagnosticsStats {
            mean_mi_bits: safe_div(self.sum_mi_bits, days),
            mean_nmi: safe_div(self.sum_nmi, days),
            model_log_loss: model,
            baseline_log_loss: baseline,
            delta_log_loss: baseline - model,
        }
    }
}

/// Runs both diagnostics over one day's series.
pub fn evaluate_day(sig: &[f64], ret: &[f64], cfg: &DiagnosticsConfig) -> DiagnosticsAgg {
    let mut agg = DiagnosticsAgg::default();
    if let Some((bits, nmi)) = mutual_information(sig, ret, cfg.mi_bins) {
        agg.mi_days = 1;
        agg.sum_mi_bits = bits;
        agg.sum_nmi = nmi;
    }
    if let Some(fit) = logistic_fit(sig, ret, cfg.train_fraction, cfg.newton_iters) {
        agg.test_count = fit.test_count as u64;
        agg.sum_model_loss = fit.model_loss * fit.test_count as f64;
        agg.sum_baseline_loss = fit.baseline_loss * fit.test_count as f64;
    }
    agg
}

/// Assigns each value an equal-frequency bin in `0..bins`. Ties share the
/// bin of their first rank.
fn equal_frequency_bins(values: &[f64], bins: usize) -> Vec<usize> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_unstable_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut out = vec![0; n];
    let mut rank = 0;
    while rank < n {
        let bin = rank * bins / n;
        let v = values[order[rank]];
        while rank < n && values[order[rank]] == v {
            out[order[rank]] = bin;
            rank += 1;
        }
    }
    out
}

/// Mutual information in bits and normalized by the return entropy. Needs at
/// least two samples per bin.
pub fn mutual_information(sig: &[f64], ret: &[f64], bins: usize) -> Option<(f64, f64)> {
    let n = sig.len().min(ret.len());
    if bins < 2 || n < bins * 2 {
        return None;
    }
    let xs = equal_frequency_bins(&sig[..n], bins);
    let ys = equal_frequency_bins(&ret[..n], bins);

    let mut joint = vec![0u64; bins * bins];
    let mut px = vec![0u64; bins];
    let mut py = vec![0u64; bins];
    for (&x, &y) in xs.iter().zip(&ys) {
        joint[x * bins + y] += 1;
        px[x] += 1;
        py[y] += 1;
    }

    let total = n as f64;
    let mut mi = 0.0;
    for x in 0..bins {
        for y in 0..bins {
            let c = joint[x * bins + y];
            if c == 0 {
                continue;
            }
            let pxy = c as f64 / total;
            let denom = (px[x] as f64 / total) * (py[y] as f64 / total);
            mi += pxy * (pxy / denom).log2();
        }
    }
    let h_ret: f64 = py
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();

    let mi = mi.max(0.0);
    Some((mi, safe_div(mi, h_ret)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogisticFit {
    pub intercept: f64,
    pub slope: f64,
    pub model_loss: f64,
    pub baseline_loss: f64,
    pub test_count: usize,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn log_loss(p: f64, y: bool) -> f64 {
    let p = p.clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
    if y { -p.ln() } else { -(1.0 - p).ln() }
}

/// Fits `P(ret > 0) = σ(a + b·z)` on the first `train_fraction` of the day,
/// where `z` is the signal standardized on that split, using a fixed number
/// of Newton-Raphson steps. Scores the remainder against the constant
/// train-set base rate.
pub fn logistic_fit(sig: &[f64], ret: &[f64], train_fraction: f64, iters: usize) -> Option<LogisticFit> {
    let n = sig.len().min(ret.len());
    let train = ((n as f64) * train_fraction).floor() as usize;
    if train < 2 || train >= n {
        return None;
    }

    let mean = sig[..train].iter().sum::<f64>() / train as f64;
    let var = sig[..train].iter().map(|s| (s - mean).powi(2)).sum::<f64>() / train as f64;
    let sd = var.sqrt();
    let z = |s: f64| if sd > 1e-12 { (s - mean) / sd } else { 0.0 };

    let (mut a, mut b) = (0.0, 0.0);
    for _ in 0..iters {
        let (mut g0, mut g1, mut h00, mut h01, mut h11) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for i in 0..train {
            let x = z(sig[i]);
            let y = if ret[i] > 0.0 { 1.0 } else { 0.0 };
            let p = sigmoid(a + b * x);
            let w = p * (1.0 - p);
            g0 += p - y;
            g1 += (p - y) * x;
            h00 += w;
            h01 += w * x;
            h11 += w * x * x;
        }
        // Small ridge keeps the Hessian invertible on separable data.
        h00 += 1e-9;
        h11 += 1e-9;
        let det = h00 * h11 - h01 * h01;
        if det.abs() < 1e-18 {
            break;
        }
        a -= (h11 * g0 - h01 * g1) / det;
        b -= (h00 * g1 - h01 * g0) / det;
        if !a.is_finite() || !b.is_finite() {
            return None;
        }
    }

    let base_rate = ret[..train].iter().filter(|r| **r > 0.0).count() as f64 / train as f64;
    let test = n - train;
    let (mut model_loss, mut baseline_loss) = (0.0, 0.0);
    for i in train..n {
        let y = ret[i] > 0.0;
        model_loss += log_loss(sigmoid(a + b * z(sig[i])), y);
        baseline_loss += log_loss(base_rate, y);
    }

    Some(LogisticFit {
        intercept: a,
        slope: b,
        model_loss: model_loss / test as f64,
        baseline_loss: baseline_loss / test as f64,
        test_count: test,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy(n: usize) -> (Vec<f64>, Vec<f64>) {
        let mut state = 42u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 11) as f64 / (1u64 << 53) as f64) - 0.5
        };
        let sig: Vec<f64> = (0..n).map(|_| next()).collect();
        let ret: Vec<f64> = sig.iter().map(|s| s + 0.3 * next()).collect();
        (sig, ret)
    }

    #[test]
    fn test_mi_identical_series_equals_entropy() {
        let xs: Vec<f64> = (0..1_000).map(|i| i as f64).collect();
        let (bits, nmi) = mutual_information(&xs, &xs, 10).unwrap();
        assert!((bits - 10f64.log2()).abs() < 1e-9);
        assert!((nmi - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mi_informative_beats_shuffled() {
        let (sig, ret) = noisy(5_000);
        let (informative, _) = mutual_information(&sig, &ret, 10).unwrap();
        let mut shuffled = ret.clone();
        shuffled.reverse();
        let (unrelated, _) = mutual_information(&sig, &shuffled, 10).unwrap();
        assert!(informative > unrelated);
    }

    #[test]
    fn test_mi_needs_samples() {
        assert!(mutual_information(&[1.0; 10], &[1.0; 10], 10).is_none());
    }

    #[test]
    fn test_logistic_beats_baseline_on_informative_signal() {
        let (sig, ret) = noisy(4_000);
        let fit = logistic_fit(&sig, &ret, 0.7, 8).unwrap();
        assert_eq!(fit.test_count, 1_200);
        assert!(fit.slope > 0.0);
        assert!(fit.model_loss < fit.baseline_loss);
    }

    #[test]
    fn test_logistic_constant_signal_matches_baseline() {
        let ret: Vec<f64> = (0..100).map(|i| if i % 4 == 0 { 1.0 } else { -1.0 }).collect();
        let fit = logistic_fit(&[3.0; 100], &ret, 0.5, 8).unwrap();
        assert!((fit.model_loss - fit.baseline_loss).abs() < 1e-6);
    }

    #[test]
    fn test_agg_merge_and_finalize() {
        let (sig, ret) = noisy(2_000);
        let cfg = DiagnosticsConfig {
            enabled: true,
            ..DiagnosticsConfig::default()
        };
        let day = evaluate_day(&sig, &ret, &cfg);
        let mut total = DiagnosticsAgg::default();
        total.merge(&day);
        total.merge(&day);
        assert_eq!(total.mi_days, 2);
        let stats = total.finalize();
        assert!((stats.mean_mi_bits - day.sum_mi_bits).abs() < 1e-12);
        assert!(stats.delta_log_loss > 0.0);
    }
}
