//! Pure finalization of [`Moments`] into reportable statistics.

use crate::moments::Moments;

/// Denominators at or below this are treated as degenerate.
pub const DEGENERATE_EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricStats {
    pub count: u64,
    pub ic: f64,
    pub ic_t_stat: f64,
    pub ic_days: usize,
    pub mean_daily_ic: f64,
    pub sharpe: f64,
    pub sharpe_t: f64,
    pub hit_rate: f64,
    pub breakeven_bps: f64,
    pub autocorr: f64,
    pub autocorr_abs: f64,
    pub avg_run: f64,
    pub max_run: u64,
    pub mean_sig: f64,
    pub std_sig: f64,
    pub mean_ret: f64,
    pub std_ret: f64,
    pub mean_pnl: f64,
    pub std_pnl: f64,
}

/// `num / den`, or zero when the denominator is degenerate or the result is
/// not finite.
#[inline]
pub fn safe_div(num: f64, den: f64) -> f64 {
    if !(den > DEGENERATE_EPS) {
        return 0.0;
    }
    let q = num / den;
    if q.is_finite() { q } else { 0.0 }
}

/// Population variance from raw sums, with cancellation noise snapped to zero.
fn variance(mean: f64, mean_sq: f64) -> f64 {
    let var = mean_sq - mean * mean;
    if var <= mean_sq.abs() * 1e-12 { 0.0 } else { var }
}

/// `n·Σx² − (Σx)²`, snapped to zero when it is within rounding of the raw
/// sum of squares.
fn spread(n: f64, sum: f64, sum_sq: f64) -> f64 {
    let den = n * sum_sq - sum * sum;
    if den <= n * sum_sq.abs() * 1e-12 { 0.0 } else { den }
}

/// Pearson correlation from raw sums. Zero when either side is constant.
pub fn pearson_from_sums(n: f64, sx: f64, sy: f64, sxy: f64, sxx: f64, syy: f64) -> f64 {
    let num = n * sxy - sx * sy;
    let den_x = spread(n, sx, sxx);
    let den_y = spread(n, sy, syy);
    if den_x == 0.0 || den_y == 0.0 {
        return 0.0;
    }
    safe_div(num, (den_x * den_y).sqrt())
}

pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let (mut sx, mut sy, mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        sx += x;
        sy += y;
        sxy += x * y;
        sxx += x * x;
        syy += y * y;
    }
    pearson_from_sums(n as f64, sx, sy, sxy, sxx, syy)
}

/// Same-day IC, as recorded per (day, signal, horizon).
pub fn daily_ic(m: &Moments) -> f64 {
    if m.count <= 1 {
        return 0.0;
    }
    pearson_from_sums(
        m.count as f64,
        m.sum_sig,
        m.sum_ret,
        m.sum_prod,
        m.sum_sq_sig,
        m.sum_sq_ret,
    )
}

/// t-statistic of the mean daily IC. Non-finite and exactly-zero entries
/// (days without a usable IC) are dropped first; needs two survivors.
pub fn ic_t_stat(daily_ics: &[f64]) -> (f64, usize, f64) {
    let usable: Vec<f64> = daily_ics
        .iter()
        .copied()
        .filter(|ic| ic.is_finite() && *ic != 0.0)
        .collect();
    let d = usable.len();
    if d < 2 {
        let mean = usable.first().copied().unwrap_or(0.0);
        return (0.0, d, mean);
    }
    let mean = usable.iter().sum::<f64>() / d as f64;
    let ss: f64 = usable.iter().map(|ic| (ic - mean).powi(2)).sum();
    let sd = (ss / (d - 1) as f64).sqrt();
    (safe_div(mean, sd / (d as f64).sqrt()), d, mean)
}

pub fn finalize(m: &Moments, daily_ics: &[f64]) -> MetricStats {
    if m.count <= 1 {
        return MetricStats::default();
    }
    let n = m.count as f64;

    let mean_sig = m.sum_sig / n;
    let mean_ret = m.sum_ret / n;
    let mean_pnl = m.sum_pnl / n;
    let var_sig = variance(mean_sig, m.sum_sq_sig / n);
    let var_ret = variance(mean_ret, m.sum_sq_ret / n);
    let var_pnl = variance(mean_pnl, m.sum_sq_pnl / n);

    let sharpe = safe_div(mean_pnl, var_pnl.sqrt());
    let (ic_t, ic_days, mean_daily_ic) = ic_t_stat(daily_ics);

    let pairs = m.lag_pairs as f64;
    let breakeven_bps = safe_div(mean_pnl, safe_div(m.turnover, pairs)) * 10_000.0;

    let (autocorr, autocorr_abs) = if m.lag_pairs == 0 {
        (0.0, 0.0)
    } else {
        let mean_abs = m.sum_abs_sig / n;
        let var_abs = variance(mean_abs, m.sum_sq_sig / n);
        (
            safe_div(m.lag_prod / pairs - mean_sig * mean_sig, var_sig),
            safe_div(m.lag_abs_prod / pairs - mean_abs * mean_abs, var_abs),
        )
    };

    MetricStats {
        count: m.count,
        ic: daily_ic(m),
        ic_t_stat: ic_t,
        ic_days,
        mean_daily_ic,
        sharpe,
        sharpe_t: sharpe * n.sqrt(),
        hit_rate: safe_div(m.hits as f64, m.valid as f64),
        breakeven_bps: if breakeven_bps.is_finite() { breakeven_bps } else { 0.0 },
        autocorr,
        autocorr_abs,
        avg_run: safe_div(m.run_total as f64, m.run_count as f64),
        max_run: m.max_run,
        mean_sig,
        std_sig: var_sig.sqrt(),
        mean_ret,
        std_ret: var_ret.sqrt(),
        mean_pnl,
        std_pnl: var_pnl.sqrt(),
    }
}
