//! Single-pass, mergeable sums over a (signal, forward return) series.

use std::ops::{Add, AddAssign};

use bincode::{Decode, Encode};

/// Raw sums for one day or any merge of days. Every field adds under merge
/// except `max_run`, which takes the maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Encode, Decode)]
pub struct Moments {
    pub count: u64,
    pub sum_sig: f64,
    pub sum_ret: f64,
    pub sum_prod: f64,
    pub sum_sq_sig: f64,
    pub sum_sq_ret: f64,
    pub sum_pnl: f64,
    pub sum_sq_pnl: f64,
    pub sum_abs_sig: f64,

    pub hits: u64,
    pub valid: u64,

    /// Σ|sig_t − sig_{t−1}|
    pub turnover: f64,
    /// Σ sig_t·sig_{t−1}
    pub lag_prod: f64,
    /// Σ |sig_t|·|sig_{t−1}|
    pub lag_abs_prod: f64,
    pub lag_pairs: u64,

    pub run_count: u64,
    pub run_total: u64,
    pub max_run: u64,
}

#[derive(Default)]
struct RunTracker {
    sign: i8,
    len: u64,
}

impl RunTracker {
    fn step(&mut self, s: f64, m: &mut Moments) {
        let sign = if s > 0.0 {
            1
        } else if s < 0.0 {
            -1
        } else {
            0
        };
        if sign != 0 && sign == self.sign {
            self.len += 1;
            return;
        }
        self.close(m);
        self.sign = sign;
        self.len = u64::from(sign != 0);
    }

    fn close(&mut self, m: &mut Moments) {
        if self.len > 0 {
            m.run_count += 1;
            m.run_total += self.len;
            m.max_run = m.max_run.max(self.len);
        }
        self.len = 0;
    }
}

impl Moments {
    /// Accumulates `sig` against `ret` over their common length. Fewer than two
    /// observations yield the zero value.
    pub fn from_series(sig: &[f64], ret: &[f64]) -> Self {
        let n = sig.len().min(ret.len());
        if n < 2 {
            return Self::default();
        }

        let mut m = Self {
            count: n as u64,
            ..Self::default()
        };
        let mut runs = RunTracker::default();
        let mut prev = sig[0];

        for (i, (&s, &r)) in sig[..n].iter().zip(&ret[..n]).enumerate() {
            m.sum_sig += s;
            m.sum_ret += r;
            m.sum_prod += s * r;
            m.sum_sq_sig += s * s;
            m.sum_sq_ret += r * r;
            m.sum_abs_sig += s.abs();

            let pnl = s * r;
            m.sum_pnl += pnl;
            m.sum_sq_pnl += pnl * pnl;

            if s != 0.0 && r != 0.0 {
                m.valid += 1;
                if (s > 0.0) == (r > 0.0) {
                    m.hits += 1;
                }
            }

            if i > 0 {
                m.turnover += (s - prev).abs();
                m.lag_prod += s * prev;
                m.lag_abs_prod += s.abs() * prev.abs();
                m.lag_pairs += 1;
            }
            prev = s;

            runs.step(s, &mut m);
        }
        runs.close(&mut m);
        m
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn merge(&mut self, other: &Moments) {
        self.count += other.count;
        self.sum_sig += other.sum_sig;
        self.sum_ret += other.sum_ret;
        self.sum_prod += other.sum_prod;
        self.sum_sq_sig += other.sum_sq_sig;
        self.sum_sq_ret += other.sum_sq_ret;
        self.sum_pnl += other.sum_pnl;
        self.sum_sq_pnl += other.sum_sq_pnl;
        self.sum_abs_sig += other.sum_abs_sig;
        self.hits += other.hits;
        self.valid += other.valid;
        self.turnover += other.turnover;
        self.lag_prod += other.lag_prod;
        self.lag_abs_prod += other.lag_abs_prod;
        self.lag_pairs += other.lag_pairs;
        self.run_count += other.run_count;
        self.run_total += other.run_total;
        self.max_run = self.max_run.max(other.max_run);
    }
}

impl AddAssign<&Moments> for Moments {
    fn add_assign(&mut self, rhs: &Moments) {
        self.merge(rhs);
    }
}

impl AddAssign for Moments {
    fn add_assign(&mut self, rhs: Moments) {
        self.merge(&rhs);
    }
}

impl Add for Moments {
    type Output = Moments;

    fn add(mut self, rhs: Moments) -> Moments {
        self.merge(&rhs);
        self
    }
}

impl std::iter::Sum for Moments {
    fn sum<I: Iterator<Item = Moments>>(iter: I) -> Moments {
        iter.fold(Moments::default(), Add::add)
    }
}
