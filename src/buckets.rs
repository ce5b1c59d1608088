//! Equal-count signal buckets and the monotonicity of their mean returns.

use bincode::{Decode, Encode};

use crate::metrics::{pearson, safe_div};

#[derive(Debug, Clone, Copy, Default, PartialEq, Encode, Decode)]
pub struct BucketAgg {
    pub count: u64,
    pub sum_sig: f64,
    pub sum_ret: f64,
}

impl BucketAgg {
    pub fn merge(&mut self, other: &BucketAgg) {
        self.count += other.count;
        self.sum_sig += other.sum_sig;
        self.sum_ret += other.sum_ret;
    }

    pub fn mean_sig(&self) -> f64 {
        safe_div(self.sum_sig, self.count as f64)
    }

    pub fn mean_ret_bps(&self) -> f64 {
        safe_div(self.sum_ret, self.count as f64) * 10_000.0
    }
}

/// K buckets ordered from most negative to most positive signal.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct BucketSet {
    pub buckets: Vec<BucketAgg>,
}

impl BucketSet {
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.count == 0)
    }

    /// Element-wise merge. An empty set adopts the other's width.
    pub fn merge(&mut self, other: &BucketSet) {
        if self.buckets.len() < other.buckets.len() {
            self.buckets.resize(other.buckets.len(), BucketAgg::default());
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            mine.merge(theirs);
        }
    }

    pub fn mean_returns_bps(&self) -> Vec<f64> {
        self.buckets.iter().map(BucketAgg::mean_ret_bps).collect()
    }

    /// Pearson correlation of bucket rank (1..=K) against mean return in bps.
    pub fn monotonicity(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let ranks: Vec<f64> = (1..=self.buckets.len()).map(|r| r as f64).collect();
        pearson(&ranks, &self.mean_returns_bps())
    }
}

/// Buckets every `stride`-th pair of one day. Returns `None` when fewer pairs
/// survive than there are buckets. `scratch` is reused across calls.
pub fn compute_buckets(
    sig: &[f64],
    ret: &[f64],
    num_buckets: usize,
    stride: usize,
    scratch: &mut Vec<(f64, f64)>,
) -> Option<BucketSet> {
    if num_buckets == 0 {
        return None;
    }
    let n = sig.len().min(ret.len());
    scratch.clear();
    scratch.extend(
        (0..n)
            .step_by(stride.max(1))
            .map(|i| (sig[i], ret[i]))
            .filter(|(s, r)| s.is_finite() && r.is_finite()),
    );
    let len = scratch.len();
    if len < num_buckets {
        return None;
    }
    scratch.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    let mut buckets = vec![BucketAgg::default(); num_buckets];
    for (b, agg) in buckets.iter_mut().enumerate() {
        let lo = b * len / num_buckets;
        let hi = (b + 1) * len / num_buckets;
        for &(s, r) in &scratch[lo..hi] {
            agg.count += 1;
            agg.sum_sig += s;
            agg.sum_ret += r;
        }
    }
    Some(BucketSet { buckets })
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::metrics::daily_ic;
    use crate::moments::Moments;

    /// `ret = 1e-4 · sig + noise`, with sig uniform in [-1, 1] and noise
    /// uniform in [-5e-4, 5e-4]. True correlation is about 0.196.
    fn noisy_linear(n: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let sig: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let ret = sig.iter().map(|s| 1e-4 * s + rng.gen_range(-5e-4..5e-4)).collect();
        (sig, ret)
    }

    #[test]
    fn test_noisy_linear_signal_sharpens_with_sample_size() {
        let mut scratch = Vec::new();
        let measure = |n: usize, scratch: &mut Vec<(f64, f64)>| {
            let (sig, ret) = noisy_linear(n, 42);
            let ic = daily_ic(&Moments::from_series(&sig, &ret));
            let mono = compute_buckets(&sig, &ret, 5, 1, scratch).map_or(0.0, |b| b.monotonicity());
            (ic, mono)
        };
        let (ic_small, mono_small) = measure(400, &mut scratch);
        let (ic_large, mono_large) = measure(40_000, &mut scratch);

        assert!(ic_small > 0.0, "{ic_small}");
        assert!(ic_large > 0.0, "{ic_large}");
        assert!((ic_large - 0.196).abs() < 0.03, "{ic_large}");
        assert!(mono_large > 0.99, "{mono_large}");
        assert!(mono_large >= mono_small, "{mono_small} vs {mono_large}");
    }

    #[test]
    fn test_equal_count_split() {
        let sig: Vec<f64> = (0..100).map(|i| (99 - i) as f64).collect();
        let ret: Vec<f64> = sig.iter().map(|s| s * 1e-5).collect();
        let mut scratch = Vec::new();
        let set = compute_buckets(&sig, &ret, 5, 1, &mut scratch).unwrap();

        assert!(set.buckets.iter().all(|b| b.count == 20));
        assert_eq!(set.buckets[0].mean_sig(), 9.5);
        assert!((set.monotonicity() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stride_subsamples() {
        let sig: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut scratch = Vec::new();
        let set = compute_buckets(&sig, &sig, 5, 10, &mut scratch).unwrap();
        let total: u64 = set.buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_too_few_pairs_contribute_nothing() {
        let mut scratch = Vec::new();
        assert!(compute_buckets(&[1.0, 2.0, 3.0], &[0.1, 0.2, 0.3], 5, 1, &mut scratch).is_none());
        assert!(compute_buckets(&[1.0; 40], &[0.0; 40], 5, 10, &mut scratch).is_none());
    }

    #[test]
    fn test_inverse_signal_is_negative() {
        let sig: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let ret: Vec<f64> = sig.iter().map(|s| -s * 1e-4).collect();
        let mut scratch = Vec::new();
        let set = compute_buckets(&sig, &ret, 5, 1, &mut scratch).unwrap();
        assert!((set.monotonicity() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_weights_by_count() {
        let mut a = BucketSet {
            buckets: vec![BucketAgg {
                count: 1,
                sum_sig: 1.0,
                sum_ret: 0.001,
            }],
        };
        let b = BucketSet {
            buckets: vec![BucketAgg {
                count: 3,
                sum_sig: 3.0,
                sum_ret: 0.0,
            }],
        };
        a.merge(&b);
        assert_eq!(a.buckets[0].count, 4);
        assert!((a.buckets[0].mean_ret_bps() - 2.5).abs() < 1e-9);

        let mut empty = BucketSet::default();
        empty.merge(&a);
        assert_eq!(empty, a);
        assert_eq!(BucketSet::default().monotonicity(), 0.0);
    }
}
