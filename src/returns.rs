/// Fills `out` with the simple forward return over `horizon_ms` for every
/// trade that has a trade at least `horizon_ms` later, and returns how many
/// that is. Rows past that point have no forward price and are left out, so
/// `out.len()` is the valid prefix length.
///
/// `times` must be non-decreasing; the scan is a single two-pointer pass.
pub fn forward_returns(prices: &[f64], times: &[i64], horizon_ms: i64, out: &mut Vec<f64>) -> usize {
    out.clear();
    let n = prices.len().min(times.len());
    let mut right = 0;
    for left in 0..n {
        let target = times[left].saturating_add(horizon_ms);
        right = right.max(left);
        while right < n && times[right] < target {
            right += 1;
        }
        if right >= n {
            break;
        }
        let start = prices[left];
        out.push(if start > 0.0 {
            (prices[right] - start) / start
        } else {
            0.0
        });
    }
    out.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_returns_truncate_tail() {
        let times = [0, 400, 1_000, 1_500, 2_100];
        let prices = [100.0, 101.0, 102.0, 99.0, 100.0];
        let mut out = Vec::new();
        let valid = forward_returns(&prices, &times, 1_000, &mut out);

        // 0 -> 1000, 400 -> 1500, 1000 -> 2100; 1500 has no trade at 2500.
        assert_eq!(valid, 3);
        assert!((out[0] - 0.02).abs() < 1e-12);
        assert!((out[1] - (99.0 - 101.0) / 101.0).abs() < 1e-12);
        assert!((out[2] - (100.0 - 102.0) / 102.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_price_yields_zero_return() {
        let mut out = Vec::new();
        forward_returns(&[0.0, 5.0], &[0, 10], 5, &mut out);
        assert_eq!(out, vec![0.0]);
    }

    #[test]
    fn test_empty_and_short() {
        let mut out = vec![1.0];
        assert_eq!(forward_returns(&[], &[], 100, &mut out), 0);
        assert!(out.is_empty());
        assert_eq!(forward_returns(&[1.0], &[0], 100, &mut out), 0);
    }
}
