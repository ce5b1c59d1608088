use crate::error::{CodecError, CodecResult, EncodeError};

/// Row-to-row time step, narrowed to the 4-byte on-disk width.
pub fn time_delta(prev: i64, next: i64, row: usize) -> Result<i32, EncodeError> {
    let delta = next
        .checked_sub(prev)
        .ok_or(EncodeError::TimeDeltaOverflow { row, delta: i64::MAX })?;
    i32::try_from(delta).map_err(|_| EncodeError::TimeDeltaOverflow { row, delta })
}

/// Row-to-row step of the fixed-point price column.
pub fn price_delta(prev: i64, next: i64, row: usize) -> Result<i64, EncodeError> {
    next.checked_sub(prev).ok_or(EncodeError::InvalidValue {
        field: "price",
        row,
        value: next as f64,
    })
}

/// Rebuilds absolute values from a chunk base plus deltas.
#[derive(Debug, Clone, Copy)]
pub struct RunningSum {
    acc: i64,
    what: &'static str,
}

impl RunningSum {
    pub fn new(base: i64, what: &'static str) -> Self {
        Self { acc: base, what }
    }

    #[inline]
    pub fn step(&mut self, delta: i64) -> CodecResult<i64> {
        self.acc = self
            .acc
            .checked_add(delta)
            .ok_or(CodecError::Overflow(self.what))?;
        Ok(self.acc)
    }
}

/// Fixed-point conversion for prices and quantities.
pub fn to_fixed(value: f64, scale: f64, field: &'static str, row: usize) -> Result<i64, EncodeError> {
    let scaled = (value * scale).round();
    if !scaled.is_finite() || scaled >= i64::MAX as f64 || scaled <= i64::MIN as f64 {
        return Err(EncodeError::InvalidValue { field, row, value });
    }
    Ok(scaled as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_delta_within_range() {
        assert_eq!(time_delta(1_000, 1_250, 1).unwrap(), 250);
        assert_eq!(time_delta(1_250, 1_000, 1).unwrap(), -250);
    }

    #[test]
    fn test_time_delta_overflow() {
        let gap = i32::MAX as i64 + 1;
        let err = time_delta(0, gap, 7).unwrap_err();
        assert_eq!(err, EncodeError::TimeDeltaOverflow { row: 7, delta: gap });
    }

    #[test]
    fn test_running_sum_reconstructs() {
        let mut sum = RunningSum::new(100, "time");
        let out: Vec<i64> = [0, 5, -2, 10]
            .iter()
            .map(|d| sum.step(*d).unwrap())
            .collect();
        assert_eq!(out, vec![100, 105, 103, 113]);
    }

    #[test]
    fn test_running_sum_overflow_is_error() {
        let mut sum = RunningSum::new(i64::MAX - 1, "price");
        assert!(sum.step(1).is_ok());
        assert_eq!(sum.step(1), Err(CodecError::Overflow("price")));
    }

    #[test]
    fn test_to_fixed_rejects_non_finite() {
        assert!(to_fixed(f64::NAN, 1e8, "price", 0).is_err());
        assert!(to_fixed(f64::INFINITY, 1e8, "price", 0).is_err());
        assert_eq!(to_fixed(1.5, 1e8, "price", 0).unwrap(), 150_000_000);
    }
}
