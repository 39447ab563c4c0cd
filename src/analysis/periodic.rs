//! Folding of modulated time series onto one modulation period.

use crate::analysis::binning::Binnable;
use crate::error::{ReadoutError, ReadoutResult};

/// Reshape `array` to `(len / period, period)` and reduce along the first axis.
///
/// The length must be a whole number of periods.
pub fn fold<T, F>(array: &[T], period: usize, reduce: F) -> ReadoutResult<Vec<T>>
where
    T: Copy,
    F: Fn(&[T]) -> T,
{
    if period == 0 {
        return Err(ReadoutError::InvalidArgument("fold period must be positive".to_string()));
    }
    if array.len() % period != 0 {
        return Err(ReadoutError::Shape(format!(
            "cannot fold {} samples with period {}",
            array.len(),
            period
        )));
    }
    let cycles = array.len() / period;
    let mut column = Vec::with_capacity(cycles);
    Ok((0..period)
        .map(|phase| {
            column.clear();
            column.extend((0..cycles).map(|c| array[c * period + phase]));
            reduce(&column)
        })
        .collect())
}

/// [`fold`] with the mean as the reduction.
pub fn fold_mean<T: Binnable>(array: &[T], period: usize) -> ReadoutResult<Vec<T>> {
    fold(array, period, |column| {
        column.iter().fold(T::zero(), |acc, &v| acc + v) / column.len().max(1) as f64
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_mean() {
        let x = [1.0, 10.0, 3.0, 20.0, 5.0, 30.0];
        assert_eq!(fold_mean(&x, 2).unwrap(), vec![3.0, 20.0]);
    }

    #[test]
    fn test_fold_custom_reduce() {
        let x = [1.0, 10.0, 3.0, 20.0];
        let max = fold(&x, 2, |c| c.iter().cloned().fold(f64::MIN, f64::max)).unwrap();
        assert_eq!(max, vec![3.0, 20.0]);
    }

    #[test]
    fn test_fold_rejects_partial_period() {
        assert!(fold_mean(&[1.0, 2.0, 3.0], 2).is_err());
        assert!(fold_mean(&[1.0, 2.0], 0).is_err());
    }
}
