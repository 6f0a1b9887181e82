/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Linear-interpolation quantile over values already sorted ascending.
///
/// For `q` in `[0, 1]` over `n` values, the rank is `q * (n - 1)` and the
/// result interpolates between the two order statistics around it.
/// Returns `None` for empty input.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + frac * (sorted[hi] - sorted[lo]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 3.0]), 2.0);
    }

    #[test]
    fn test_quantile_single_value() {
        assert_eq!(quantile_sorted(&[7.0], 0.9), Some(7.0));
        assert_eq!(quantile_sorted(&[], 0.9), None);
    }

    #[test]
    fn test_quantile_interpolates_between_order_statistics() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();

        // rank = 0.8 * 9 = 7.2 -> 8 + 0.2 * (9 - 8)
        assert!((quantile_sorted(&values, 0.8).unwrap() - 8.2).abs() < 1e-9);
        // rank = 0.9 * 9 = 8.1 -> 9.1
        assert!((quantile_sorted(&values, 0.9).unwrap() - 9.1).abs() < 1e-9);
        // rank = 0.95 * 9 = 8.55 -> 9.55
        assert!((quantile_sorted(&values, 0.95).unwrap() - 9.55).abs() < 1e-9);
        assert_eq!(quantile_sorted(&values, 0.0), Some(1.0));
        assert_eq!(quantile_sorted(&values, 1.0), Some(10.0));
    }

    #[test]
    fn test_quantile_exact_rank() {
        // rank = 0.5 * 4 = 2, no interpolation.
        assert_eq!(quantile_sorted(&[-3.0, 0.0, 2.0, 5.0, 9.0], 0.5), Some(2.0));
    }
}
